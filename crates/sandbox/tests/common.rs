//! Shared helpers for sandbox integration tests

#![allow(dead_code)]

use std::fs;
use std::path::Path;

use editgate_sandbox::{CommandSandbox, SandboxPolicy};

pub struct Tmp {
    pub dir: tempfile::TempDir,
}

impl Tmp {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, data: &str) {
        let p = self.path().join(rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(p, data).unwrap();
    }

    pub fn sandbox(&self, policy: SandboxPolicy) -> CommandSandbox {
        CommandSandbox::new(self.path(), policy).unwrap()
    }
}
