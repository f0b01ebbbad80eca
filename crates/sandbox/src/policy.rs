use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::backend::ResourceLimits;
use crate::deny::DenyPattern;

pub const DEFAULT_CPU_TIME_SECS: u64 = 60;
pub const DEFAULT_WALL_TIMEOUT_SECS: u64 = 45;
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MAX_OPEN_FILES: u64 = 1024;
pub const DEFAULT_REAP_GRACE_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("sandbox.{0} must be greater than zero")]
    Zero(&'static str),
    #[error("invalid deny pattern '{pattern}': {reason}")]
    BadPattern { pattern: String, reason: String },
}

/// What to do when network access is denied but the platform cannot
/// isolate the command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkIsolation {
    /// Run without isolation, log a warning and report it in the result.
    #[default]
    BestEffort,
    /// Refuse to run the command.
    Required,
}

/// The resource and permission envelope for one command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxPolicy {
    pub allow_network: bool,
    pub network_isolation: NetworkIsolation,
    pub cpu_time_secs: u64,
    pub wall_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub memory_limit_mb: Option<u64>,
    pub max_open_files: Option<u64>,
    pub max_processes: Option<u64>,
    /// Extra time granted for reaping and draining pipes after a kill.
    pub reap_grace_ms: u64,
    /// Variables inherited from the caller's environment; everything else is
    /// dropped.
    pub env_allowlist: Vec<String>,
    /// Variables set explicitly for every command.
    pub extra_env: BTreeMap<String, String>,
    /// Checked in addition to the built-in denial patterns.
    pub extra_deny_patterns: Vec<DenyPattern>,
    /// Project-relative directory used when the caller gives no cwd.
    pub working_dir: Option<PathBuf>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            allow_network: false,
            network_isolation: NetworkIsolation::BestEffort,
            cpu_time_secs: DEFAULT_CPU_TIME_SECS,
            wall_timeout_secs: DEFAULT_WALL_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            memory_limit_mb: None,
            max_open_files: Some(DEFAULT_MAX_OPEN_FILES),
            max_processes: None,
            reap_grace_ms: DEFAULT_REAP_GRACE_MS,
            env_allowlist: ["PATH", "LANG", "LC_ALL", "LC_CTYPE", "TZ", "TERM"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extra_env: BTreeMap::new(),
            extra_deny_patterns: Vec::new(),
            working_dir: None,
        }
    }
}

impl SandboxPolicy {
    pub fn with_wall_timeout_secs(mut self, secs: u64) -> Self {
        self.wall_timeout_secs = secs;
        self
    }

    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.cpu_time_secs == 0 {
            return Err(PolicyError::Zero("cpu_time_secs"));
        }
        if self.wall_timeout_secs == 0 {
            return Err(PolicyError::Zero("wall_timeout_secs"));
        }
        if self.max_output_bytes == 0 {
            return Err(PolicyError::Zero("max_output_bytes"));
        }
        if self.memory_limit_mb == Some(0) {
            return Err(PolicyError::Zero("memory_limit_mb"));
        }
        if self.max_open_files == Some(0) {
            return Err(PolicyError::Zero("max_open_files"));
        }
        if self.max_processes == Some(0) {
            return Err(PolicyError::Zero("max_processes"));
        }
        Ok(())
    }

    pub fn wall_timeout(&self) -> Duration {
        Duration::from_secs(self.wall_timeout_secs)
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_millis(self.reap_grace_ms)
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_time_secs: self.cpu_time_secs,
            memory_bytes: self
                .memory_limit_mb
                .map(|mb| mb.saturating_mul(1024 * 1024)),
            max_open_files: self.max_open_files,
            max_processes: self.max_processes,
            isolate_network: !self.allow_network,
            require_network_isolation: self.network_isolation == NetworkIsolation::Required,
        }
    }
}
