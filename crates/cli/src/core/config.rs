//! # Engine Configuration
//!
//! Configuration is loaded from multiple sources in order of precedence:
//! 1. Environment variables (EDITGATE_*)
//! 2. Configuration file (`$EDITGATE_CONFIG`, `.editgate/config.toml`, `editgate.toml`)
//! 3. Built-in defaults
//!
//! Every section is `#[serde(default)]`, so a file only needs the keys it
//! changes.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use editgate_common::limits::{clamp, env_bool, env_u64, LimitError};
use editgate_common::STATE_DIR;
use editgate_sandbox::SandboxPolicy;

use crate::core::errors::{CoreError, CoreResult};

const DEFAULT_MAX_WRITE_BYTES: usize = 2 * 1024 * 1024;
const DEFAULT_SNAPSHOT_RETAIN: usize = 20;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sandbox: SandboxPolicy,
    pub apply: ApplyConfig,
    pub snapshots: SnapshotConfig,
    pub commands: CommandsConfig,
}

/// Batch application policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyConfig {
    /// Let `create` replace an existing file instead of failing.
    pub allow_create_overwrite: bool,
    /// Fail `delete` when the file is already absent.
    pub strict_delete: bool,
    pub max_write_bytes: usize,
    /// Run the plan's post-checks after a committed batch.
    pub run_post_checks: bool,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            allow_create_overwrite: false,
            strict_delete: false,
            max_write_bytes: DEFAULT_MAX_WRITE_BYTES,
            run_post_checks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Snapshots kept after each commit, newest first.
    pub retain: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            retain: DEFAULT_SNAPSHOT_RETAIN,
        }
    }
}

/// Explicit verification commands, preferred over marker-file detection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub test: Option<String>,
    pub lint: Option<String>,
}

impl EngineConfig {
    /// Load the configuration for a project rooted at `root`.
    pub fn load(root: &Path) -> CoreResult<Self> {
        let mut config = match Self::discover_config_path(root) {
            Some(path) => Self::load_from_path(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides().map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse one TOML file without env overrides or validation.
    pub fn load_from_path(path: &Path) -> CoreResult<Self> {
        let contents =
            fs::read_to_string(path).map_err(|e| CoreError::io(path.to_path_buf(), "read config", e))?;
        toml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))
    }

    fn discover_config_path(root: &Path) -> Option<PathBuf> {
        if let Ok(from_env) = env::var("EDITGATE_CONFIG") {
            let trimmed = from_env.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }

        [
            root.join(STATE_DIR).join("config.toml"),
            root.join("editgate.toml"),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
    }

    fn apply_env_overrides(&mut self) -> Result<(), LimitError> {
        let sandbox = &mut self.sandbox;
        if let Some(secs) = env_u64("EDITGATE_EXEC_TIMEOUT")? {
            sandbox.wall_timeout_secs = clamp(secs, 1, 3600);
        }
        if let Some(secs) = env_u64("EDITGATE_EXEC_CPU_SECS")? {
            sandbox.cpu_time_secs = clamp(secs, 1, 3600);
        }
        if let Some(allow) = env_bool("EDITGATE_EXEC_NET")? {
            sandbox.allow_network = allow;
        }
        if let Some(bytes) = env_u64("EDITGATE_MAX_OUTPUT_BYTES")? {
            sandbox.max_output_bytes = clamp(bytes, 1024, 64 * 1024 * 1024) as usize;
        }
        if let Some(mb) = env_u64("EDITGATE_MAX_WRITE_MB")? {
            self.apply.max_write_bytes = clamp(mb, 1, 1024) as usize * 1024 * 1024;
        }
        if let Some(retain) = env_u64("EDITGATE_SNAPSHOT_RETAIN")? {
            self.snapshots.retain = clamp(retain, 1, 1000) as usize;
        }
        Ok(())
    }

    pub fn validate(&self) -> CoreResult<()> {
        self.sandbox
            .validate()
            .map_err(|e| CoreError::Config(e.to_string()))?;
        if self.apply.max_write_bytes == 0 {
            return Err(CoreError::Config(
                "apply.max_write_bytes must be greater than zero".to_string(),
            ));
        }
        if self.snapshots.retain == 0 {
            return Err(CoreError::Config(
                "snapshots.retain must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "EDITGATE_CONFIG",
            "EDITGATE_EXEC_TIMEOUT",
            "EDITGATE_EXEC_CPU_SECS",
            "EDITGATE_EXEC_NET",
            "EDITGATE_MAX_OUTPUT_BYTES",
            "EDITGATE_MAX_WRITE_MB",
            "EDITGATE_SNAPSHOT_RETAIN",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_without_a_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(!config.apply.allow_create_overwrite);
        assert!(!config.sandbox.allow_network);
    }

    #[test]
    fn file_values_then_env_overrides() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("editgate.toml"),
            r#"
                [sandbox]
                wall_timeout_secs = 5
                env_allowlist = ["PATH", "PYTHONPATH"]

                [apply]
                allow_create_overwrite = true

                [commands]
                test = "make check"
            "#,
        )
        .unwrap();

        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.wall_timeout_secs, 5);
        assert_eq!(config.sandbox.env_allowlist, vec!["PATH", "PYTHONPATH"]);
        assert!(config.apply.allow_create_overwrite);
        assert_eq!(config.commands.test.as_deref(), Some("make check"));
        assert_eq!(config.snapshots.retain, DEFAULT_SNAPSHOT_RETAIN);

        env::set_var("EDITGATE_EXEC_TIMEOUT", "9");
        env::set_var("EDITGATE_EXEC_NET", "allow");
        env::set_var("EDITGATE_MAX_WRITE_MB", "3");
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.sandbox.wall_timeout_secs, 9);
        assert!(config.sandbox.allow_network);
        assert_eq!(config.apply.max_write_bytes, 3 * 1024 * 1024);
        clear_env();
    }

    #[test]
    fn state_dir_config_takes_precedence_over_root_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        fs::write(dir.path().join(STATE_DIR).join("config.toml"), "[snapshots]\nretain = 3\n").unwrap();
        fs::write(dir.path().join("editgate.toml"), "[snapshots]\nretain = 7\n").unwrap();

        assert_eq!(EngineConfig::load(dir.path()).unwrap().snapshots.retain, 3);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("editgate.toml"), "[sandbox]\nwall_timeout_secs = 0\n").unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(CoreError::Config(_))
        ));

        fs::write(dir.path().join("editgate.toml"), "[apply]\nmax_write_bytes = 0\n").unwrap();
        let err = EngineConfig::load(dir.path()).unwrap_err();
        assert_eq!(err.error_code(), "E_CONFIG");

        fs::write(dir.path().join("editgate.toml"), "[sandbox\n").unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(CoreError::Config(_))
        ));

        env::set_var("EDITGATE_EXEC_TIMEOUT", "soon");
        fs::remove_file(dir.path().join("editgate.toml")).unwrap();
        assert!(matches!(
            EngineConfig::load(dir.path()),
            Err(CoreError::Config(_))
        ));
        clear_env();
    }
}
