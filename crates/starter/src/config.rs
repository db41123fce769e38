use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StarterError, StarterResult};

pub(crate) const DEFAULT_EXEC_TRANSFER_ATTEMPTS: u32 = 3;
pub(crate) const DEFAULT_SETTLE_DELAY_MS: u64 = 5000;
pub(crate) const DEFAULT_SLOP_KB: u64 = 50;
pub(crate) const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment switch that disables the executable link check.
pub const NOCHECK_ENV: &str = "_CONDOR_NOCHECK";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StarterConfig {
    pub execute_dir: PathBuf,
    pub this_host: Option<String>,
    pub initiating_host: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub macros: BTreeMap<String, String>,
    #[serde(default)]
    pub job: JobConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub exec_transfer_attempts: u32,
    pub renice_increment: i32,
    pub allow_root: bool,
    pub skip_link_check: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            exec_transfer_attempts: DEFAULT_EXEC_TRANSFER_ATTEMPTS,
            renice_increment: 0,
            allow_root: false,
            skip_link_check: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub settle_delay_ms: u64,
    pub slop_kb: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            slop_kb: DEFAULT_SLOP_KB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub port_range: Option<PortRange>,
    pub bind_all_interfaces: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port_range: None,
            bind_all_interfaces: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

/// Load and validate a starter config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub fn load(path: &Path) -> StarterResult<StarterConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| StarterError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: StarterConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| StarterError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

impl StarterConfig {
    /// Config with every optional setting at its default.
    pub fn new(execute_dir: impl Into<PathBuf>) -> Self {
        Self {
            execute_dir: execute_dir.into(),
            this_host: None,
            initiating_host: None,
            log_level: default_log_level(),
            macros: BTreeMap::new(),
            job: JobConfig::default(),
            checkpoint: CheckpointConfig::default(),
            network: NetworkConfig::default(),
        }
    }

    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if self.execute_dir.is_relative() {
            self.execute_dir = config_dir.join(&self.execute_dir);
        }
    }

    fn validate(&self) -> StarterResult<()> {
        if !self.execute_dir.is_dir() {
            return Err(StarterError::Config(format!(
                "execute_dir not found: {}",
                self.execute_dir.display()
            )));
        }
        if self.job.exec_transfer_attempts == 0 {
            return Err(StarterError::Config(
                "job.exec_transfer_attempts must be at least 1".into(),
            ));
        }
        if let Some(range) = self.network.port_range
            && range.low > range.high
        {
            return Err(StarterError::Config(format!(
                "network.port_range: low {} above high {}",
                range.low, range.high
            )));
        }
        Ok(())
    }

    /// This machine's name for `host:path` executables.
    pub fn this_host(&self) -> String {
        match &self.this_host {
            Some(h) => h.clone(),
            None => nix::unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default(),
        }
    }

    pub fn link_check_disabled(&self) -> bool {
        self.job.skip_link_check || std::env::var(NOCHECK_ENV).is_ok_and(|v| v == "1")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("execute")).unwrap();
        let yaml = r#"
execute_dir: execute
this_host: exec1
initiating_host: submit1
log_level: debug
macros:
  ARCH: X86_64
job:
  exec_transfer_attempts: 5
  renice_increment: 10
  allow_root: true
checkpoint:
  settle_delay_ms: 0
network:
  port_range: { low: 9600, high: 9700 }
  bind_all_interfaces: false
"#;
        let path = dir.path().join("starter.yaml");
        std::fs::write(&path, yaml).unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.execute_dir, dir.path().join("execute"));
        assert_eq!(config.this_host(), "exec1");
        assert_eq!(config.initiating_host.as_deref(), Some("submit1"));
        assert_eq!(config.macros.get("ARCH").map(String::as_str), Some("X86_64"));
        assert_eq!(config.job.exec_transfer_attempts, 5);
        assert_eq!(config.job.renice_increment, 10);
        assert!(config.job.allow_root);
        assert!(!config.job.skip_link_check);
        assert_eq!(config.checkpoint.settle_delay_ms, 0);
        assert_eq!(config.checkpoint.slop_kb, DEFAULT_SLOP_KB);
        assert_eq!(
            config.network.port_range,
            Some(PortRange {
                low: 9600,
                high: 9700
            })
        );
        assert!(!config.network.bind_all_interfaces);
    }

    #[test]
    fn load_minimal_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("starter.yaml");
        std::fs::write(&path, format!("execute_dir: {}\n", dir.path().display())).unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config, StarterConfig::new(dir.path()));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.job.exec_transfer_attempts, 3);
        assert_eq!(config.checkpoint.settle_delay_ms, 5000);
        assert!(config.network.bind_all_interfaces);
    }

    #[test]
    fn load_missing_execute_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("starter.yaml");
        std::fs::write(&path, "execute_dir: nowhere\n").unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("execute_dir not found"), "{err}");
    }

    #[test]
    fn load_rejects_inverted_port_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("starter.yaml");
        std::fs::write(
            &path,
            "execute_dir: .\nnetwork:\n  port_range: { low: 10, high: 9 }\n",
        )
        .unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("port_range"), "{err}");
    }

    #[test]
    fn load_rejects_zero_transfer_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("starter.yaml");
        std::fs::write(&path, "execute_dir: .\njob:\n  exec_transfer_attempts: 0\n").unwrap();
        assert!(matches!(load(&path), Err(StarterError::Config(_))));
    }

    #[test]
    fn load_missing_file_fails() {
        let err = load(Path::new("/nonexistent/starter.yaml")).unwrap_err();
        assert!(err.to_string().contains("read"), "{err}");
    }
}
