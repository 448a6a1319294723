//! Daemon configuration.
//!
//! Precedence: defaults, then the optional `$FOG_HOME/config` key=value
//! file, then environment overrides (`FOG_HOME`, `FOG_PORT`,
//! `FOG_MAX_PARALLEL`).

use crate::types::ToolKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid boolean value for {key}: {value}")]
    InvalidBool { key: String, value: String },
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("unknown tool name: {0}")]
    UnknownTool(String),
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct FogConfig {
    /// State directory; everything Fog persists lives under here.
    pub home: PathBuf,
    /// HTTP API port.
    pub port: u16,
    /// Global cap on concurrently active runs.
    pub max_parallel: usize,
    /// Per-run deadline in seconds.
    pub run_timeout_sec: u64,
    /// Prefix for generated session branch names.
    pub branch_prefix: String,
    /// Tool used when a session request names none.
    pub default_tool: Option<ToolKind>,
    /// Delete session branches when a session is archived.
    pub delete_branch_on_archive: bool,
}

impl Default for FogConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            port: 7700,
            max_parallel: 4,
            run_timeout_sec: 30 * 60,
            branch_prefix: "fog".to_string(),
            default_tool: None,
            delete_branch_on_archive: false,
        }
    }
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fog")
}

impl FogConfig {
    /// Load configuration: defaults, `$FOG_HOME/config`, env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(home) = std::env::var("FOG_HOME") {
            if !home.trim().is_empty() {
                config.home = PathBuf::from(home);
            }
        }

        let config_file = config.home.join("config");
        if config_file.exists() {
            config.apply_file(&config_file)?;
        }

        if let Ok(port) = std::env::var("FOG_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::InvalidInt {
                key: "FOG_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Ok(parallel) = std::env::var("FOG_MAX_PARALLEL") {
            config.max_parallel = parallel.parse().map_err(|_| ConfigError::InvalidInt {
                key: "FOG_MAX_PARALLEL".to_string(),
                value: parallel.clone(),
            })?;
        }

        Ok(config)
    }

    /// Apply a key=value config file on top of the current values.
    pub fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidLine(raw_line.to_string()))?;
            self.apply_kv(key.trim(), value.trim())?;
        }
        Ok(())
    }

    fn apply_kv(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "port" => self.port = parse_int(key, value)?,
            "max_parallel" => self.max_parallel = parse_int(key, value)?,
            "run_timeout_sec" => self.run_timeout_sec = parse_int(key, value)?,
            "branch_prefix" => self.branch_prefix = value.to_string(),
            "default_tool" => {
                self.default_tool = Some(
                    ToolKind::parse(value).ok_or_else(|| ConfigError::UnknownTool(value.to_string()))?,
                );
            }
            "delete_branch_on_archive" => {
                self.delete_branch_on_archive = parse_bool(key, value)?;
            }
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    // --- State layout helpers ---

    pub fn db_path(&self) -> PathBuf {
        self.home.join("fog.db")
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.home.join("master.key")
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.home.join("repos")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.home.join("logs")
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidInt {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = FogConfig::default();
        assert_eq!(config.port, 7700);
        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.run_timeout_sec, 1800);
        assert_eq!(config.branch_prefix, "fog");
        assert!(!config.delete_branch_on_archive);
        assert!(config.default_tool.is_none());
    }

    #[test]
    fn state_layout_hangs_off_home() {
        let mut config = FogConfig::default();
        config.home = PathBuf::from("/tmp/foghome");
        assert_eq!(config.db_path(), PathBuf::from("/tmp/foghome/fog.db"));
        assert_eq!(
            config.master_key_path(),
            PathBuf::from("/tmp/foghome/master.key")
        );
        assert_eq!(config.repos_dir(), PathBuf::from("/tmp/foghome/repos"));
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/foghome/logs"));
    }

    #[test]
    fn apply_file_parses_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            "# comment\nport=8800\nmax_parallel=2\nbranch_prefix=lab\ndefault_tool=claude-code\ndelete_branch_on_archive=true\n",
        )
        .unwrap();

        let mut config = FogConfig::default();
        config.apply_file(&path).unwrap();
        assert_eq!(config.port, 8800);
        assert_eq!(config.max_parallel, 2);
        assert_eq!(config.branch_prefix, "lab");
        assert_eq!(config.default_tool, Some(ToolKind::Claude));
        assert!(config.delete_branch_on_archive);
    }

    #[test]
    fn apply_file_rejects_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "no_such_key=1\n").unwrap();

        let mut config = FogConfig::default();
        assert!(matches!(
            config.apply_file(&path),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn apply_file_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "port=not-a-number\n").unwrap();

        let mut config = FogConfig::default();
        assert!(matches!(
            config.apply_file(&path),
            Err(ConfigError::InvalidInt { .. })
        ));
    }
}
