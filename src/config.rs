use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Service configuration, loaded from a TOML file. Every field has a
/// default so a missing config file just means "run with defaults".
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Address the HTTP API binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Page size for history queries that do not specify a limit.
    #[serde(default = "default_page_limit")]
    pub default_page_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            bind: default_bind(),
            default_page_limit: default_page_limit(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8820".to_string()
}

fn default_page_limit() -> usize {
    50
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "instructd")
        .map(|dirs| dirs.data_dir().join("instructions.db"))
        .unwrap_or_else(|| PathBuf::from("instructions.db"))
}

impl Config {
    /// Load config from `path`, falling back to the platform config dir.
    /// A missing file yields the defaults; a malformed file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match directories::ProjectDirs::from("", "", "instructd") {
                Some(dirs) => dirs.config_dir().join("config.toml"),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = Config::load(Some(&tmp.path().join("nope.toml"))).unwrap();
        assert_eq!(config.bind, default_bind());
        assert_eq!(config.default_page_limit, 50);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "bind = \"0.0.0.0:9000\"\n").unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.default_page_limit, 50);
        assert_eq!(config.db_path, default_db_path());
    }

    #[test]
    fn malformed_file_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "bind = [not toml").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }
}
