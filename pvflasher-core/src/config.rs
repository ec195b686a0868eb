//! Persistent application configuration at `~/.pvflasher/config.json`.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Front-end color theme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub theme: Theme,
}

/// `<home>/.pvflasher`, created on demand.
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| {
        Error::Io(std::io::Error::other("cannot determine home directory"))
    })?;
    let dir = home.join(".pvflasher");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Load the configuration, falling back to defaults when no file exists.
pub fn load() -> Result<Config> {
    load_from(&config_file()?)
}

pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let data = fs::read(path)?;
    serde_json::from_slice(&data)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
}

pub fn save(config: &Config) -> Result<()> {
    save_to(config, &config_file()?)
}

pub fn save_to(config: &Config, path: &Path) -> Result<()> {
    let data = serde_json::to_vec_pretty(config)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    fs::write(path, data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.theme, Theme::System);
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config { theme: Theme::Dark };
        save_to(&config, &path).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded, config);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"theme\": \"dark\""));
    }

    #[test]
    fn unknown_theme_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, br#"{"theme": "solarized"}"#).unwrap();
        assert!(load_from(&path).is_err());
    }
}
