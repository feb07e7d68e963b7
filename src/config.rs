//! Tunables, persisted as JSON under `~/.arbor/config.json`. Command-line
//! flags override the file; runtime changes are written back on exit.

use std::path::PathBuf;

use eyre::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture an engine snapshot roughly every this many tokens. Bounds
    /// replay cost after a jump, at the price of state-sized copies.
    pub snapshot_freq: u32,
    /// How far ahead to extend the selected continuation.
    pub predict_main: u32,
    /// How far ahead to extend lateral alternatives.
    pub predict_alt: u32,
    /// Weights to load; discovered when absent.
    pub model_path: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            snapshot_freq: 10,
            predict_main: 6,
            predict_alt: 4,
            model_path: None,
        }
    }
}

/// `~/.arbor/config.json`.
pub fn config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| String::from("."));
    PathBuf::from(home).join(".arbor").join("config.json")
}

impl Config {
    /// Read the config file; any problem falls back to defaults.
    pub fn load() -> Config {
        let path = config_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(%e, path = %path.display(), "unreadable config; using defaults");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_survive_roundtrip() {
        let config = Config::default();
        let text = serde_json::to_string(&config).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.snapshot_freq, 10);
        assert_eq!(back.predict_main, 6);
        assert_eq!(back.predict_alt, 4);
        assert!(back.model_path.is_none());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let back: Config = serde_json::from_str(r#"{"snapshot_freq": 3}"#).unwrap();
        assert_eq!(back.snapshot_freq, 3);
        assert_eq!(back.predict_main, 6);
    }
}
