//! User configuration loaded from `~/.config/persishtent/config.json`.
//!
//! A missing file means defaults; unknown fields are tolerated so older
//! binaries can read configs written by newer ones.

use std::path::PathBuf;
use std::{env, fs};

use serde::{Deserialize, Serialize};

use crate::client::input::parse_detach_key;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    /// Maximum size of the active log segment before rotation.
    pub segment_size_bytes: u64,
    /// Total on-disk segments to retain (active + rotated).
    pub max_segments: usize,
    /// Prefix injected in front of the child shell's `PS1`.
    pub prompt_prefix: String,
    /// Detach key spec, `ctrl-<x>` form. Defaults to `ctrl-d`.
    pub detach_key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segment_size_bytes: 1024 * 1024,
            max_segments: 5,
            prompt_prefix: "persh".to_string(),
            detach_key: "ctrl-d".to_string(),
        }
    }
}

impl Config {
    /// Load configuration, falling back to defaults when the file is
    /// missing or unreadable.
    ///
    /// A detach key that maps to the literal byte `'d'` would make the
    /// detach sequence unreachable (prefix matching resolves before the
    /// literal check), so it is rejected here with a warning.
    pub fn load() -> Self {
        let mut config = match Self::config_path() {
            Some(path) if path.exists() => match fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => config,
                    Err(e) => {
                        log::warn!("Invalid config at {}: {e}; using defaults", path.display());
                        Self::default()
                    }
                },
                Err(e) => {
                    log::warn!("Failed to read config at {}: {e}; using defaults", path.display());
                    Self::default()
                }
            },
            _ => Self::default(),
        };

        if config.detach_byte() == b'd' {
            log::warn!(
                "detach_key '{}' maps to the literal 'd' and would shadow the detach sequence; \
                 falling back to ctrl-d",
                config.detach_key
            );
            config.detach_key = "ctrl-d".to_string();
        }
        if config.max_segments == 0 {
            log::warn!("max_segments must be at least 1; using 1");
            config.max_segments = 1;
        }
        config
    }

    /// Resolve the detach key spec to its byte value.
    pub fn detach_byte(&self) -> u8 {
        parse_detach_key(&self.detach_key)
    }

    /// Path to the config file. `PERSISHTENT_CONFIG` overrides the
    /// default location (used by tests).
    fn config_path() -> Option<PathBuf> {
        if let Ok(path) = env::var("PERSISHTENT_CONFIG") {
            return Some(PathBuf::from(path));
        }
        dirs::home_dir().map(|home| home.join(".config").join("persishtent").join("config.json"))
    }
}
