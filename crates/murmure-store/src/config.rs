//! User preferences persisted to `config.json`.
//!
//! The schema is stable; keys this version does not know are carried in the
//! `extra` maps and written back untouched, so older and newer builds can
//! share one file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, warn};

use murmure_shared::constants::{
    DEFAULT_ANNOUNCE_PERIOD_MIN, DEFAULT_TARGET_JITTER_MS, MAX_CALLS_PER_HOUR,
    MAX_CALLS_PER_MINUTE, OPUS_DEFAULT_BITRATE,
};
use murmure_shared::types::CodecType;

use crate::error::Result;
use crate::paths::atomic_write;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AudioSettings {
    pub input_device: Option<usize>,
    pub output_device: Option<usize>,
    pub enabled: bool,
    pub target_jitter_ms: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            enabled: true,
            target_jitter_ms: DEFAULT_TARGET_JITTER_MS,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodecSettings {
    pub codec_type: CodecType,
    /// Opus bitrate in bps, or the Codec2 mode value.
    pub bitrate: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            codec_type: CodecType::Opus,
            bitrate: OPUS_DEFAULT_BITRATE,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSettings {
    pub announce_on_start: bool,
    pub announce_period_minutes: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            announce_on_start: true,
            announce_period_minutes: DEFAULT_ANNOUNCE_PERIOD_MIN,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallSettings {
    pub max_per_minute: u32,
    pub max_per_hour: u32,
    /// Record invites rejected for busy in the call history.
    pub record_busy: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            max_per_minute: MAX_CALLS_PER_MINUTE,
            max_per_hour: MAX_CALLS_PER_HOUR,
            record_busy: false,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UiSettings {
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub last_remote_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub audio: AudioSettings,
    #[serde(default)]
    pub codec: CodecSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub calls: CallSettings,
    #[serde(default)]
    pub ui: UiSettings,
    #[serde(flatten)]
    pub extra: Map<String, Value>,

    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is missing
    /// or unreadable.
    pub fn load(path: &Path) -> Self {
        let mut config = if path.exists() {
            match std::fs::read(path)
                .map_err(crate::StoreError::from)
                .and_then(|bytes| Ok(serde_json::from_slice::<Config>(&bytes)?))
            {
                Ok(config) => config,
                Err(err) => {
                    error!(path = %path.display(), error = %err, "Failed to load config, using defaults");
                    Config::default()
                }
            }
        } else {
            Config::default()
        };
        config.path = Some(path.to_path_buf());
        config
    }

    /// Persist to the path it was loaded from. Failures are logged and the
    /// in-memory settings stay authoritative.
    pub fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };
        match serde_json::to_vec_pretty(self) {
            Ok(bytes) => {
                if let Err(err) = atomic_write(path, &bytes) {
                    error!(path = %path.display(), error = %err, "Failed to write config");
                }
            }
            Err(err) => warn!(error = %err, "Failed to serialize config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("config.json"));
        assert_eq!(config.codec.codec_type, CodecType::Opus);
        assert_eq!(config.calls.max_per_minute, 5);
        assert!(config.network.announce_on_start);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::load(&path);
        config.ui.display_name = "Alice".to_string();
        config.codec.bitrate = 16_000;
        config.save();

        let restored = Config::load(&path);
        assert_eq!(restored.ui.display_name, "Alice");
        assert_eq!(restored.codec.bitrate, 16_000);
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"future_section":{"k":1},"ui":{"display_name":"Bob","future_key":true}}"#,
        )
        .unwrap();

        let config = Config::load(&path);
        config.save();

        let raw: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["future_section"]["k"], 1);
        assert_eq!(raw["ui"]["future_key"], true);
        assert_eq!(raw["ui"]["display_name"], "Bob");
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{not json").unwrap();
        let config = Config::load(&path);
        assert_eq!(config.codec, CodecSettings::default());
    }
}
