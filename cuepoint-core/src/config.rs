//! Engine configuration
//!
//! One explicit struct handed to every component constructor. Loaded from a
//! JSON file where every key is optional.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// What the registry does when a new cue collides with an existing one
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Reject slot and proximity conflicts
    Strict,
    /// Accept proximity conflicts, record a warning
    #[default]
    Merge,
    /// Overwrite occupied slots, record proximity warnings
    Replace,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Highest hot-cue slot id
    pub max_cues: u8,
    pub auto_save: bool,
    pub auto_save_debounce_ms: u64,
    /// Copy the file aside before every write
    pub backup_on_write: bool,
    /// Keep the backup after a committed write
    pub retain_backup: bool,
    pub conflict_resolution: ConflictResolution,
    /// Cues closer than this are near-duplicates
    pub proximity_threshold_ms: f64,
    /// Target gap for the even-spacing optimizer
    pub min_cue_spacing_ms: f64,
    pub beat_align_tolerance_ms: f64,
    /// Optimizers never move a cue further than this
    pub max_correction_ms: f64,
    /// Beats closer than this are detector artifacts
    pub min_beat_spacing_ms: f64,
    pub validation_strict: bool,
    pub auto_repair: bool,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_cues: 16,
            auto_save: true,
            auto_save_debounce_ms: 750,
            backup_on_write: true,
            retain_backup: false,
            conflict_resolution: ConflictResolution::Merge,
            proximity_threshold_ms: 50.0,
            min_cue_spacing_ms: 200.0,
            beat_align_tolerance_ms: 100.0,
            max_correction_ms: 500.0,
            min_beat_spacing_ms: 200.0,
            validation_strict: true,
            auto_repair: true,
            cache_enabled: true,
            cache_capacity: 1000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let config: Config = serde_json::from_reader(BufReader::new(file))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_cues == 0 || self.max_cues > 16 {
            return Err(Error::Config(format!(
                "max_cues must be 1-16, got {}",
                self.max_cues
            )));
        }

        let distances = [
            ("proximity_threshold_ms", self.proximity_threshold_ms),
            ("min_cue_spacing_ms", self.min_cue_spacing_ms),
            ("beat_align_tolerance_ms", self.beat_align_tolerance_ms),
            ("max_correction_ms", self.max_correction_ms),
            ("min_beat_spacing_ms", self.min_beat_spacing_ms),
        ];
        for (name, value) in distances {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{} must be >= 0, got {}", name, value)));
            }
        }

        if self.cache_capacity == 0 {
            return Err(Error::Config("cache_capacity must be > 0".into()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"conflict_resolution": "strict", "proximity_threshold_ms": 25.0}}"#).unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.conflict_resolution, ConflictResolution::Strict);
        assert_eq!(config.proximity_threshold_ms, 25.0);
        assert_eq!(config.max_cues, 16);
        assert!(config.backup_on_write);
    }

    #[test]
    fn test_rejects_bad_max_cues() {
        let config = Config {
            max_cues: 17,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_negative_distance() {
        let config = Config {
            max_correction_ms: -1.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
