//! Standard metadata sanity checks
//!
//! Tag readers hand back whatever a file contains. These checks flag values
//! no real track has:
//! - Year outside 1900-2100
//! - BPM outside 30-300
//! - Track number 0

use tracing::warn;

use crate::track::TrackMetadata;

pub const MIN_YEAR: u16 = 1900;
pub const MAX_YEAR: u16 = 2100;
pub const MIN_BPM: f64 = 30.0;
pub const MAX_BPM: f64 = 300.0;

/// Result of checking one track's metadata
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn add_error(&mut self, msg: impl Into<String>) {
        self.valid = false;
        self.errors.push(msg.into());
    }

    fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }
}

/// Check standard fields for implausible values
pub fn validate_metadata(meta: &TrackMetadata) -> ValidationResult {
    let mut result = ValidationResult::new();

    if let Some(year) = meta.year {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            result.add_error(format!("Year {} outside {}-{}", year, MIN_YEAR, MAX_YEAR));
        }
    }

    if let Some(bpm) = meta.bpm {
        if !bpm.is_finite() || !(MIN_BPM..=MAX_BPM).contains(&bpm) {
            result.add_error(format!("BPM {} outside {}-{}", bpm, MIN_BPM, MAX_BPM));
        }
    }

    if meta.track_number == Some(0) {
        result.add_error("Track number 0");
    }

    if let Some(duration) = meta.duration_ms {
        if let Some(last) = meta.cues.iter().map(|c| c.position_ms).reduce(f64::max) {
            if last > duration {
                result.add_warning(format!(
                    "Cue at {:.0}ms lies past the end of the track ({:.0}ms)",
                    last, duration
                ));
            }
        }
    }

    result
}

/// Drop implausible standard fields, returning how many were cleared
pub fn sanitize_metadata(meta: &mut TrackMetadata) -> usize {
    let mut cleared = 0;

    if let Some(year) = meta.year {
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            warn!("{}: dropping implausible year {}", meta.path, year);
            meta.year = None;
            cleared += 1;
        }
    }

    if let Some(bpm) = meta.bpm {
        if !bpm.is_finite() || !(MIN_BPM..=MAX_BPM).contains(&bpm) {
            warn!("{}: dropping implausible BPM {}", meta.path, bpm);
            meta.bpm = None;
            cleared += 1;
        }
    }

    if meta.track_number == Some(0) {
        warn!("{}: dropping track number 0", meta.path);
        meta.track_number = None;
        cleared += 1;
    }

    cleared
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cue::CuePoint;

    fn sample() -> TrackMetadata {
        TrackMetadata {
            year: Some(2019),
            bpm: Some(124.0),
            track_number: Some(3),
            ..TrackMetadata::new("track.mp3")
        }
    }

    #[test]
    fn test_validate_clean() {
        let result = validate_metadata(&sample());
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_validate_bad_fields() {
        let meta = TrackMetadata {
            year: Some(1850),
            bpm: Some(999.0),
            track_number: Some(0),
            ..sample()
        };
        let result = validate_metadata(&meta);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 3);
    }

    #[test]
    fn test_cue_past_end_is_warning() {
        let meta = TrackMetadata {
            duration_ms: Some(1000.0),
            cues: vec![CuePoint::new(1, 2000.0)],
            ..sample()
        };
        let result = validate_metadata(&meta);
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_sanitize() {
        let mut meta = TrackMetadata {
            year: Some(3000),
            bpm: Some(12.0),
            ..sample()
        };
        assert_eq!(sanitize_metadata(&mut meta), 2);
        assert_eq!(meta.year, None);
        assert_eq!(meta.bpm, None);
        assert_eq!(meta.track_number, Some(3));
    }
}
