//! Track metadata structures
//!
//! The high-level representation the store reads from and writes to tags.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::beatgrid::Beatgrid;
use crate::cue::CuePoint;
use crate::serato::RepairRecord;

/// Tag container kind, detected from the file extension
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagFormat {
    #[default]
    Unknown,
    Id3,
    Mp4,
    Flac,
}

impl TagFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "mp3" => TagFormat::Id3,
            "m4a" | "mp4" | "aac" => TagFormat::Mp4,
            "flac" => TagFormat::Flac,
            _ => TagFormat::Unknown,
        }
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        path.as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or_default()
    }
}

/// Standard text fields every container can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandardField {
    Title,
    Artist,
    Album,
    Genre,
    Year,
    TrackNumber,
    Comment,
    Bpm,
    Key,
}

impl StandardField {
    pub const ALL: [StandardField; 9] = [
        StandardField::Title,
        StandardField::Artist,
        StandardField::Album,
        StandardField::Genre,
        StandardField::Year,
        StandardField::TrackNumber,
        StandardField::Comment,
        StandardField::Bpm,
        StandardField::Key,
    ];
}

/// Everything the engine knows about one audio file
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TrackMetadata {
    pub path: String,
    pub format: TagFormat,
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u16>,
    pub track_number: Option<u32>,
    pub comment: Option<String>,
    pub bpm: Option<f64>,
    /// Musical key as written in the tag (e.g. "8A", "Am")
    pub key: Option<String>,
    pub duration_ms: Option<f64>,
    pub bitrate_kbps: Option<u32>,
    pub sample_rate: Option<u32>,
    /// Cue points ordered by position
    pub cues: Vec<CuePoint>,
    pub beatgrid: Option<Beatgrid>,
    /// Values replaced while loading damaged Serato cues
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repairs: Vec<RepairRecord>,
}

impl TrackMetadata {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_string_lossy().into_owned(),
            format: TagFormat::from_path(&path),
            ..Default::default()
        }
    }

    /// Standard field rendered as tag text
    pub fn field(&self, field: StandardField) -> Option<String> {
        match field {
            StandardField::Title => self.title.clone(),
            StandardField::Artist => self.artist.clone(),
            StandardField::Album => self.album.clone(),
            StandardField::Genre => self.genre.clone(),
            StandardField::Year => self.year.map(|y| y.to_string()),
            StandardField::TrackNumber => self.track_number.map(|n| n.to_string()),
            StandardField::Comment => self.comment.clone(),
            StandardField::Bpm => self.bpm.map(format_bpm),
            StandardField::Key => self.key.clone(),
        }
    }

    /// Set a standard field from tag text; unparseable numbers clear the field
    pub fn set_field(&mut self, field: StandardField, value: Option<String>) {
        let value = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        match field {
            StandardField::Title => self.title = value,
            StandardField::Artist => self.artist = value,
            StandardField::Album => self.album = value,
            StandardField::Genre => self.genre = value,
            StandardField::Year => self.year = value.as_deref().and_then(parse_year),
            StandardField::TrackNumber => {
                self.track_number = value.as_deref().and_then(parse_track_number)
            }
            StandardField::Comment => self.comment = value,
            StandardField::Bpm => self.bpm = value.and_then(|v| v.parse().ok()),
            StandardField::Key => self.key = value,
        }
    }

    /// Copy cues and beatgrid from another read of the same file
    pub fn with_serato(mut self, cues: Vec<CuePoint>, beatgrid: Option<Beatgrid>) -> Self {
        self.cues = cues;
        self.cues.sort_by(|a, b| a.position_ms.total_cmp(&b.position_ms));
        self.beatgrid = beatgrid;
        self
    }
}

/// BPM as tag text: integers stay integral, fractions keep two decimals
pub fn format_bpm(bpm: f64) -> String {
    if bpm.fract() == 0.0 {
        format!("{}", bpm as i64)
    } else {
        format!("{:.2}", bpm)
    }
}

/// Year from "2019" or a timestamp like "2019-03-01"
fn parse_year(value: &str) -> Option<u16> {
    value
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .and_then(|y| y.parse().ok())
}

/// Track number from "7" or "7/12"
fn parse_track_number(value: &str) -> Option<u32> {
    value.split('/').next().and_then(|n| n.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(TagFormat::from_path("a/b/track.MP3"), TagFormat::Id3);
        assert_eq!(TagFormat::from_path("track.m4a"), TagFormat::Mp4);
        assert_eq!(TagFormat::from_path("track.flac"), TagFormat::Flac);
        assert_eq!(TagFormat::from_path("track.wav"), TagFormat::Unknown);
        assert_eq!(TagFormat::from_path("noext"), TagFormat::Unknown);
    }

    #[test]
    fn test_field_parsing() {
        let mut meta = TrackMetadata::new("x.mp3");
        meta.set_field(StandardField::Year, Some("2019-03-01".into()));
        meta.set_field(StandardField::TrackNumber, Some("7/12".into()));
        meta.set_field(StandardField::Bpm, Some("124.5".into()));
        meta.set_field(StandardField::Title, Some("  ".into()));

        assert_eq!(meta.year, Some(2019));
        assert_eq!(meta.track_number, Some(7));
        assert_eq!(meta.bpm, Some(124.5));
        assert_eq!(meta.title, None);
        assert_eq!(meta.field(StandardField::Bpm).as_deref(), Some("124.50"));
    }

    #[test]
    fn test_format_bpm() {
        assert_eq!(format_bpm(128.0), "128");
        assert_eq!(format_bpm(127.999), "128.00");
    }
}
