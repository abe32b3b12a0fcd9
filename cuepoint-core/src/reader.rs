//! Standard metadata readers
//!
//! The store tries each reader in order and keeps the first success:
//! 1. `LoftyReader`: the lofty tag library, also supplies audio properties
//! 2. `NativeReader`: this crate's tag codec, for files lofty rejects
//!
//! Readers fill the standard fields only. Serato cues and beatgrid always
//! come from the tag codec.

use std::path::Path;

use lofty::prelude::*;
use lofty::read_from_path;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tags;
use crate::track::{StandardField, TagFormat, TrackMetadata};

/// A strategy for reading standard metadata
pub trait MetadataReader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Read standard fields from `path`, whose contents are `bytes`
    fn read_fields(&self, path: &Path, bytes: &[u8]) -> Result<TrackMetadata>;
}

/// The default chain: lofty first, then the native codec
pub fn default_readers() -> Vec<Box<dyn MetadataReader>> {
    vec![Box::new(LoftyReader), Box::new(NativeReader)]
}

pub struct LoftyReader;

impl LoftyReader {
    fn item_key(field: StandardField) -> ItemKey {
        match field {
            StandardField::Title => ItemKey::TrackTitle,
            StandardField::Artist => ItemKey::TrackArtist,
            StandardField::Album => ItemKey::AlbumTitle,
            StandardField::Genre => ItemKey::Genre,
            StandardField::Year => ItemKey::Year,
            StandardField::TrackNumber => ItemKey::TrackNumber,
            StandardField::Comment => ItemKey::Comment,
            StandardField::Bpm => ItemKey::Bpm,
            StandardField::Key => ItemKey::InitialKey,
        }
    }
}

impl MetadataReader for LoftyReader {
    fn name(&self) -> &'static str {
        "lofty"
    }

    fn read_fields(&self, path: &Path, _bytes: &[u8]) -> Result<TrackMetadata> {
        let tagged_file = read_from_path(path).map_err(|e| Error::Reader {
            reader: self.name(),
            message: e.to_string(),
        })?;

        let mut meta = TrackMetadata::new(path);

        let properties = tagged_file.properties();
        let duration = properties.duration();
        if !duration.is_zero() {
            meta.duration_ms = Some(duration.as_secs_f64() * 1000.0);
        }
        meta.bitrate_kbps = properties.audio_bitrate();
        meta.sample_rate = properties.sample_rate();

        // Primary tag first, then whatever the file has
        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            for field in StandardField::ALL {
                let value = match field {
                    StandardField::Year => tag
                        .get_string(&ItemKey::Year)
                        .or_else(|| tag.get_string(&ItemKey::RecordingDate)),
                    StandardField::Bpm => tag
                        .get_string(&ItemKey::Bpm)
                        .or_else(|| tag.get_string(&ItemKey::IntegerBpm)),
                    other => tag.get_string(&Self::item_key(other)),
                };
                meta.set_field(field, value.map(str::to_string));
            }
        }

        debug!("lofty read {:?}", path);
        Ok(meta)
    }
}

pub struct NativeReader;

impl MetadataReader for NativeReader {
    fn name(&self) -> &'static str {
        "native"
    }

    fn read_fields(&self, path: &Path, bytes: &[u8]) -> Result<TrackMetadata> {
        let container = tags::read_container(TagFormat::from_path(path), bytes)?;

        let mut meta = TrackMetadata::new(path);
        for field in StandardField::ALL {
            meta.set_field(field, container.get_text(field));
        }
        meta.duration_ms = container.duration_ms();

        debug!("native codec read {:?}", path);
        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::id3::Id3Tag;
    use crate::tags::TagContainer;
    use tempfile::TempDir;

    fn tagged_mp3() -> Vec<u8> {
        let mut tag = Id3Tag::parse(b"").unwrap();
        tag.set_text(StandardField::Title, Some("Native Title"));
        tag.set_text(StandardField::Year, Some("2019"));
        tag.set_text(StandardField::TrackNumber, Some("3/10"));
        tag.write_to(b"not really audio").unwrap()
    }

    #[test]
    fn test_native_reader_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("track.mp3");
        let bytes = tagged_mp3();

        let meta = NativeReader.read_fields(&path, &bytes).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Native Title"));
        assert_eq!(meta.year, Some(2019));
        assert_eq!(meta.track_number, Some(3));
        assert_eq!(meta.format, TagFormat::Id3);
    }

    #[test]
    fn test_native_reader_rejects_unknown_container() {
        let path = Path::new("track.wav");
        assert!(matches!(
            NativeReader.read_fields(path, b"RIFF"),
            Err(Error::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_lofty_reader_reports_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("missing.mp3");
        let err = LoftyReader.read_fields(&path, &[]).unwrap_err();
        assert!(matches!(err, Error::Reader { reader: "lofty", .. }));
    }
}
