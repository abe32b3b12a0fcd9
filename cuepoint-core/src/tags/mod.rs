//! Tag codec
//!
//! Minimal in-place editors for the three containers Serato writes to:
//! - ID3v2.3/2.4 (MP3): GEOB frames keyed by description
//! - MP4 (M4A/AAC): freeform `----` atoms under `moov/udta/meta/ilst`
//! - FLAC: `VORBIS_COMMENT` entries
//!
//! Editors only rewrite the metadata region. Frames, atoms and blocks they
//! do not understand are carried over byte for byte, in order.

pub mod flac;
pub mod id3;
pub mod mp4;
pub mod text;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::error::{Error, Result};
use crate::track::{StandardField, TagFormat};

/// Common contract of the container editors
///
/// Binary frames are addressed by their Serato name (`Serato Markers2`,
/// `Serato BeatGrid`); each container maps the name onto its own storage.
pub trait TagContainer: Send {
    fn format(&self) -> TagFormat;

    fn get_frame(&self, name: &str) -> Option<Vec<u8>>;

    /// Replace the frame in place, or append it when absent
    fn set_frame(&mut self, name: &str, data: &[u8]);

    /// Returns whether a frame was removed
    fn remove_frame(&mut self, name: &str) -> bool;

    fn get_text(&self, field: StandardField) -> Option<String>;

    /// `None` removes the field
    fn set_text(&mut self, field: StandardField, value: Option<&str>);

    /// Track length, when the container records it
    fn duration_ms(&self) -> Option<f64> {
        None
    }

    /// Render the complete file: `original` with its metadata region replaced
    fn write_to(&self, original: &[u8]) -> Result<Vec<u8>>;
}

/// Parse the metadata region of `bytes`
pub fn read_container(format: TagFormat, bytes: &[u8]) -> Result<Box<dyn TagContainer>> {
    match format {
        TagFormat::Id3 => Ok(Box::new(id3::Id3Tag::parse(bytes)?)),
        TagFormat::Mp4 => Ok(Box::new(mp4::Mp4Tag::parse(bytes)?)),
        TagFormat::Flac => Ok(Box::new(flac::FlacTag::parse(bytes)?)),
        TagFormat::Unknown => Err(Error::UnsupportedFormat(
            "no tag container for this file type".into(),
        )),
    }
}

const ENVELOPE_MIME: &[u8] = b"application/octet-stream\0\0";

/// Base64 for text-based containers; decoding ignores padding
const TEXT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Wrap a binary frame for a text container
///
/// MP4 and FLAC carry the frame as base64 of
/// `application/octet-stream\0\0<name>\0<data>`.
pub(crate) fn wrap_envelope(name: &str, data: &[u8]) -> String {
    let mut envelope = Vec::with_capacity(ENVELOPE_MIME.len() + name.len() + 1 + data.len());
    envelope.extend_from_slice(ENVELOPE_MIME);
    envelope.extend_from_slice(name.as_bytes());
    envelope.push(0x00);
    envelope.extend_from_slice(data);
    TEXT_BASE64.encode(envelope)
}

/// Inverse of `wrap_envelope`; `None` if the text is not an envelope for `name`
pub(crate) fn unwrap_envelope(name: &str, text: &str) -> Option<Vec<u8>> {
    let compact: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    let envelope = TEXT_BASE64.decode(compact).ok()?;
    let rest = envelope.strip_prefix(ENVELOPE_MIME)?;
    let rest = rest.strip_prefix(name.as_bytes())?;
    rest.strip_prefix(&[0x00][..]).map(<[u8]>::to_vec)
}
