//! Serato DJ tag adapter
//!
//! Serato keeps cues in a `Serato Markers2` tag and the tempo map in
//! `Serato BeatGrid`. Both are opaque binary payloads stored in GEOB frames
//! (ID3), freeform atoms (MP4) or Vorbis comments (FLAC).

pub mod grid;
pub mod markers2;
pub mod repair;

pub use grid::{decode_beatgrid, encode_beatgrid, BEATGRID_TAG};
pub use markers2::{
    decode_markers2, encode_markers2, Markers2, SeratoCue, LEGACY_MARKERS_TAG, MARKERS2_TAG,
};
pub use repair::{repair, validate, RepairOutcome, RepairRecord, ValidationIssue};
