//! cuepoint-core: cue and metadata persistence for DJ tracks
//!
//! This crate provides:
//! - Cue registry (hot cues, loops, sections) with conflict rules
//! - Serato Markers2 / BeatGrid codecs, compatible with Serato DJ Pro
//! - Tag codec for ID3v2, MP4 and FLAC containers
//! - Metadata store with verified, rollback-safe writes and a checksum cache
//! - Debounced auto-save
//!
//! Serato layouts follow the community reverse engineering of the
//! Markers2 and BeatGrid GEOB frames.

pub mod autosave;
pub mod beatgrid;
pub mod cache;
pub mod config;
pub mod cue;
pub mod error;
pub mod reader;
pub mod registry;
pub mod serato;
pub mod store;
pub mod tags;
pub mod track;
pub mod validate;

pub use autosave::{AutoSaveHandle, AutoSaver, SnapshotSink};
pub use beatgrid::Beatgrid;
pub use cache::{CacheLookup, CacheStats};
pub use config::{Config, ConflictResolution};
pub use cue::{CueColor, CuePoint, CueType};
pub use error::{Error, Result};
pub use registry::{CueRegistry, CueSnapshot, CueSpec, CueUpdate, OptimizeStrategy};
pub use store::{MetadataStore, WriteReport, WriteState};
pub use track::{TagFormat, TrackMetadata};
