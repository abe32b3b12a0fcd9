//! Error types for cuepoint-core

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid cue slot {id}: {reason}")]
    InvalidSlot { id: u8, reason: String },

    #[error("Invalid cue position {position_ms}ms: {reason}")]
    InvalidPosition { position_ms: f64, reason: String },

    #[error("Cue {id} at {position_ms}ms is {distance_ms:.1}ms from cue {existing_id}")]
    NearDuplicate {
        id: u8,
        position_ms: f64,
        existing_id: u8,
        distance_ms: f64,
    },

    #[error("Cue {0} not found")]
    NotFound(u8),

    #[error("Invalid cue label: {0}")]
    InvalidLabel(String),

    #[error("Invalid beatgrid: {0}")]
    InvalidBeatgrid(String),

    #[error("Unsupported tag version: {0}")]
    UnsupportedVersion(String),

    #[error("Corrupt tag data: {0}")]
    CorruptData(String),

    #[error("Unsupported container format: {0}")]
    UnsupportedFormat(String),

    #[error("{reader} reader failed: {message}")]
    Reader { reader: &'static str, message: String },

    #[error("Backup of {path:?} failed: {source}")]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Write to {path:?} failed and was rolled back: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("Unreadable metadata in {path:?}: {}", .errors.join("; "))]
    UnreadableMetadata { path: PathBuf, errors: Vec<String> },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Validation failures the UI reports back to the user immediately
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidSlot { .. }
                | Error::InvalidPosition { .. }
                | Error::NearDuplicate { .. }
                | Error::InvalidLabel(_)
        )
    }
}

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        match e {
            binrw::Error::BadMagic { .. } => Error::UnsupportedVersion(e.to_string()),
            other => Error::CorruptData(other.to_string()),
        }
    }
}
