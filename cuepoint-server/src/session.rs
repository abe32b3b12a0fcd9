//! Open tracks
//!
//! A session owns the registry for one track. With auto-save enabled every
//! registry change is forwarded to the session's debouncer.

use std::sync::Arc;
use std::time::Duration;

use cuepoint_core::{AutoSaveHandle, AutoSaver, CueRegistry, MetadataStore, Result, TrackMetadata};
use tracing::debug;

use crate::config::Config;

pub struct Session {
    pub registry: CueRegistry,
    /// Metadata as read when the track was opened
    pub metadata: TrackMetadata,
    pub autosave: Option<AutoSaveHandle>,
}

impl Session {
    /// Build a session from a fresh read; must run inside the runtime
    pub fn open(config: &Config, store: &Arc<MetadataStore>, metadata: TrackMetadata) -> Result<Self> {
        let mut registry = CueRegistry::new(config.engine.clone());
        registry.set_track(metadata.path.clone(), metadata.duration_ms);
        registry.load(metadata.cues.clone(), metadata.beatgrid.clone())?;

        let autosave = config.engine.auto_save.then(|| {
            let debounce = Duration::from_millis(config.engine.auto_save_debounce_ms);
            let (handle, _task) = AutoSaver::spawn(store.clone(), debounce);
            registry.set_listener(Some(Arc::new(handle.clone())));
            handle
        });

        debug!("Opened session for {} with {} cues", metadata.path, registry.len());
        Ok(Self {
            registry,
            metadata,
            autosave,
        })
    }

    /// Flush pending auto-saves and stop the debouncer
    pub async fn close(self) {
        if let Some(handle) = self.autosave {
            handle.shutdown().await;
        }
    }
}
