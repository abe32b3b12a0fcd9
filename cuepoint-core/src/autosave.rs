//! Debounced auto-save of registry snapshots
//!
//! The registry hands every change to an `AutoSaveHandle`. A background task
//! keeps the newest snapshot with a deadline; each new snapshot pushes the
//! deadline out again, so a burst of edits ends in one write. Writes run on
//! the blocking pool.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::registry::{ChangeListener, CueSnapshot};
use crate::store::MetadataStore;

/// Where auto-saved snapshots go
pub trait SnapshotSink: Send + Sync + 'static {
    fn persist(&self, snapshot: &CueSnapshot) -> Result<()>;
}

impl SnapshotSink for MetadataStore {
    fn persist(&self, snapshot: &CueSnapshot) -> Result<()> {
        let Some(path) = snapshot.track_path.as_deref() else {
            return Ok(());
        };
        self.save_cues(Path::new(path), &snapshot.cues, snapshot.beatgrid.as_ref())
            .map(|_| ())
    }
}

enum Command {
    Schedule(CueSnapshot),
    Cancel,
    Flush(oneshot::Sender<Result<bool>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, clonable front end to a running `AutoSaver`
#[derive(Clone)]
pub struct AutoSaveHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl AutoSaveHandle {
    /// Replace the pending snapshot and restart the debounce window
    pub fn schedule(&self, snapshot: CueSnapshot) {
        if self.tx.send(Command::Schedule(snapshot)).is_err() {
            warn!("Auto-saver stopped, change not scheduled");
        }
    }

    /// Drop the pending snapshot, if any
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }

    /// Write the pending snapshot now; `Ok(false)` when nothing was pending
    pub async fn flush(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Flush(reply)).map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Flush and stop the task
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl ChangeListener for AutoSaveHandle {
    fn on_change(&self, snapshot: CueSnapshot) {
        self.schedule(snapshot);
    }
}

fn stopped() -> Error {
    Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "auto-saver stopped"))
}

/// Pending-write slot driven by a tokio task
pub struct AutoSaver {
    sink: Arc<dyn SnapshotSink>,
    debounce: Duration,
    pending: Option<CueSnapshot>,
    deadline: Option<Instant>,
}

impl AutoSaver {
    /// Start the task on the current runtime
    pub fn spawn(sink: Arc<dyn SnapshotSink>, debounce: Duration) -> (AutoSaveHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let saver = Self {
            sink,
            debounce,
            pending: None,
            deadline: None,
        };
        let task = tokio::spawn(saver.run(rx));
        (AutoSaveHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Schedule(snapshot)) => {
                        debug!("Auto-save scheduled for revision {}", snapshot.revision);
                        self.pending = Some(snapshot);
                        self.deadline = Some(Instant::now() + self.debounce);
                    }
                    Some(Command::Cancel) => {
                        self.pending = None;
                        self.deadline = None;
                    }
                    Some(Command::Flush(reply)) => {
                        let _ = reply.send(self.write_pending().await);
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.write_logged().await;
                        let _ = ack.send(());
                        break;
                    }
                    // Every handle dropped
                    None => {
                        self.write_logged().await;
                        break;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.write_logged().await;
                }
            }
        }
        debug!("Auto-saver stopped");
    }

    async fn write_logged(&mut self) {
        if let Err(e) = self.write_pending().await {
            warn!("Auto-save failed: {}", e);
        }
    }

    async fn write_pending(&mut self) -> Result<bool> {
        self.deadline = None;
        let Some(snapshot) = self.pending.take() else {
            return Ok(false);
        };
        if snapshot.track_path.is_none() {
            debug!("Skipping auto-save of a registry without a track");
            return Ok(false);
        }

        let sink = Arc::clone(&self.sink);
        let revision = snapshot.revision;
        tokio::task::spawn_blocking(move || sink.persist(&snapshot))
            .await
            .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e.to_string())))??;
        info!("Auto-saved revision {}", revision);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::cue::CuePoint;
    use crate::reader::NativeReader;
    use crate::registry::{CueRegistry, CueSpec};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<CueSnapshot>>);

    impl RecordingSink {
        fn revisions(&self) -> Vec<u64> {
            self.0.lock().unwrap().iter().map(|s| s.revision).collect()
        }
    }

    impl SnapshotSink for RecordingSink {
        fn persist(&self, snapshot: &CueSnapshot) -> Result<()> {
            self.0.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    fn snapshot(revision: u64) -> CueSnapshot {
        CueSnapshot {
            track_path: Some("track.mp3".into()),
            revision,
            cues: vec![CuePoint::new(1, revision as f64 * 100.0)],
            beatgrid: None,
        }
    }

    #[tokio::test]
    async fn test_burst_coalesces_into_one_write() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task) = AutoSaver::spawn(sink.clone(), Duration::from_millis(50));

        for revision in 1..=3 {
            handle.schedule(snapshot(revision));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(sink.revisions(), vec![3]);
    }

    #[tokio::test]
    async fn test_cancel_drops_pending() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task) = AutoSaver::spawn(sink.clone(), Duration::from_millis(30));

        handle.schedule(snapshot(1));
        handle.cancel();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(sink.revisions().is_empty());
    }

    #[tokio::test]
    async fn test_flush_writes_immediately() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, _task) = AutoSaver::spawn(sink.clone(), Duration::from_secs(60));

        handle.schedule(snapshot(7));
        assert!(handle.flush().await.unwrap());
        assert_eq!(sink.revisions(), vec![7]);

        assert!(!handle.flush().await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let sink = Arc::new(RecordingSink::default());
        let (handle, task) = AutoSaver::spawn(sink.clone(), Duration::from_secs(60));

        handle.schedule(snapshot(2));
        handle.shutdown().await;
        task.await.unwrap();

        assert_eq!(sink.revisions(), vec![2]);
        assert!(handle.flush().await.is_err());
    }

    #[tokio::test]
    async fn test_registry_changes_reach_the_store() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("track.mp3");
        std::fs::write(&path, b"\xFF\xFB\x90\x00AUDIO").unwrap();

        let store = Arc::new(MetadataStore::with_readers(
            Config::default(),
            vec![Box::new(NativeReader)],
        ));
        let (handle, _task) = AutoSaver::spawn(store.clone(), Duration::from_secs(60));

        let mut registry = CueRegistry::new(Config::default());
        registry.set_track(path.to_string_lossy(), None);
        registry.set_listener(Some(Arc::new(handle.clone())));
        registry.add(CueSpec::new(4, 2500.0)).unwrap();

        assert!(handle.flush().await.unwrap());

        let meta = store.read(&path, false).unwrap();
        assert_eq!(meta.cues.len(), 1);
        assert_eq!(meta.cues[0].id, 4);
        assert_eq!(meta.cues[0].position_ms, 2500.0);
    }
}
