//! Metadata store: the only component that touches audio files
//!
//! Reads go through the checksum-validated cache and the reader chain.
//! Writes run a small state machine per file:
//!
//! ```text
//! IDLE -> BACKING_UP -> WRITING -> VERIFYING -> COMMITTED
//!                          \            \
//!                           +------------+-> ROLLED_BACK
//! ```
//!
//! A rolled back write leaves the file byte-identical to what it was.
//! Writes to one path are serialized; a read waits for an in-flight write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use rayon::prelude::*;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::beatgrid::Beatgrid;
use crate::cache::{checksum, CacheLookup, CacheStats, MetadataCache};
use crate::config::Config;
use crate::cue::CuePoint;
use crate::error::{Error, Result};
use crate::reader::{default_readers, MetadataReader};
use crate::serato::{self, Markers2, RepairRecord, BEATGRID_TAG, LEGACY_MARKERS_TAG, MARKERS2_TAG};
use crate::tags::{self, TagContainer};
use crate::track::{StandardField, TagFormat, TrackMetadata};
use crate::validate::{sanitize_metadata, validate_metadata};

/// Suffix appended to the full file name of a backup
pub const BACKUP_EXTENSION: &str = "cuebak";

/// Tolerance for BPM read back from containers that store it as an integer
const BPM_TOLERANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteState {
    Idle,
    BackingUp,
    Writing,
    Verifying,
    Committed,
    RolledBack,
}

/// Summary of a committed write
#[derive(Debug, Clone, Serialize)]
pub struct WriteReport {
    pub path: PathBuf,
    /// States visited, in order
    pub states: Vec<WriteState>,
    /// Backup left on disk when `retain_backup` is set
    pub backup_path: Option<PathBuf>,
    pub bytes_written: usize,
}

/// What a write replaces
#[derive(Clone, Copy)]
enum WriteScope {
    /// Serato frames and every standard field
    Full,
    /// Serato frames only
    CuesOnly,
}

pub struct MetadataStore {
    config: Config,
    cache: MetadataCache,
    readers: Vec<Box<dyn MetadataReader>>,
    locks: Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>,
}

impl MetadataStore {
    pub fn new(config: Config) -> Self {
        Self::with_readers(config, default_readers())
    }

    /// Store with a custom reader chain, tried in order
    pub fn with_readers(config: Config, readers: Vec<Box<dyn MetadataReader>>) -> Self {
        Self {
            cache: MetadataCache::new(config.cache_capacity),
            config,
            readers,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Lock shared by every spelling of the same file
    fn path_lock(&self, path: &Path) -> Arc<RwLock<()>> {
        let key = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Entries only the map still holds are idle
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key).or_default().clone()
    }

    /// Read a track's metadata, cues and beatgrid
    pub fn read(&self, path: &Path, use_cache: bool) -> Result<TrackMetadata> {
        let lock = self.path_lock(path);
        let _guard = lock.read().unwrap_or_else(PoisonError::into_inner);

        let bytes = fs::read(path)?;
        let sum = checksum(&bytes);
        let use_cache = use_cache && self.config.cache_enabled;

        if use_cache {
            match self.cache.lookup(path, sum) {
                CacheLookup::Hit(meta) => {
                    debug!("Cache hit for {:?}", path);
                    return Ok(meta);
                }
                CacheLookup::Invalidated => info!("Cache invalidated for {:?}, file changed on disk", path),
                CacheLookup::Miss => {}
            }
        }

        let meta = self.parse(path, &bytes)?;
        if use_cache {
            self.cache.insert(path, sum, meta.clone());
        }
        Ok(meta)
    }

    fn parse(&self, path: &Path, bytes: &[u8]) -> Result<TrackMetadata> {
        let mut errors = Vec::new();
        let mut meta = None;
        for reader in &self.readers {
            match reader.read_fields(path, bytes) {
                Ok(m) => {
                    meta = Some(m);
                    break;
                }
                Err(e) => {
                    debug!("{} reader failed on {:?}: {}", reader.name(), path, e);
                    errors.push(format!("{}: {}", reader.name(), e));
                }
            }
        }
        let mut meta = meta.ok_or_else(|| Error::UnreadableMetadata {
            path: path.to_path_buf(),
            errors,
        })?;
        meta.format = TagFormat::from_path(path);

        let (cues, beatgrid, repairs) = self.read_serato(path, meta.format, bytes, meta.duration_ms);
        meta = meta.with_serato(cues, beatgrid);
        meta.repairs = repairs;

        if self.config.validation_strict {
            let result = validate_metadata(&meta);
            for warning in &result.warnings {
                warn!("{:?}: {}", path, warning);
            }
            if !result.valid {
                if self.config.auto_repair {
                    sanitize_metadata(&mut meta);
                } else {
                    warn!("{:?}: {}", path, result.errors.join("; "));
                }
            }
        }

        debug!("Read {:?}: {} cues", path, meta.cues.len());
        Ok(meta)
    }

    /// Serato data never fails a read; problems degrade to no cues
    fn read_serato(
        &self,
        path: &Path,
        format: TagFormat,
        bytes: &[u8],
        duration_ms: Option<f64>,
    ) -> (Vec<CuePoint>, Option<Beatgrid>, Vec<RepairRecord>) {
        let container = match tags::read_container(format, bytes) {
            Ok(c) => c,
            Err(e) => {
                warn!("Cannot open tags of {:?}, loading without cues: {}", path, e);
                return (Vec::new(), None, Vec::new());
            }
        };

        let markers = match container.get_frame(MARKERS2_TAG) {
            Some(raw) => match serato::decode_markers2(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!("Serato Markers2 in {:?} unreadable, loading without cues: {}", path, e);
                    Markers2::default()
                }
            },
            None => {
                if container.get_frame(LEGACY_MARKERS_TAG).is_some() {
                    let e = Error::UnsupportedVersion(LEGACY_MARKERS_TAG.into());
                    warn!("{:?}: {}", path, e);
                }
                Markers2::default()
            }
        };

        let (cues, repairs) = self.convert_cues(path, &markers, duration_ms);

        let beatgrid = markers.beatgrid.or_else(|| {
            let raw = container.get_frame(BEATGRID_TAG)?;
            serato::decode_beatgrid(&raw, duration_ms, self.config.min_beat_spacing_ms)
                .unwrap_or_else(|e| {
                    warn!("Serato BeatGrid in {:?} unreadable: {}", path, e);
                    None
                })
        });

        (cues, beatgrid, repairs)
    }

    fn convert_cues(
        &self,
        path: &Path,
        markers: &Markers2,
        duration_ms: Option<f64>,
    ) -> (Vec<CuePoint>, Vec<RepairRecord>) {
        let mut cues: Vec<CuePoint> = Vec::with_capacity(markers.cues.len());
        let mut repairs = Vec::new();
        for raw in &markers.cues {
            let issues = serato::validate(raw, duration_ms, &self.config);
            let only_label = issues.iter().all(|i| matches!(i, serato::ValidationIssue::EmptyLabel));

            let cue = if issues.is_empty() || (only_label && !self.config.auto_repair) {
                raw.to_cue()
            } else if self.config.auto_repair {
                let outcome = serato::repair(raw, &issues, duration_ms, &self.config);
                repairs.extend(outcome.records);
                Some(outcome.cue)
            } else {
                warn!("{:?}: skipping cue {}: {:?}", path, raw.id, issues);
                None
            };

            if let Some(cue) = cue {
                if cues.iter().any(|c| c.id == cue.id) {
                    warn!("{:?}: dropping second cue in slot {}", path, cue.id);
                } else {
                    cues.push(cue);
                }
            }
        }
        (cues, repairs)
    }

    /// Write metadata, cues and beatgrid to `path`
    pub fn write(&self, path: &Path, meta: &TrackMetadata) -> Result<WriteReport> {
        self.commit(path, meta, WriteScope::Full)
    }

    /// Write only the Serato frames, leaving standard fields as they are
    pub fn save_cues(&self, path: &Path, cues: &[CuePoint], beatgrid: Option<&Beatgrid>) -> Result<WriteReport> {
        let mut meta = TrackMetadata::new(path);
        meta.cues = cues.to_vec();
        meta.beatgrid = beatgrid.cloned();
        self.commit(path, &meta, WriteScope::CuesOnly)
    }

    fn commit(&self, path: &Path, meta: &TrackMetadata, scope: WriteScope) -> Result<WriteReport> {
        let format = TagFormat::from_path(path);
        if format == TagFormat::Unknown {
            return Err(Error::UnsupportedFormat(format!("{:?}", path)));
        }

        let lock = self.path_lock(path);
        let _guard = lock.write().unwrap_or_else(PoisonError::into_inner);

        let mut states = vec![WriteState::Idle, WriteState::BackingUp];
        let original = fs::read(path).map_err(|source| Error::BackupFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let backup_path = if self.config.backup_on_write {
            let backup = backup_path_for(path);
            fs::copy(path, &backup).map_err(|source| Error::BackupFailed {
                path: path.to_path_buf(),
                source,
            })?;
            debug!("Backed up {:?} to {:?}", path, backup);
            Some(backup)
        } else {
            None
        };

        states.push(WriteState::Writing);
        let outcome = self.write_tags(path, format, &original, meta, scope).and_then(|written| {
            states.push(WriteState::Verifying);
            self.verify(path, format, meta, scope).map(|_| written)
        });

        // The file changed or is about to be restored either way
        self.cache.remove(path);

        match outcome {
            Ok(bytes_written) => {
                states.push(WriteState::Committed);
                let backup_path = match backup_path {
                    Some(backup) if !self.config.retain_backup => {
                        if let Err(e) = fs::remove_file(&backup) {
                            warn!("Could not remove backup {:?}: {}", backup, e);
                        }
                        None
                    }
                    other => other,
                };
                info!("Wrote {} cues to {:?}", meta.cues.len(), path);
                Ok(WriteReport {
                    path: path.to_path_buf(),
                    states,
                    backup_path,
                    bytes_written,
                })
            }
            Err(e) => {
                states.push(WriteState::RolledBack);
                warn!("Write to {:?} failed, rolling back ({:?}): {}", path, states, e);
                self.rollback(path, &original, backup_path.as_deref());
                Err(Error::WriteFailed {
                    path: path.to_path_buf(),
                    source: Box::new(e),
                })
            }
        }
    }

    fn write_tags(
        &self,
        path: &Path,
        format: TagFormat,
        original: &[u8],
        meta: &TrackMetadata,
        scope: WriteScope,
    ) -> Result<usize> {
        let mut container = tags::read_container(format, original)?;

        let markers = serato::encode_markers2(&meta.cues, meta.beatgrid.as_ref())?;
        container.set_frame(MARKERS2_TAG, &markers);
        match meta.beatgrid.as_ref().filter(|g| !g.is_empty()) {
            Some(grid) => container.set_frame(BEATGRID_TAG, &serato::encode_beatgrid(grid)?),
            None => {
                container.remove_frame(BEATGRID_TAG);
            }
        }

        if let WriteScope::Full = scope {
            for field in StandardField::ALL {
                container.set_text(field, meta.field(field).as_deref());
            }
        }

        let bytes = container.write_to(original)?;
        atomic_replace(path, &bytes)?;
        Ok(bytes.len())
    }

    /// Re-read the written file with the native codec and compare
    fn verify(&self, path: &Path, format: TagFormat, meta: &TrackMetadata, scope: WriteScope) -> Result<()> {
        let bytes = fs::read(path)?;
        let container = tags::read_container(format, &bytes)?;

        let raw = container
            .get_frame(MARKERS2_TAG)
            .ok_or_else(|| Error::CorruptData("Markers2 missing after write".into()))?;
        let (mut cues, beatgrid) = serato::decode_markers2(&raw)?.into_cues()?;
        let mut expected = meta.cues.clone();
        cues.sort_by_key(|c| c.id);
        expected.sort_by_key(|c| c.id);
        if cues != expected {
            return Err(Error::CorruptData("cues read back differ from cues written".into()));
        }
        if beatgrid != meta.beatgrid {
            return Err(Error::CorruptData("beatgrid read back differs from beatgrid written".into()));
        }

        if let WriteScope::Full = scope {
            verify_fields(meta, container.as_ref())?;
        }
        Ok(())
    }

    fn rollback(&self, path: &Path, original: &[u8], backup: Option<&Path>) {
        match atomic_replace(path, original) {
            Ok(()) => {
                if let Some(backup) = backup.filter(|_| !self.config.retain_backup) {
                    if let Err(e) = fs::remove_file(backup) {
                        warn!("Could not remove backup {:?}: {}", backup, e);
                    }
                }
                info!("Rolled back {:?}", path);
            }
            Err(e) => error!(
                "Rollback of {:?} failed: {}; backup kept at {:?}",
                path, e, backup
            ),
        }
    }

    /// Read many files on a bounded worker pool
    ///
    /// Each path gets its own result; one failure does not stop the rest.
    pub fn read_batch(&self, paths: &[PathBuf], max_workers: usize) -> HashMap<PathBuf, Result<TrackMetadata>> {
        let read_one = |path: &PathBuf| (path.clone(), self.read(path, true));

        match rayon::ThreadPoolBuilder::new().num_threads(max_workers.max(1)).build() {
            Ok(pool) => pool.install(|| paths.par_iter().map(read_one).collect()),
            Err(e) => {
                warn!("Could not build read pool, reading sequentially: {}", e);
                paths.iter().map(read_one).collect()
            }
        }
    }

    /// Remove backups under `dir` older than `max_age`; returns how many
    pub fn cleanup_backups(&self, dir: &Path, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(BACKUP_EXTENSION)
            {
                continue;
            }
            let modified = entry.metadata().map_err(|e| Error::Io(e.into()))?.modified()?;
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= max_age {
                fs::remove_file(path)?;
                debug!("Removed stale backup {:?}", path);
                removed += 1;
            }
        }
        if removed > 0 {
            info!("Removed {} stale backups under {:?}", removed, dir);
        }
        Ok(removed)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("Metadata cache cleared");
    }
}

/// `<file>.<ext>.cuebak` next to the file
pub fn backup_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(BACKUP_EXTENSION);
    path.with_file_name(name)
}

/// Audio files under `dir` that have a tag container
pub fn audio_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| TagFormat::from_path(p) != TagFormat::Unknown)
        .collect();
    files.sort();
    files
}

/// Replace `path` through a sibling temp file and a rename
fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(temp.path(), metadata.permissions())?;
    }
    temp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

fn verify_fields(meta: &TrackMetadata, container: &dyn TagContainer) -> Result<()> {
    let mut expected = TrackMetadata::default();
    let mut actual = TrackMetadata::default();
    for field in StandardField::ALL {
        expected.set_field(field, meta.field(field));
        actual.set_field(field, container.get_text(field));

        let matches = match field {
            StandardField::Bpm => match (expected.bpm, actual.bpm) {
                (Some(a), Some(b)) => (a - b).abs() <= BPM_TOLERANCE,
                (a, b) => a.is_none() && b.is_none(),
            },
            _ => expected.field(field) == actual.field(field),
        };
        if !matches {
            return Err(Error::CorruptData(format!(
                "{:?} read back as {:?}, wrote {:?}",
                field,
                actual.field(field),
                expected.field(field)
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cue::{CueColor, CueType};
    use crate::reader::NativeReader;
    use crate::tags::id3::Id3Tag;
    use tempfile::TempDir;

    /// MPEG frame sync followed by silence
    const FAKE_AUDIO: &[u8] = b"\xFF\xFB\x90\x00AUDIO-PAYLOAD";

    struct FailingReader;

    impl MetadataReader for FailingReader {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn read_fields(&self, _path: &Path, _bytes: &[u8]) -> Result<TrackMetadata> {
            Err(Error::Reader {
                reader: "failing",
                message: "no luck".into(),
            })
        }
    }

    fn native_store(config: Config) -> MetadataStore {
        MetadataStore::with_readers(config, vec![Box::new(FailingReader), Box::new(NativeReader)])
    }

    fn syncsafe(n: usize) -> [u8; 4] {
        [(n >> 21) as u8 & 0x7F, (n >> 14) as u8 & 0x7F, (n >> 7) as u8 & 0x7F, n as u8 & 0x7F]
    }

    fn raw_frame(id: &[u8; 4], data: &[u8]) -> Vec<u8> {
        let mut frame = id.to_vec();
        frame.extend_from_slice(&syncsafe(data.len()));
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(data);
        frame
    }

    /// ID3v2.4 file with a title and a PRIV frame the codec does not interpret
    fn write_mp3(dir: &Path, name: &str, title: &str) -> PathBuf {
        let mut title_data = vec![0x03];
        title_data.extend_from_slice(title.as_bytes());
        let mut frames = raw_frame(b"TIT2", &title_data);
        frames.extend(raw_frame(b"PRIV", b"owner\0private-bytes"));

        let mut bytes = b"ID3\x04\x00\x00".to_vec();
        bytes.extend_from_slice(&syncsafe(frames.len()));
        bytes.extend(frames);
        bytes.extend_from_slice(FAKE_AUDIO);

        let path = dir.join(name);
        fs::write(&path, bytes).unwrap();
        path
    }

    fn sample_cues() -> Vec<CuePoint> {
        let mut drop = CuePoint::new(1, 1234.5);
        drop.label = "Drop".into();
        let mut outro = CuePoint::new(3, 9000.25);
        outro.label = "Outro".into();
        outro.color = CueColor::Green;
        outro.cue_type = CueType::Outro;
        vec![drop, outro]
    }

    #[test]
    fn test_write_then_read() {
        let tmp = TempDir::new().unwrap();
        let path = write_mp3(tmp.path(), "track.mp3", "Original");
        let store = native_store(Config::default());

        let mut meta = store.read(&path, true).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Original"));
        assert!(meta.cues.is_empty());

        meta.cues = sample_cues();
        meta.artist = Some("Someone".into());
        meta.beatgrid = Some(Beatgrid::new(vec![500.0, 1000.0, 1500.0], 120.0, 0.8, 200.0).unwrap());
        let report = store.write(&path, &meta).unwrap();
        assert_eq!(
            report.states,
            vec![
                WriteState::Idle,
                WriteState::BackingUp,
                WriteState::Writing,
                WriteState::Verifying,
                WriteState::Committed
            ]
        );
        assert!(report.backup_path.is_none());
        assert!(!backup_path_for(&path).exists());

        let reread = store.read(&path, true).unwrap();
        assert_eq!(reread.cues, sample_cues());
        assert_eq!(reread.artist.as_deref(), Some("Someone"));
        assert_eq!(reread.beatgrid, meta.beatgrid);
        assert!(fs::read(&path).unwrap().ends_with(FAKE_AUDIO));
    }

    #[test]
    fn test_unknown_frames_preserved_across_writes() {
        let tmp = TempDir::new().unwrap();
        let path = write_mp3(tmp.path(), "track.mp3", "Original");
        let store = native_store(Config::default());

        store.save_cues(&path, &sample_cues(), None).unwrap();

        let bytes = fs::read(&path).unwrap();
        let tag = Id3Tag::parse(&bytes).unwrap();
        assert_eq!(tag.frame_ids(), vec!["TIT2", "PRIV", "GEOB"]);
        assert!(bytes.windows(19).any(|w| w == b"owner\0private-bytes"));
        assert_eq!(tag.get_text(StandardField::Title).as_deref(), Some("Original"));
    }

    #[test]
    fn test_failed_verification_rolls_back_byte_identical() {
        let tmp = TempDir::new().unwrap();
        let path = write_mp3(tmp.path(), "track.mp3", "Original");
        let before = fs::read(&path).unwrap();
        let store = native_store(Config::default());

        // A NUL ends the label early when read back
        let mut cue = CuePoint::new(1, 1000.0);
        cue.label = "bro\0ken".into();
        let err = store.save_cues(&path, &[cue], None).unwrap_err();

        assert!(matches!(err, Error::WriteFailed { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
        assert!(!backup_path_for(&path).exists());
    }

    #[test]
    fn test_corrupt_tag_fails_write_without_changes() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("broken.mp3");
        // ID3v2.4 header claiming a frame that overruns the tag
        let mut bytes = b"ID3\x04\x00\x00\x00\x00\x00\x14TIT2\x00\x00\x01\x00\x00\x00".to_vec();
        bytes.resize(30, 0);
        bytes.extend_from_slice(FAKE_AUDIO);
        fs::write(&path, &bytes).unwrap();

        let store = native_store(Config {
            retain_backup: true,
            ..Config::default()
        });
        let err = store.save_cues(&path, &sample_cues(), None).unwrap_err();

        assert!(matches!(err, Error::WriteFailed { .. }));
        assert_eq!(fs::read(&path).unwrap(), bytes);
        assert_eq!(fs::read(backup_path_for(&path)).unwrap(), bytes);
    }

    #[test]
    fn test_retained_backup_and_no_backup_mode() {
        let tmp = TempDir::new().unwrap();
        let path = write_mp3(tmp.path(), "track.mp3", "Original");
        let before = fs::read(&path).unwrap();

        let store = native_store(Config {
            retain_backup: true,
            ..Config::default()
        });
        let report = store.save_cues(&path, &sample_cues(), None).unwrap();
        let backup = report.backup_path.unwrap();
        assert_eq!(backup, tmp.path().join("track.mp3.cuebak"));
        assert_eq!(fs::read(&backup).unwrap(), before);

        let store = native_store(Config {
            backup_on_write: false,
            ..Config::default()
        });
        let other = write_mp3(tmp.path(), "other.mp3", "Other");
        let report = store.save_cues(&other, &sample_cues(), None).unwrap();
        assert!(report.backup_path.is_none());
        assert!(!backup_path_for(&other).exists());
    }

    #[test]
    fn test_cache_invalidated_after_external_change() {
        let tmp = TempDir::new().unwrap();
        let path = write_mp3(tmp.path(), "track.mp3", "First");
        let store = native_store(Config::default());

        assert_eq!(store.read(&path, true).unwrap().title.as_deref(), Some("First"));
        assert_eq!(store.read(&path, true).unwrap().title.as_deref(), Some("First"));

        write_mp3(tmp.path(), "track.mp3", "Second");
        assert_eq!(store.read(&path, true).unwrap().title.as_deref(), Some("Second"));

        let stats = store.cache_stats();
        assert_eq!((stats.hits, stats.misses, stats.invalidations), (1, 1, 1));

        store.clear_cache();
        assert_eq!(store.cache_stats().entries, 0);
    }

    #[test]
    fn test_all_readers_failing_aggregates_errors() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("track.wav");
        fs::write(&path, b"RIFF....WAVE").unwrap();
        let store = native_store(Config::default());

        match store.read(&path, false) {
            Err(Error::UnreadableMetadata { errors, .. }) => {
                assert_eq!(errors.len(), 2);
                assert!(errors[0].starts_with("failing"));
                assert!(errors[1].starts_with("native"));
            }
            other => panic!("expected UnreadableMetadata, got {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_markers_degrade_to_no_cues() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("track.mp3");
        let mut tag = Id3Tag::parse(b"").unwrap();
        tag.set_text(StandardField::Title, Some("Still here"));
        tag.set_frame(MARKERS2_TAG, b"\x02\x01garbage");
        fs::write(&path, tag.write_to(FAKE_AUDIO).unwrap()).unwrap();

        let meta = native_store(Config::default()).read(&path, false).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Still here"));
        assert!(meta.cues.is_empty());
    }

    #[test]
    fn test_read_batch_isolates_failures() {
        let tmp = TempDir::new().unwrap();
        let a = write_mp3(tmp.path(), "a.mp3", "A");
        let b = write_mp3(tmp.path(), "b.mp3", "B");
        let missing = tmp.path().join("missing.mp3");
        let store = native_store(Config::default());

        let results = store.read_batch(&[a.clone(), b.clone(), missing.clone()], 2);
        assert_eq!(results.len(), 3);
        assert_eq!(results[&a].as_ref().unwrap().title.as_deref(), Some("A"));
        assert_eq!(results[&b].as_ref().unwrap().title.as_deref(), Some("B"));
        assert!(results[&missing].is_err());
    }

    #[test]
    fn test_cleanup_backups_and_audio_files() {
        let tmp = TempDir::new().unwrap();
        let track = write_mp3(tmp.path(), "track.mp3", "T");
        fs::write(backup_path_for(&track), b"old").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"keep").unwrap();

        assert_eq!(audio_files(tmp.path()), vec![track.clone()]);

        let store = native_store(Config::default());
        assert_eq!(store.cleanup_backups(tmp.path(), Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(store.cleanup_backups(tmp.path(), Duration::ZERO).unwrap(), 1);
        assert!(!backup_path_for(&track).exists());
        assert!(tmp.path().join("notes.txt").exists());
    }

    #[test]
    fn test_unsupported_format_rejected_before_backup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("track.wav");
        fs::write(&path, b"RIFF").unwrap();

        let err = native_store(Config::default()).save_cues(&path, &[], None).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
        assert!(!backup_path_for(&path).exists());
    }

    #[test]
    fn test_missing_file_fails_backup() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("gone.mp3");

        let err = native_store(Config::default()).save_cues(&path, &sample_cues(), None).unwrap_err();
        assert!(matches!(err, Error::BackupFailed { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_repaired_cue_keeps_original_values() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("track.mp3");
        let markers = Markers2 {
            cues: vec![serato::SeratoCue {
                id: 1,
                position_ms: 1000.0,
                label: "Drop".into(),
                rgb: 0x123456,
                cue_type: CueType::HotCue,
                serato_id: Some(1),
            }],
            ..Markers2::default()
        };
        let mut tag = Id3Tag::parse(b"").unwrap();
        tag.set_frame(MARKERS2_TAG, &markers.encode().unwrap());
        fs::write(&path, tag.write_to(FAKE_AUDIO).unwrap()).unwrap();

        let meta = native_store(Config::default()).read(&path, false).unwrap();
        assert_eq!(meta.cues.len(), 1);
        assert_eq!(meta.repairs.len(), 1);
        let record = &meta.repairs[0];
        assert_eq!((record.cue_id, record.field.as_str()), (1, "color"));
        assert_eq!(record.original, "#123456");
        assert_eq!(record.repaired, format!("#{:06X}", meta.cues[0].color.serato_rgb()));
    }

    #[test]
    fn test_concurrent_saves_leave_one_complete_snapshot() {
        let tmp = TempDir::new().unwrap();
        let path = write_mp3(tmp.path(), "track.mp3", "Original");
        let store = native_store(Config::default());

        let snapshot = |n: u32| {
            let mut first = CuePoint::new(1, 1000.0 + n as f64);
            first.label = format!("Take {}", n);
            let mut second = CuePoint::new(2, 5000.0 + n as f64);
            second.label = format!("Take {}", n);
            vec![first, second]
        };
        let is_whole = |cues: &[CuePoint]| {
            cues.is_empty() || (0..8).any(|n| cues == snapshot(n).as_slice())
        };

        std::thread::scope(|scope| {
            for n in 0..8 {
                let (store, path, cues) = (&store, &path, snapshot(n));
                scope.spawn(move || store.save_cues(path, &cues, None).unwrap());
            }
            for _ in 0..4 {
                let (store, path) = (&store, &path);
                scope.spawn(move || {
                    for _ in 0..5 {
                        let meta = store.read(path, false).unwrap();
                        assert!(is_whole(&meta.cues), "torn read: {:?}", meta.cues);
                    }
                });
            }
        });

        let last = store.read(&path, false).unwrap();
        assert_eq!(last.cues.len(), 2);
        assert!(is_whole(&last.cues));
        assert_eq!(last.title.as_deref(), Some("Original"));
        assert!(!backup_path_for(&path).exists());
    }

    #[test]
    fn test_path_spellings_share_one_lock() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        let path = write_mp3(tmp.path(), "track.mp3", "T");
        let store = native_store(Config::default());

        let a = store.path_lock(&path);
        let b = store.path_lock(&tmp.path().join("sub").join("..").join("track.mp3"));
        assert!(Arc::ptr_eq(&a, &b));

        drop((a, b));
        let _other = store.path_lock(&tmp.path().join("sub"));
        assert_eq!(store.locks.lock().unwrap().len(), 1);
    }
}
