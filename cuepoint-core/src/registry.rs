//! Cue registry
//!
//! In-memory authority for one track's cues. Every mutation is validated
//! against the slot range, track bounds and the proximity window, bumps the
//! revision and notifies the change listener. The registry never touches disk.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::beatgrid::Beatgrid;
use crate::config::{Config, ConflictResolution};
use crate::cue::{CueColor, CuePoint, CueType, MAX_LABEL_LEN, MIN_CUE_ID};
use crate::error::{Error, Result};

/// Version written into exported documents
pub const DOCUMENT_VERSION: &str = "2.1.0";

/// Characters strict validation refuses in labels
const FORBIDDEN_LABEL_CHARS: [char; 4] = ['<', '>', '&', '"'];

/// Receives a snapshot after every successful mutation
pub trait ChangeListener: Send + Sync {
    fn on_change(&self, snapshot: CueSnapshot);
}

/// Request to create a cue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CueSpec {
    pub id: u8,
    pub position_ms: f64,
    #[serde(default)]
    pub label: String,
    /// Slot color when omitted
    #[serde(default)]
    pub color: Option<CueColor>,
    #[serde(rename = "type", default)]
    pub cue_type: CueType,
    #[serde(default)]
    pub serato_id: Option<u8>,
}

impl CueSpec {
    pub fn new(id: u8, position_ms: f64) -> Self {
        Self {
            id,
            position_ms,
            label: String::new(),
            color: None,
            cue_type: CueType::HotCue,
            serato_id: None,
        }
    }

    fn into_cue(self) -> CuePoint {
        CuePoint {
            id: self.id,
            position_ms: self.position_ms,
            label: self.label,
            color: self.color.unwrap_or_else(|| CueColor::default_for_slot(self.id)),
            cue_type: self.cue_type,
            serato_id: self.serato_id,
        }
    }
}

/// Partial update; `None` leaves the field alone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CueUpdate {
    #[serde(default)]
    pub position_ms: Option<f64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub color: Option<CueColor>,
    #[serde(rename = "type", default)]
    pub cue_type: Option<CueType>,
}

/// A proximity conflict that was accepted instead of rejected
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictWarning {
    pub id: u8,
    pub existing_id: u8,
    pub position_ms: f64,
    pub distance_ms: f64,
    pub resolution: ConflictResolution,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    /// Position of the entry in the submitted batch
    pub index: usize,
    pub id: u8,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchResult {
    pub added: Vec<CuePoint>,
    pub failed: Vec<BatchFailure>,
    /// Whether the registry changed
    pub applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizeStrategy {
    /// Snap cues to the nearest beat within tolerance
    BeatAlign,
    /// Push cues forward until consecutive cues are spaced out
    EvenSpacing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CueMove {
    pub id: u8,
    pub from_ms: f64,
    pub to_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OptimizeReport {
    pub moved: Vec<CueMove>,
    /// Cues left where they were
    pub skipped: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CueStatistics {
    pub total: usize,
    pub by_type: BTreeMap<CueType, usize>,
    pub average_spacing_ms: Option<f64>,
    pub first_position_ms: Option<f64>,
    pub last_position_ms: Option<f64>,
    /// Cue pairs currently inside the proximity window
    pub conflict_count: usize,
    pub warning_count: usize,
    pub has_beatgrid: bool,
    pub revision: u64,
}

/// Immutable copy of the registry handed to listeners
#[derive(Debug, Clone, PartialEq)]
pub struct CueSnapshot {
    pub track_path: Option<String>,
    pub revision: u64,
    pub cues: Vec<CuePoint>,
    pub beatgrid: Option<Beatgrid>,
}

/// Exported JSON document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CueDocument {
    pub version: String,
    #[serde(default)]
    pub track_path: Option<String>,
    pub cues: Vec<CuePoint>,
    #[serde(default)]
    pub beatgrid: Option<Beatgrid>,
}

/// Cues keyed by slot plus the accepted-conflict log
#[derive(Debug, Clone, Default)]
struct CueSet {
    cues: BTreeMap<u8, CuePoint>,
    warnings: Vec<ConflictWarning>,
}

pub struct CueRegistry {
    config: Config,
    track_path: Option<String>,
    duration_ms: Option<f64>,
    set: CueSet,
    beatgrid: Option<Beatgrid>,
    revision: u64,
    listener: Option<Arc<dyn ChangeListener>>,
}

impl CueRegistry {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            track_path: None,
            duration_ms: None,
            set: CueSet::default(),
            beatgrid: None,
            revision: 0,
            listener: None,
        }
    }

    pub fn set_listener(&mut self, listener: Option<Arc<dyn ChangeListener>>) {
        self.listener = listener;
    }

    /// Point the registry at a new track, discarding all state
    pub fn set_track(&mut self, path: impl Into<String>, duration_ms: Option<f64>) {
        self.track_path = Some(path.into());
        self.duration_ms = duration_ms;
        self.set = CueSet::default();
        self.beatgrid = None;
        self.revision = 0;
    }

    /// Seed from a file read without notifying the listener
    ///
    /// Only structural checks apply; cues on disk may sit closer together
    /// than the proximity window allows for new edits.
    pub fn load(&mut self, cues: Vec<CuePoint>, beatgrid: Option<Beatgrid>) -> Result<()> {
        self.set = CueSet {
            cues: self.structural_check(cues)?,
            warnings: Vec::new(),
        };
        self.beatgrid = beatgrid;
        Ok(())
    }

    pub fn track_path(&self) -> Option<&str> {
        self.track_path.as_deref()
    }

    pub fn duration_ms(&self) -> Option<f64> {
        self.duration_ms
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn beatgrid(&self) -> Option<&Beatgrid> {
        self.beatgrid.as_ref()
    }

    pub fn len(&self) -> usize {
        self.set.cues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.cues.is_empty()
    }

    pub fn get(&self, id: u8) -> Option<&CuePoint> {
        self.set.cues.get(&id)
    }

    /// All cues ordered by position, then id
    pub fn cues(&self) -> Vec<CuePoint> {
        let mut cues: Vec<CuePoint> = self.set.cues.values().cloned().collect();
        cues.sort_by(|a, b| a.position_ms.total_cmp(&b.position_ms).then(a.id.cmp(&b.id)));
        cues
    }

    /// Cues with `start_ms <= position <= end_ms`, ordered by position
    pub fn in_range(&self, start_ms: f64, end_ms: f64) -> Vec<CuePoint> {
        self.cues()
            .into_iter()
            .filter(|c| c.position_ms >= start_ms && c.position_ms <= end_ms)
            .collect()
    }

    /// Accepted proximity conflicts, oldest first
    pub fn warnings(&self) -> &[ConflictWarning] {
        &self.set.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<ConflictWarning> {
        std::mem::take(&mut self.set.warnings)
    }

    pub fn snapshot(&self) -> CueSnapshot {
        CueSnapshot {
            track_path: self.track_path.clone(),
            revision: self.revision,
            cues: self.cues(),
            beatgrid: self.beatgrid.clone(),
        }
    }

    pub fn add(&mut self, spec: CueSpec) -> Result<CuePoint> {
        let rules = self.rules();
        let cue = rules.insert(&mut self.set, spec.into_cue())?;
        debug!("Added cue {} at {:.1}ms", cue.id, cue.position_ms);
        self.changed();
        Ok(cue)
    }

    pub fn remove(&mut self, id: u8) -> Result<CuePoint> {
        let cue = self.set.cues.remove(&id).ok_or(Error::NotFound(id))?;
        debug!("Removed cue {}", id);
        self.changed();
        Ok(cue)
    }

    pub fn update(&mut self, id: u8, update: CueUpdate) -> Result<CuePoint> {
        let existing = self.set.cues.get(&id).ok_or(Error::NotFound(id))?;

        let mut cue = existing.clone();
        if let Some(position_ms) = update.position_ms {
            cue.position_ms = position_ms;
        }
        if let Some(label) = update.label {
            cue.label = label;
        }
        if let Some(color) = update.color {
            cue.color = color;
        }
        if let Some(cue_type) = update.cue_type {
            cue.cue_type = cue_type;
        }

        let rules = self.rules();
        let warnings = rules.check(&self.set, &cue, Some(id))?;
        rules.record(&mut self.set, warnings);
        self.set.cues.insert(id, cue.clone());
        self.changed();
        Ok(cue)
    }

    /// Add several cues
    ///
    /// With `validate_batch` the whole batch is checked first, including
    /// entries against each other, and nothing is applied unless all pass.
    /// Otherwise each entry is applied or rejected on its own.
    pub fn add_batch(&mut self, specs: Vec<CueSpec>, validate_batch: bool) -> BatchResult {
        let rules = self.rules();
        let mut result = BatchResult::default();

        if validate_batch {
            let mut scratch = self.set.clone();
            let mut seen = HashSet::new();
            for (index, spec) in specs.into_iter().enumerate() {
                let id = spec.id;
                let outcome = if seen.insert(id) {
                    rules.insert(&mut scratch, spec.into_cue())
                } else {
                    Err(Error::InvalidSlot {
                        id,
                        reason: "duplicated within batch".into(),
                    })
                };
                match outcome {
                    Ok(cue) => result.added.push(cue),
                    Err(e) => result.failed.push(BatchFailure {
                        index,
                        id,
                        error: e.to_string(),
                    }),
                }
            }

            if !result.failed.is_empty() {
                warn!(
                    "Batch of {} rejected, {} invalid entries",
                    result.added.len() + result.failed.len(),
                    result.failed.len()
                );
                result.added.clear();
                return result;
            }
            self.set = scratch;
        } else {
            for (index, spec) in specs.into_iter().enumerate() {
                let id = spec.id;
                match rules.insert(&mut self.set, spec.into_cue()) {
                    Ok(cue) => result.added.push(cue),
                    Err(e) => result.failed.push(BatchFailure {
                        index,
                        id,
                        error: e.to_string(),
                    }),
                }
            }
        }

        result.applied = !result.added.is_empty();
        if result.applied {
            self.changed();
        }
        result
    }

    /// Cue closest to `position_ms`; lowest id wins ties
    pub fn find_nearest(&self, position_ms: f64) -> Option<&CuePoint> {
        let mut best: Option<(&CuePoint, f64)> = None;
        for cue in self.set.cues.values() {
            let distance = (cue.position_ms - position_ms).abs();
            match best {
                Some((_, d)) if distance >= d => {}
                _ => best = Some((cue, distance)),
            }
        }
        best.map(|(cue, _)| cue)
    }

    pub fn optimize(&mut self, strategy: OptimizeStrategy) -> OptimizeReport {
        let report = match strategy {
            OptimizeStrategy::BeatAlign => self.beat_align(),
            OptimizeStrategy::EvenSpacing => self.even_spacing(),
        };
        for m in &report.moved {
            if let Some(cue) = self.set.cues.get_mut(&m.id) {
                cue.position_ms = m.to_ms;
            }
        }
        if !report.moved.is_empty() {
            debug!(
                "Optimized {} cues ({:?}), skipped {}",
                report.moved.len(),
                strategy,
                report.skipped.len()
            );
            self.changed();
        }
        report
    }

    fn beat_align(&self) -> OptimizeReport {
        let mut report = OptimizeReport::default();
        let Some(grid) = self.beatgrid.as_ref().filter(|g| !g.is_empty()) else {
            report.skipped = self.set.cues.keys().copied().collect();
            return report;
        };

        let tolerance = self.config.beat_align_tolerance_ms.min(self.config.max_correction_ms);
        let mut positions: BTreeMap<u8, f64> =
            self.set.cues.iter().map(|(&id, c)| (id, c.position_ms)).collect();

        for (&id, cue) in &self.set.cues {
            let Some(beat) = grid.nearest_beat(cue.position_ms) else {
                report.skipped.push(id);
                continue;
            };
            let distance = (beat - cue.position_ms).abs();
            if distance == 0.0 {
                continue;
            }
            let crowded = positions
                .iter()
                .any(|(&other, &p)| other != id && (p - beat).abs() < self.config.proximity_threshold_ms);
            if distance > tolerance || crowded || !self.within_track(beat) {
                report.skipped.push(id);
                continue;
            }
            positions.insert(id, beat);
            report.moved.push(CueMove {
                id,
                from_ms: cue.position_ms,
                to_ms: beat,
            });
        }
        report
    }

    fn even_spacing(&self) -> OptimizeReport {
        let mut report = OptimizeReport::default();
        let spacing = self.config.min_cue_spacing_ms;
        let mut previous: Option<f64> = None;

        for cue in self.cues() {
            let position = match previous {
                Some(prev) if cue.position_ms - prev < spacing => {
                    let target = prev + spacing;
                    if target - cue.position_ms > self.config.max_correction_ms
                        || !self.within_track(target)
                    {
                        report.skipped.push(cue.id);
                        cue.position_ms
                    } else {
                        report.moved.push(CueMove {
                            id: cue.id,
                            from_ms: cue.position_ms,
                            to_ms: target,
                        });
                        target
                    }
                }
                _ => cue.position_ms,
            };
            previous = Some(position);
        }
        report
    }

    pub fn export_document(&self) -> CueDocument {
        CueDocument {
            version: DOCUMENT_VERSION.to_string(),
            track_path: self.track_path.clone(),
            cues: self.cues(),
            beatgrid: self.beatgrid.clone(),
        }
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export_document())?)
    }

    /// Replace cues and beatgrid with a document's contents
    ///
    /// The whole document is rejected if any entry is invalid.
    pub fn import_document(&mut self, document: CueDocument) -> Result<usize> {
        if document.version.split('.').next() != DOCUMENT_VERSION.split('.').next() {
            return Err(Error::UnsupportedVersion(format!(
                "cue document version {}",
                document.version
            )));
        }
        if let Some(grid) = &document.beatgrid {
            grid.validate(self.config.min_beat_spacing_ms)?;
        }

        let cues = self.structural_check(document.cues)?;
        let count = cues.len();
        self.set = CueSet {
            cues,
            warnings: Vec::new(),
        };
        self.beatgrid = document.beatgrid;
        self.changed();
        Ok(count)
    }

    pub fn import_json(&mut self, json: &str) -> Result<usize> {
        let document: CueDocument = serde_json::from_str(json)?;
        self.import_document(document)
    }

    pub fn set_beatgrid(&mut self, beatgrid: Option<Beatgrid>) -> Result<()> {
        if let Some(grid) = &beatgrid {
            grid.validate(self.config.min_beat_spacing_ms)?;
        }
        self.beatgrid = beatgrid;
        self.changed();
        Ok(())
    }

    pub fn clear(&mut self) {
        if self.set.cues.is_empty() {
            return;
        }
        self.set.cues.clear();
        self.changed();
    }

    pub fn statistics(&self) -> CueStatistics {
        let cues = self.cues();
        let mut by_type = BTreeMap::new();
        for cue in &cues {
            *by_type.entry(cue.cue_type).or_insert(0) += 1;
        }

        let gaps: Vec<f64> = cues.windows(2).map(|w| w[1].position_ms - w[0].position_ms).collect();
        let average_spacing_ms = (!gaps.is_empty()).then(|| gaps.iter().sum::<f64>() / gaps.len() as f64);

        let mut conflict_count = 0;
        for (i, a) in cues.iter().enumerate() {
            for b in &cues[i + 1..] {
                if b.position_ms - a.position_ms < self.config.proximity_threshold_ms {
                    conflict_count += 1;
                }
            }
        }

        CueStatistics {
            total: cues.len(),
            by_type,
            average_spacing_ms,
            first_position_ms: cues.first().map(|c| c.position_ms),
            last_position_ms: cues.last().map(|c| c.position_ms),
            conflict_count,
            warning_count: self.set.warnings.len(),
            has_beatgrid: self.beatgrid.is_some(),
            revision: self.revision,
        }
    }

    fn rules(&self) -> Rules {
        Rules {
            config: self.config.clone(),
            duration_ms: self.duration_ms,
        }
    }

    fn within_track(&self, position_ms: f64) -> bool {
        position_ms >= 0.0 && self.duration_ms.map_or(true, |d| position_ms <= d)
    }

    /// Slot range, unique ids, track bounds and label sanity
    fn structural_check(&self, cues: Vec<CuePoint>) -> Result<BTreeMap<u8, CuePoint>> {
        let rules = self.rules();
        let mut map = BTreeMap::new();
        for cue in cues {
            rules.check_slot(cue.id)?;
            rules.check_position(cue.position_ms)?;
            check_label(&cue.label, false)?;
            if map.contains_key(&cue.id) {
                return Err(Error::InvalidSlot {
                    id: cue.id,
                    reason: "duplicate id".into(),
                });
            }
            map.insert(cue.id, cue);
        }
        Ok(map)
    }

    fn changed(&mut self) {
        self.revision += 1;
        if let Some(listener) = &self.listener {
            listener.on_change(self.snapshot());
        }
    }
}

/// Validation rules for one registry state
struct Rules {
    config: Config,
    duration_ms: Option<f64>,
}

impl Rules {
    /// Validate and insert into `set`
    fn insert(&self, set: &mut CueSet, cue: CuePoint) -> Result<CuePoint> {
        let warnings = self.check(set, &cue, None)?;
        self.record(set, warnings);
        if let Some(old) = set.cues.insert(cue.id, cue.clone()) {
            debug!("Replaced cue {} at {:.1}ms", old.id, old.position_ms);
        }
        Ok(cue)
    }

    fn record(&self, set: &mut CueSet, warnings: Vec<ConflictWarning>) {
        for w in &warnings {
            warn!(
                "Cue {} at {:.1}ms is {:.1}ms from cue {} ({:?})",
                w.id, w.position_ms, w.distance_ms, w.existing_id, w.resolution
            );
        }
        set.warnings.extend(warnings);
    }

    /// Check `cue` against `set`; `exclude` is the slot being edited
    fn check(&self, set: &CueSet, cue: &CuePoint, exclude: Option<u8>) -> Result<Vec<ConflictWarning>> {
        let mode = self.config.conflict_resolution;

        self.check_slot(cue.id)?;
        if exclude != Some(cue.id) && set.cues.contains_key(&cue.id) && mode != ConflictResolution::Replace {
            return Err(Error::InvalidSlot {
                id: cue.id,
                reason: "slot already occupied".into(),
            });
        }
        self.check_position(cue.position_ms)?;
        check_label(&cue.label, self.config.validation_strict)?;

        let mut warnings = Vec::new();
        for other in set.cues.values() {
            // The occupant of the slot is being edited or overwritten
            if other.id == cue.id {
                continue;
            }
            let distance = (other.position_ms - cue.position_ms).abs();
            if distance >= self.config.proximity_threshold_ms {
                continue;
            }
            if mode == ConflictResolution::Strict {
                return Err(Error::NearDuplicate {
                    id: cue.id,
                    position_ms: cue.position_ms,
                    existing_id: other.id,
                    distance_ms: distance,
                });
            }
            warnings.push(ConflictWarning {
                id: cue.id,
                existing_id: other.id,
                position_ms: cue.position_ms,
                distance_ms: distance,
                resolution: mode,
            });
        }
        Ok(warnings)
    }

    fn check_slot(&self, id: u8) -> Result<()> {
        if id < MIN_CUE_ID || id > self.config.max_cues {
            return Err(Error::InvalidSlot {
                id,
                reason: format!("outside {}-{}", MIN_CUE_ID, self.config.max_cues),
            });
        }
        Ok(())
    }

    fn check_position(&self, position_ms: f64) -> Result<()> {
        if !position_ms.is_finite() {
            return Err(Error::InvalidPosition {
                position_ms,
                reason: "not a finite number".into(),
            });
        }
        if position_ms < 0.0 {
            return Err(Error::InvalidPosition {
                position_ms,
                reason: "negative".into(),
            });
        }
        if let Some(duration) = self.duration_ms {
            if position_ms > duration {
                return Err(Error::InvalidPosition {
                    position_ms,
                    reason: format!("past track end at {}ms", duration),
                });
            }
        }
        Ok(())
    }
}

fn check_label(label: &str, strict: bool) -> Result<()> {
    if label.chars().any(char::is_control) {
        return Err(Error::InvalidLabel("contains control characters".into()));
    }
    if strict {
        let chars = label.chars().count();
        if chars > MAX_LABEL_LEN {
            return Err(Error::InvalidLabel(format!(
                "{} characters, maximum {}",
                chars, MAX_LABEL_LEN
            )));
        }
        if let Some(c) = label.chars().find(|c| FORBIDDEN_LABEL_CHARS.contains(c)) {
            return Err(Error::InvalidLabel(format!("contains '{}'", c)));
        }
    }
    Ok(())
}
