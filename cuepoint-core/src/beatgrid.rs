//! Beatgrid model
//!
//! Beat timestamps come from an external detector. The grid keeps them
//! strictly increasing and drops artifacts closer than the minimum spacing.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Detected beats plus derived tempo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Beatgrid {
    /// Beat timestamps in milliseconds, strictly increasing
    pub beats: Vec<f64>,
    pub bpm: f64,
    /// Detection confidence in [0, 1]
    pub confidence: f64,
}

impl Beatgrid {
    /// Build a grid from already-clean data, rejecting invariant violations
    pub fn new(beats: Vec<f64>, bpm: f64, confidence: f64, min_spacing_ms: f64) -> Result<Self> {
        let grid = Self {
            beats,
            bpm,
            confidence,
        };
        grid.validate(min_spacing_ms)?;
        Ok(grid)
    }

    /// Build a grid from raw detector output
    ///
    /// A beat is kept only if it lies at least `min_spacing_ms` after the last
    /// kept beat. Tempo is the median inter-beat interval after IQR outlier
    /// removal; confidence falls with interval spread.
    pub fn from_beats(raw: &[f64], min_spacing_ms: f64) -> Self {
        let mut sorted: Vec<f64> = raw.iter().copied().filter(|b| b.is_finite() && *b >= 0.0).collect();
        sorted.sort_by(f64::total_cmp);

        let mut beats: Vec<f64> = Vec::with_capacity(sorted.len());
        for beat in sorted {
            match beats.last() {
                Some(&last) if beat - last < min_spacing_ms || beat <= last => continue,
                _ => beats.push(beat),
            }
        }

        let (bpm, confidence) = tempo_and_confidence(&beats);
        Self {
            beats,
            bpm,
            confidence,
        }
    }

    pub fn validate(&self, min_spacing_ms: f64) -> Result<()> {
        if !self.bpm.is_finite() || self.bpm < 0.0 {
            return Err(Error::InvalidBeatgrid(format!("bpm {} out of range", self.bpm)));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(Error::InvalidBeatgrid(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let Some(first) = self.beats.first() {
            if !first.is_finite() || *first < 0.0 {
                return Err(Error::InvalidBeatgrid(format!("first beat {} is negative", first)));
            }
        }
        for (i, pair) in self.beats.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            if !pair[1].is_finite() || gap <= 0.0 {
                return Err(Error::InvalidBeatgrid(format!(
                    "beat {} ({}ms) does not follow {}ms",
                    i + 1,
                    pair[1],
                    pair[0]
                )));
            }
            if gap < min_spacing_ms {
                return Err(Error::InvalidBeatgrid(format!(
                    "beats {} and {} are {:.1}ms apart (minimum {}ms)",
                    i,
                    i + 1,
                    gap,
                    min_spacing_ms
                )));
            }
        }
        Ok(())
    }

    /// Beat closest to `position_ms`; earlier beat wins ties
    pub fn nearest_beat(&self, position_ms: f64) -> Option<f64> {
        if self.beats.is_empty() {
            return None;
        }
        let idx = self.beats.partition_point(|&b| b < position_ms);
        let after = self.beats.get(idx).copied();
        let before = idx.checked_sub(1).map(|i| self.beats[i]);

        match (before, after) {
            (Some(b), Some(a)) => {
                if position_ms - b <= a - position_ms {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (Some(b), None) => Some(b),
            (None, a) => a,
        }
    }

    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }
}

fn tempo_and_confidence(beats: &[f64]) -> (f64, f64) {
    if beats.len() < 2 {
        return (0.0, 0.0);
    }

    let mut intervals: Vec<f64> = beats.windows(2).map(|w| w[1] - w[0]).collect();
    intervals.sort_by(f64::total_cmp);

    let q1 = percentile(&intervals, 0.25);
    let q3 = percentile(&intervals, 0.75);
    let iqr = q3 - q1;
    let (lower, upper) = (q1 - 1.5 * iqr, q3 + 1.5 * iqr);

    let mut filtered: Vec<f64> = intervals
        .iter()
        .copied()
        .filter(|&i| i >= lower && i <= upper)
        .collect();
    if filtered.is_empty() {
        filtered = intervals;
    }

    let median = percentile(&filtered, 0.5);
    if median <= 0.0 {
        return (0.0, 0.0);
    }
    let bpm = 60_000.0 / median;

    let mean = filtered.iter().sum::<f64>() / filtered.len() as f64;
    let variance = filtered.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / filtered.len() as f64;
    let mut confidence = (1.0 - variance.sqrt() / median).max(0.0);
    if filtered.len() > 10 {
        confidence = (confidence * 1.1).min(1.0);
    }

    (bpm, confidence)
}

/// Linear-interpolated percentile of sorted data
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
}
