//! Serato BeatGrid tag codec
//!
//! Layout (big-endian): `01 00 | u32 marker count | markers | footer u8`.
//! Each marker is `f32 position seconds` followed by either `u32 beats until
//! the next marker` or, for the terminal marker, the `f32 bpm`.

use std::io::Cursor;

use binrw::{binrw, BinRead, BinWrite};

use crate::beatgrid::Beatgrid;
use crate::error::{Error, Result};

/// GEOB description / freeform name of the tag
pub const BEATGRID_TAG: &str = "Serato BeatGrid";

/// Confidence assigned to grids that only exist as Serato markers
const SERATO_GRID_CONFIDENCE: f64 = 0.9;
/// Ten hours at 300 BPM
const MAX_BEATS: usize = 180_000;

#[binrw]
#[brw(big, magic = b"\x01\x00")]
struct BeatGridTag {
    #[br(temp)]
    #[bw(calc = markers.len() as u32)]
    count: u32,
    #[br(count = count)]
    markers: Vec<GridMarker>,
    footer: u8,
}

#[binrw]
#[brw(big)]
struct GridMarker {
    position_secs: f32,
    /// Beats until the next marker, or the bpm's f32 bits on the last marker
    value: u32,
}

/// Encode a beatgrid as one marker per beat
pub fn encode_beatgrid(grid: &Beatgrid) -> Result<Vec<u8>> {
    let last = grid.beats.len().saturating_sub(1);
    let markers = grid
        .beats
        .iter()
        .enumerate()
        .map(|(i, &beat)| GridMarker {
            position_secs: (beat / 1000.0) as f32,
            value: if i == last { (grid.bpm as f32).to_bits() } else { 1 },
        })
        .collect();

    let tag = BeatGridTag { markers, footer: 0 };
    let mut cursor = Cursor::new(Vec::new());
    tag.write(&mut cursor)?;
    Ok(cursor.into_inner())
}

/// Decode a BeatGrid tag into beat timestamps
///
/// Beats between markers are spread evenly. The terminal marker's tempo is
/// extended to `duration_ms` when known. Returns `None` for an empty grid.
pub fn decode_beatgrid(
    raw: &[u8],
    duration_ms: Option<f64>,
    min_spacing_ms: f64,
) -> Result<Option<Beatgrid>> {
    let tag = BeatGridTag::read(&mut Cursor::new(raw))?;
    let Some((terminal, rest)) = tag.markers.split_last() else {
        return Ok(None);
    };

    let mut beats = Vec::new();
    for (i, marker) in rest.iter().enumerate() {
        let start = marker.position_secs as f64 * 1000.0;
        let next = tag.markers[i + 1].position_secs as f64 * 1000.0;
        let count = marker.value.max(1) as usize;
        if count > MAX_BEATS - beats.len() {
            return Err(Error::CorruptData(format!(
                "BeatGrid marker {} spans {} beats, limit is {}",
                i, count, MAX_BEATS
            )));
        }
        let step = (next - start) / count as f64;
        beats.extend((0..count).map(|n| start + n as f64 * step));
    }

    let bpm = f32::from_bits(terminal.value) as f64;
    if !bpm.is_finite() || bpm < 0.0 {
        return Err(Error::CorruptData(format!("BeatGrid terminal bpm {}", bpm)));
    }
    let terminal_ms = terminal.position_secs as f64 * 1000.0;
    beats.push(terminal_ms);
    if bpm > 0.0 && 60_000.0 / bpm < min_spacing_ms.max(1.0) {
        return Err(Error::CorruptData(format!(
            "BeatGrid terminal bpm {} is faster than the {}ms beat spacing",
            bpm, min_spacing_ms
        )));
    }
    if let (Some(duration), true) = (duration_ms, bpm > 0.0) {
        let step = 60_000.0 / bpm;
        let mut t = terminal_ms + step;
        while t <= duration {
            if beats.len() >= MAX_BEATS {
                return Err(Error::CorruptData(format!(
                    "BeatGrid extends past {} beats",
                    MAX_BEATS
                )));
            }
            beats.push(t);
            t += step;
        }
    }

    let mut grid = Beatgrid::from_beats(&beats, min_spacing_ms);
    if bpm > 0.0 {
        grid.bpm = bpm;
    }
    grid.confidence = SERATO_GRID_CONFIDENCE;
    Ok(Some(grid))
}
