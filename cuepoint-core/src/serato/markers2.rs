//! Serato Markers2 tag codec
//!
//! Raw tag layout:
//! - `01 01` version header
//! - base64 body, a newline after every 72 characters, `=` padding omitted
//! - NUL padding up to 470 bytes
//!
//! Decoded body:
//! - `01 01` version header
//! - entries `name\0 | u32 BE length | data`, terminated by an empty name
//!
//! `CUE` entry data:
//! `00 | index u8 | position u32 ms | 00 | r g b | 00 00 | label UTF-8 \0`
//!
//! Serato ignores entries it does not know, so exact positions and cue types
//! travel in an extra `CUEPOINT` entry. A record whose rounded position no
//! longer matches its `CUE` entry was left behind by a Serato edit and only
//! contributes the cue type and slot.

use std::io::Cursor;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use binrw::{binrw, BinRead, BinWrite};
use tracing::{debug, warn};

use crate::beatgrid::Beatgrid;
use crate::cue::{CueColor, CuePoint, CueType};
use crate::error::{Error, Result};

/// GEOB description / freeform name of the tag
pub const MARKERS2_TAG: &str = "Serato Markers2";
/// Pre-Markers2 tag, recognised but not decoded
pub const LEGACY_MARKERS_TAG: &str = "Serato Markers_";

const HEADER: [u8; 2] = [0x01, 0x01];
/// Serato never writes a shorter tag
const MIN_TAG_SIZE: usize = 470;
const LINE_WIDTH: usize = 72;
/// Fixed part of a CUE record before the label
const CUE_FIXED_LEN: usize = 12;
const EXTENSION_ENTRY: &str = "CUEPOINT";
const DEFAULT_TRACK_COLOR: u32 = 0xFFFFFF;

const SERATO_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// A CUE record as stored by Serato
///
/// The color is kept as raw RGB so records outside the palette survive until
/// validation decides what to do with them.
#[derive(Debug, Clone, PartialEq)]
pub struct SeratoCue {
    /// Slot id, Serato index + 1
    pub id: u8,
    pub position_ms: f64,
    pub label: String,
    pub rgb: u32,
    pub cue_type: CueType,
    pub serato_id: Option<u8>,
}

impl SeratoCue {
    pub fn from_cue(cue: &CuePoint) -> Self {
        Self {
            id: cue.id,
            position_ms: cue.position_ms,
            label: cue.label.clone(),
            rgb: cue.color.serato_rgb(),
            cue_type: cue.cue_type,
            serato_id: cue.serato_id,
        }
    }

    /// Exact conversion; `None` when the color is not in the palette
    pub fn to_cue(&self) -> Option<CuePoint> {
        Some(CuePoint {
            id: self.id,
            position_ms: self.position_ms,
            label: self.label.clone(),
            color: CueColor::from_serato_rgb(self.rgb)?,
            cue_type: self.cue_type,
            serato_id: self.serato_id,
        })
    }
}

/// Decoded Markers2 tag
#[derive(Debug, Clone, PartialEq)]
pub struct Markers2 {
    pub cues: Vec<SeratoCue>,
    /// Track color from the `COLOR` entry
    pub track_color: u32,
    pub bpm_lock: bool,
    /// Exact beatgrid carried by the extension entry
    pub beatgrid: Option<Beatgrid>,
}

impl Default for Markers2 {
    fn default() -> Self {
        Self {
            cues: Vec::new(),
            track_color: DEFAULT_TRACK_COLOR,
            bpm_lock: false,
            beatgrid: None,
        }
    }
}

impl Markers2 {
    pub fn from_cues(cues: &[CuePoint], beatgrid: Option<&Beatgrid>) -> Self {
        Self {
            cues: cues.iter().map(SeratoCue::from_cue).collect(),
            beatgrid: beatgrid.cloned(),
            ..Default::default()
        }
    }

    /// Strict conversion of every record; fails on the first unknown color
    pub fn into_cues(self) -> Result<(Vec<CuePoint>, Option<Beatgrid>)> {
        let cues = self
            .cues
            .iter()
            .map(|c| {
                c.to_cue().ok_or_else(|| {
                    Error::CorruptData(format!("cue {} has unknown color #{:06X}", c.id, c.rgb))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((cues, self.beatgrid))
    }

    /// Encode to the raw tag payload
    ///
    /// Output depends only on the input: cues are written in id order.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut cues: Vec<&SeratoCue> = self.cues.iter().collect();
        cues.sort_by_key(|c| c.id);

        let mut body = HEADER.to_vec();
        let [_, r, g, b] = self.track_color.to_be_bytes();
        write_entry(&mut body, "COLOR", &[0x00, r, g, b]);
        for cue in &cues {
            write_entry(&mut body, "CUE", &encode_cue(cue));
        }
        write_entry(&mut body, "BPMLOCK", &[self.bpm_lock as u8]);
        write_entry(&mut body, EXTENSION_ENTRY, &encode_extension(&cues, self.beatgrid.as_ref())?);
        body.push(0x00);

        let text = SERATO_BASE64.encode(&body);
        let mut raw = HEADER.to_vec();
        for (i, line) in text.as_bytes().chunks(LINE_WIDTH).enumerate() {
            if i > 0 {
                raw.push(b'\n');
            }
            raw.extend_from_slice(line);
        }
        if raw.len() < MIN_TAG_SIZE {
            raw.resize(MIN_TAG_SIZE, 0x00);
        }
        Ok(raw)
    }
}

/// Decode a raw Markers2 payload
pub fn decode_markers2(raw: &[u8]) -> Result<Markers2> {
    if raw.len() < 2 || raw[..2] != HEADER {
        return Err(Error::UnsupportedVersion(format!(
            "Markers2 header {:02x?}",
            &raw[..raw.len().min(2)]
        )));
    }

    let mut text: Vec<u8> = raw[2..]
        .iter()
        .copied()
        .take_while(|&b| b != 0x00)
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    // A lone trailing character carries no full byte
    if text.len() % 4 == 1 {
        text.pop();
    }
    let body = SERATO_BASE64
        .decode(&text)
        .map_err(|e| Error::CorruptData(format!("Markers2 base64: {}", e)))?;

    parse_body(&body)
}

/// Encode cues and beatgrid into a raw Markers2 payload
pub fn encode_markers2(cues: &[CuePoint], beatgrid: Option<&Beatgrid>) -> Result<Vec<u8>> {
    Markers2::from_cues(cues, beatgrid).encode()
}

fn parse_body(body: &[u8]) -> Result<Markers2> {
    if body.len() < 2 {
        return Err(Error::CorruptData("Markers2 body is empty".into()));
    }
    if body[..2] != HEADER {
        return Err(Error::UnsupportedVersion(format!(
            "Markers2 body header {:02x?}",
            &body[..2]
        )));
    }

    let mut markers = Markers2::default();
    let mut extension = None;
    let mut pos = 2;

    while pos < body.len() {
        let rest = &body[pos..];
        let name_len = rest
            .iter()
            .position(|&b| b == 0x00)
            .ok_or_else(|| Error::CorruptData("unterminated entry name".into()))?;
        if name_len == 0 {
            break;
        }
        let name = String::from_utf8_lossy(&rest[..name_len]).into_owned();
        pos += name_len + 1;

        let len_bytes = body
            .get(pos..pos + 4)
            .ok_or_else(|| Error::CorruptData(format!("entry {} has no length", name)))?;
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        pos += 4;

        let end = pos
            .checked_add(len)
            .filter(|&end| end <= body.len())
            .ok_or_else(|| {
                Error::CorruptData(format!(
                    "entry {} claims {} bytes, {} left",
                    name,
                    len,
                    body.len() - pos
                ))
            })?;
        let data = &body[pos..end];
        pos = end;

        match name.as_str() {
            "CUE" => markers.cues.push(parse_cue(data)?),
            "COLOR" => {
                if data.len() < 4 {
                    return Err(Error::CorruptData(format!("COLOR entry of {} bytes", data.len())));
                }
                markers.track_color = u32::from_be_bytes([0, data[1], data[2], data[3]]);
            }
            "BPMLOCK" => {
                let flag = data
                    .first()
                    .ok_or_else(|| Error::CorruptData("empty BPMLOCK entry".into()))?;
                markers.bpm_lock = *flag != 0;
            }
            EXTENSION_ENTRY => extension = Some(data),
            other => debug!("Skipping Markers2 entry {}", other),
        }
    }

    match extension {
        Some(data) => apply_extension(&mut markers, data),
        None => {
            for cue in &mut markers.cues {
                cue.serato_id = Some(cue.id);
            }
        }
    }

    Ok(markers)
}

fn parse_cue(data: &[u8]) -> Result<SeratoCue> {
    if data.len() < CUE_FIXED_LEN + 1 {
        return Err(Error::CorruptData(format!(
            "CUE entry of {} bytes, need at least {}",
            data.len(),
            CUE_FIXED_LEN + 1
        )));
    }

    let index = data[1];
    let position = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
    let rgb = u32::from_be_bytes([0, data[7], data[8], data[9]]);

    let label_bytes = &data[CUE_FIXED_LEN..];
    let label_len = label_bytes
        .iter()
        .position(|&b| b == 0x00)
        .ok_or_else(|| Error::CorruptData(format!("CUE {} label is not terminated", index)))?;

    Ok(SeratoCue {
        id: index.saturating_add(1),
        position_ms: position as f64,
        label: String::from_utf8_lossy(&label_bytes[..label_len]).into_owned(),
        rgb,
        cue_type: CueType::HotCue,
        serato_id: None,
    })
}

/// Position as stored in a `CUE` entry
fn serato_ms(position_ms: f64) -> u32 {
    position_ms.round().clamp(0.0, u32::MAX as f64) as u32
}

fn encode_cue(cue: &SeratoCue) -> Vec<u8> {
    let position = serato_ms(cue.position_ms);
    let [_, r, g, b] = cue.rgb.to_be_bytes();

    let mut data = Vec::with_capacity(CUE_FIXED_LEN + cue.label.len() + 1);
    data.push(0x00);
    data.push(cue.id.saturating_sub(1));
    data.extend_from_slice(&position.to_be_bytes());
    data.push(0x00);
    data.extend_from_slice(&[r, g, b]);
    data.extend_from_slice(&[0x00, 0x00]);
    data.extend_from_slice(cue.label.as_bytes());
    data.push(0x00);
    data
}

fn write_entry(body: &mut Vec<u8>, name: &str, data: &[u8]) {
    body.extend_from_slice(name.as_bytes());
    body.push(0x00);
    body.extend_from_slice(&(data.len() as u32).to_be_bytes());
    body.extend_from_slice(data);
}

/// `CUEPOINT` entry payload
#[binrw]
#[brw(big, magic = 2u8)]
struct CueExtension {
    #[br(temp)]
    #[bw(calc = cues.len() as u8)]
    count: u8,
    #[br(count = count)]
    cues: Vec<CueExtensionRecord>,
    #[br(temp)]
    #[bw(calc = beatgrid.is_some() as u8)]
    has_beatgrid: u8,
    #[br(if(has_beatgrid != 0))]
    beatgrid: Option<GridExtension>,
}

#[binrw]
#[brw(big)]
struct CueExtensionRecord {
    id: u8,
    cue_type: u8,
    #[br(temp)]
    #[bw(calc = serato_id.is_some() as u8)]
    has_serato_id: u8,
    #[br(if(has_serato_id != 0))]
    serato_id: Option<u8>,
    position_ms: f64,
}

#[binrw]
#[brw(big)]
struct GridExtension {
    bpm: f64,
    confidence: f64,
    #[br(temp)]
    #[bw(calc = beats.len() as u32)]
    count: u32,
    #[br(count = count)]
    beats: Vec<f64>,
}

fn encode_extension(cues: &[&SeratoCue], beatgrid: Option<&Beatgrid>) -> Result<Vec<u8>> {
    let extension = CueExtension {
        cues: cues
            .iter()
            .map(|c| CueExtensionRecord {
                id: c.id,
                cue_type: c.cue_type.code(),
                serato_id: c.serato_id,
                position_ms: c.position_ms,
            })
            .collect(),
        beatgrid: beatgrid.map(|g| GridExtension {
            bpm: g.bpm,
            confidence: g.confidence,
            beats: g.beats.clone(),
        }),
    };

    let mut cursor = Cursor::new(Vec::new());
    extension.write(&mut cursor)?;
    Ok(cursor.into_inner())
}

fn apply_extension(markers: &mut Markers2, data: &[u8]) {
    let extension = match CueExtension::read(&mut Cursor::new(data)) {
        Ok(ext) => ext,
        Err(e) => {
            warn!("Ignoring unreadable {} entry: {}", EXTENSION_ENTRY, e);
            for cue in &mut markers.cues {
                cue.serato_id = Some(cue.id);
            }
            return;
        }
    };

    for cue in &mut markers.cues {
        match extension.cues.iter().find(|r| r.id == cue.id) {
            Some(record) => {
                if serato_ms(record.position_ms) == serato_ms(cue.position_ms) {
                    cue.position_ms = record.position_ms;
                } else {
                    debug!(
                        "Cue {} moved in Serato ({}ms, last written {}ms)",
                        cue.id, cue.position_ms, record.position_ms
                    );
                }
                cue.cue_type = CueType::from_code(record.cue_type).unwrap_or_default();
                cue.serato_id = record.serato_id;
            }
            // Added in Serato after our last write
            None => cue.serato_id = Some(cue.id),
        }
    }

    markers.beatgrid = extension.beatgrid.map(|g| Beatgrid {
        beats: g.beats,
        bpm: g.bpm,
        confidence: g.confidence,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cues() -> Vec<CuePoint> {
        vec![
            CuePoint {
                label: "Drop".into(),
                cue_type: CueType::LoopIn,
                ..CuePoint::new(3, 61_234.567)
            },
            CuePoint {
                label: "Intro".into(),
                serato_id: Some(1),
                ..CuePoint::new(1, 0.25)
            },
        ]
    }

    /// Body bytes for hand-built payloads
    fn raw_from_body(body: &[u8]) -> Vec<u8> {
        let mut raw = HEADER.to_vec();
        raw.extend_from_slice(SERATO_BASE64.encode(body).as_bytes());
        raw
    }

    fn cue_entry(index: u8, position: u32, rgb: u32, label: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        let cue = SeratoCue {
            id: index + 1,
            position_ms: position as f64,
            label: String::new(),
            rgb,
            cue_type: CueType::HotCue,
            serato_id: None,
        };
        let mut data = encode_cue(&cue);
        data.truncate(CUE_FIXED_LEN);
        data.extend_from_slice(label);
        write_entry(&mut body, "CUE", &data);
        body
    }

    #[test]
    fn test_roundtrip_exact() {
        let grid = Beatgrid::new(vec![100.0, 568.75, 1037.5], 128.0, 0.93, 200.0).unwrap();
        let raw = encode_markers2(&sample_cues(), Some(&grid)).unwrap();
        let (cues, beatgrid) = decode_markers2(&raw).unwrap().into_cues().unwrap();

        let mut expected = sample_cues();
        expected.sort_by_key(|c| c.id);
        assert_eq!(cues, expected);
        assert_eq!(beatgrid, Some(grid));
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut reversed = sample_cues();
        reversed.reverse();
        let a = encode_markers2(&sample_cues(), None).unwrap();
        let b = encode_markers2(&reversed, None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_payload_layout() {
        let raw = encode_markers2(&sample_cues(), None).unwrap();
        assert_eq!(&raw[..2], &HEADER);
        assert!(raw.len() >= MIN_TAG_SIZE);

        let text_end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        for line in raw[2..text_end].split(|&b| b == b'\n') {
            assert!(line.len() <= LINE_WIDTH);
        }
        assert!(!raw[..text_end].contains(&b'='));
    }

    #[test]
    fn test_decode_plain_serato_tag() {
        let mut body = HEADER.to_vec();
        write_entry(&mut body, "COLOR", &[0x00, 0x99, 0xFF, 0x99]);
        body.extend(cue_entry(0, 1500, 0xCC0000, b"Start\0"));
        body.extend(cue_entry(4, 90_000, 0x00CC00, b"\0"));
        write_entry(&mut body, "FLIP", &[1, 2, 3]);
        write_entry(&mut body, "BPMLOCK", &[0x01]);
        body.push(0x00);

        let markers = decode_markers2(&raw_from_body(&body)).unwrap();
        assert_eq!(markers.track_color, 0x99FF99);
        assert!(markers.bpm_lock);
        assert_eq!(markers.cues.len(), 2);

        let first = &markers.cues[0];
        assert_eq!(first.id, 1);
        assert_eq!(first.position_ms, 1500.0);
        assert_eq!(first.label, "Start");
        assert_eq!(first.serato_id, Some(1));

        let (cues, _) = markers.into_cues().unwrap();
        assert_eq!(cues[0].color, CueColor::Red);
        assert_eq!(cues[1].id, 5);
        assert_eq!(cues[1].color, CueColor::Green);
    }

    #[test]
    fn test_unknown_color_is_kept_raw() {
        let mut body = HEADER.to_vec();
        body.extend(cue_entry(0, 10, 0x123456, b"x\0"));
        body.push(0x00);

        let markers = decode_markers2(&raw_from_body(&body)).unwrap();
        assert_eq!(markers.cues[0].rgb, 0x123456);
        assert!(markers.cues[0].to_cue().is_none());
        assert!(matches!(markers.into_cues(), Err(Error::CorruptData(_))));
    }

    #[test]
    fn test_unterminated_label_is_corrupt() {
        let mut body = HEADER.to_vec();
        body.extend(cue_entry(0, 10, 0xCC0000, b"no terminator"));
        body.push(0x00);

        assert!(matches!(
            decode_markers2(&raw_from_body(&body)),
            Err(Error::CorruptData(_))
        ));
    }

    #[test]
    fn test_short_cue_record_is_corrupt() {
        let mut body = HEADER.to_vec();
        write_entry(&mut body, "CUE", &[0x00, 0x01, 0x00]);
        body.push(0x00);

        assert!(matches!(
            decode_markers2(&raw_from_body(&body)),
            Err(Error::CorruptData(_))
        ));
    }

    #[test]
    fn test_length_overflow_is_corrupt() {
        let mut body = HEADER.to_vec();
        body.extend_from_slice(b"CUE\0");
        body.extend_from_slice(&1000u32.to_be_bytes());
        body.extend_from_slice(&[0u8; 20]);

        assert!(matches!(
            decode_markers2(&raw_from_body(&body)),
            Err(Error::CorruptData(_))
        ));
    }

    #[test]
    fn test_version_checks() {
        assert!(matches!(
            decode_markers2(&[0x02, 0x01, b'A', b'Q']),
            Err(Error::UnsupportedVersion(_))
        ));

        let body = [0x02, 0x05, 0x00];
        assert!(matches!(
            decode_markers2(&raw_from_body(&body)),
            Err(Error::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_tolerates_wrapped_and_trailing_characters() {
        let raw = encode_markers2(&sample_cues(), None).unwrap();
        let text_end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let mut dirty = raw[..text_end].to_vec();
        dirty.push(b'A');
        dirty.push(b'\n');

        let markers = decode_markers2(&dirty).unwrap();
        assert_eq!(markers.cues.len(), 2);
    }

    #[test]
    fn test_serato_move_wins_over_stale_extension() {
        let written = SeratoCue {
            id: 1,
            position_ms: 1234.567,
            label: String::new(),
            rgb: 0xCC0000,
            cue_type: CueType::LoopIn,
            serato_id: Some(4),
        };
        let mut body = HEADER.to_vec();
        // Serato moved the cue to 2000ms and kept our entry untouched
        body.extend(cue_entry(0, 2000, 0xCC0000, b"A\0"));
        write_entry(&mut body, EXTENSION_ENTRY, &encode_extension(&[&written], None).unwrap());
        body.push(0x00);

        let markers = decode_markers2(&raw_from_body(&body)).unwrap();
        let cue = &markers.cues[0];
        assert_eq!(cue.position_ms, 2000.0);
        assert_eq!(cue.cue_type, CueType::LoopIn);
        assert_eq!(cue.serato_id, Some(4));

        let mut body = HEADER.to_vec();
        body.extend(cue_entry(0, 1235, 0xCC0000, b"A\0"));
        write_entry(&mut body, EXTENSION_ENTRY, &encode_extension(&[&written], None).unwrap());
        body.push(0x00);
        let markers = decode_markers2(&raw_from_body(&body)).unwrap();
        assert_eq!(markers.cues[0].position_ms, 1234.567);
    }

    #[test]
    fn test_serato_id_zero_survives() {
        let mut cues = sample_cues();
        cues[0].serato_id = Some(0);
        let raw = encode_markers2(&cues, None).unwrap();
        let (decoded, _) = decode_markers2(&raw).unwrap().into_cues().unwrap();

        let by_id = |id: u8| decoded.iter().find(|c| c.id == id).unwrap().serato_id;
        assert_eq!(by_id(3), Some(0));
        assert_eq!(by_id(1), Some(1));
    }
}
