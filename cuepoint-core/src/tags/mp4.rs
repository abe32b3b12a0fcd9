//! MP4 / M4A tag editor
//!
//! Only `moov` is parsed. Metadata lives in `moov/udta/meta/ilst`:
//! - standard items (`©nam`, `©ART`, `tmpo`, `trkn`, ...) each hold a `data` atom
//! - freeform `----` items hold `mean`, `name` and `data` atoms
//!
//! When `moov` sits in front of `mdat`, growing it moves the media data, so
//! every `stco`/`co64` chunk offset is shifted by the size change.

use tracing::debug;

use crate::error::{Error, Result};
use crate::tags::{unwrap_envelope, wrap_envelope, TagContainer};
use crate::track::{StandardField, TagFormat};

const SERATO_MEAN: &str = "com.serato.dj";
const ITUNES_MEAN: &str = "com.apple.iTunes";

/// `data` atom type indicators
const DATA_UTF8: u32 = 1;
const DATA_INTEGER: u32 = 21;
const DATA_IMPLICIT: u32 = 0;

/// Atoms whose payload is a list of child atoms
const CONTAINERS: [&[u8; 4]; 9] = [
    b"moov", b"trak", b"mdia", b"minf", b"stbl", b"udta", b"edts", b"dinf", b"meta",
];

/// iTunes metadata handler, required for players to read `ilst`
const HDLR_MDIR: [u8; 25] = [
    0, 0, 0, 0, // version/flags
    0, 0, 0, 0, // pre_defined
    b'm', b'd', b'i', b'r', b'a', b'p', b'p', b'l', // handler, reserved
    0, 0, 0, 0, 0, 0, 0, 0, // reserved
    0, // empty name
];

#[derive(Debug, Clone, PartialEq)]
enum Body {
    Leaf(Vec<u8>),
    /// `prefix` holds the version/flags of full boxes such as `meta`;
    /// `trailer` holds bytes after the last child too short to be an atom
    Container {
        prefix: Vec<u8>,
        children: Vec<Atom>,
        trailer: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct Atom {
    kind: [u8; 4],
    body: Body,
}

impl Atom {
    fn leaf(kind: &[u8; 4], data: Vec<u8>) -> Self {
        Self {
            kind: *kind,
            body: Body::Leaf(data),
        }
    }

    fn container(kind: &[u8; 4], prefix: Vec<u8>, children: Vec<Atom>) -> Self {
        Self {
            kind: *kind,
            body: Body::Container {
                prefix,
                children,
                trailer: Vec::new(),
            },
        }
    }

    fn children(&self) -> &[Atom] {
        match &self.body {
            Body::Container { children, .. } => children,
            Body::Leaf(_) => &[],
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Atom>> {
        match &mut self.body {
            Body::Container { children, .. } => Some(children),
            Body::Leaf(_) => None,
        }
    }

    fn child(&self, kind: &[u8; 4]) -> Option<&Atom> {
        self.children().iter().find(|a| &a.kind == kind)
    }

    fn leaf_data(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Leaf(data) => Some(data),
            Body::Container { .. } => None,
        }
    }

    /// Child container, created at the end when missing
    fn ensure_child(&mut self, kind: &[u8; 4], make: impl FnOnce() -> Atom) -> Option<&mut Atom> {
        let children = self.children_mut()?;
        let index = match children.iter().position(|a| &a.kind == kind) {
            Some(i) => i,
            None => {
                children.push(make());
                children.len() - 1
            }
        };
        children.get_mut(index)
    }

    fn render(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&[0, 0, 0, 0]);
        out.extend_from_slice(&self.kind);
        match &self.body {
            Body::Leaf(data) => out.extend_from_slice(data),
            Body::Container {
                prefix,
                children,
                trailer,
            } => {
                out.extend_from_slice(prefix);
                for child in children {
                    child.render(out);
                }
                out.extend_from_slice(trailer);
            }
        }
        let size = (out.len() - start) as u32;
        out[start..start + 4].copy_from_slice(&size.to_be_bytes());
    }

    fn rendered_len(&self) -> usize {
        let mut out = Vec::new();
        self.render(&mut out);
        out.len()
    }

    /// Add `delta` to every chunk offset below this atom
    fn shift_chunk_offsets(&mut self, delta: i64) -> Result<()> {
        match &mut self.body {
            Body::Container { children, .. } => {
                for child in children {
                    child.shift_chunk_offsets(delta)?;
                }
            }
            Body::Leaf(data) if &self.kind == b"stco" || &self.kind == b"co64" => {
                let width = if &self.kind == b"stco" { 4 } else { 8 };
                let count = data
                    .get(4..8)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]) as usize)
                    .ok_or_else(|| Error::CorruptData("truncated chunk offset table".into()))?;
                if data.len() < 8 + count * width {
                    return Err(Error::CorruptData("chunk offset table overruns its atom".into()));
                }
                for entry in data[8..8 + count * width].chunks_exact_mut(width) {
                    if width == 4 {
                        let v = u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]) as i64 + delta;
                        let v = u32::try_from(v)
                            .map_err(|_| Error::CorruptData("chunk offset out of range".into()))?;
                        entry.copy_from_slice(&v.to_be_bytes());
                    } else {
                        let mut raw = [0u8; 8];
                        raw.copy_from_slice(entry);
                        let v = u64::from_be_bytes(raw) as i64 + delta;
                        entry.copy_from_slice(&(v as u64).to_be_bytes());
                    }
                }
            }
            Body::Leaf(_) => {}
        }
        Ok(())
    }
}

/// Top-level atom location: (kind, offset, size)
fn scan_top_level(bytes: &[u8]) -> Result<Vec<([u8; 4], usize, usize)>> {
    let mut atoms = Vec::new();
    let mut pos = 0;
    while pos + 8 <= bytes.len() {
        let (kind, _, size) = read_header(bytes, pos)?;
        atoms.push((kind, pos, size));
        pos += size;
    }
    Ok(atoms)
}

/// Atom header at `pos`: (kind, header length, total size)
fn read_header(bytes: &[u8], pos: usize) -> Result<([u8; 4], usize, usize)> {
    let h = &bytes[pos..pos + 8];
    let size32 = u32::from_be_bytes([h[0], h[1], h[2], h[3]]) as usize;
    let kind = [h[4], h[5], h[6], h[7]];
    let (header_len, size) = match size32 {
        0 => (8, bytes.len() - pos),
        1 => {
            let ext = bytes
                .get(pos + 8..pos + 16)
                .ok_or_else(|| Error::CorruptData("truncated 64-bit atom size".into()))?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(ext);
            (16, u64::from_be_bytes(raw) as usize)
        }
        n => (8, n),
    };
    if size < header_len || pos.checked_add(size).map_or(true, |end| end > bytes.len()) {
        return Err(Error::CorruptData(format!(
            "atom {} of {} bytes at offset {} overruns its parent",
            String::from_utf8_lossy(&kind),
            size,
            pos
        )));
    }
    Ok((kind, header_len, size))
}

/// Child atoms plus any trailing bytes, such as the `udta` terminator
type Children = (Vec<Atom>, Vec<u8>);

fn parse_atoms(bytes: &[u8]) -> Result<Children> {
    walk(bytes, parse_atom)
}

fn walk(bytes: &[u8], parse: impl Fn([u8; 4], &[u8]) -> Result<Atom>) -> Result<Children> {
    let mut atoms = Vec::new();
    let mut pos = 0;
    while pos + 8 <= bytes.len() {
        let (kind, header_len, size) = read_header(bytes, pos)?;
        atoms.push(parse(kind, &bytes[pos + header_len..pos + size])?);
        pos += size;
    }
    Ok((atoms, bytes[pos..].to_vec()))
}

fn container_with_trailer(kind: &[u8; 4], prefix: Vec<u8>, (children, trailer): Children) -> Atom {
    Atom {
        kind: *kind,
        body: Body::Container {
            prefix,
            children,
            trailer,
        },
    }
}

/// `ilst` items hold child atoms; anything unparseable is kept raw
fn parse_item(kind: [u8; 4], payload: &[u8]) -> Result<Atom> {
    if let Ok(children) = parse_atoms(payload) {
        let item = container_with_trailer(&kind, Vec::new(), children);
        if item.rendered_len() == payload.len() + 8 {
            return Ok(item);
        }
    }
    Ok(Atom::leaf(&kind, payload.to_vec()))
}

fn parse_atom(kind: [u8; 4], payload: &[u8]) -> Result<Atom> {
    if &kind == b"ilst" {
        return Ok(container_with_trailer(&kind, Vec::new(), walk(payload, parse_item)?));
    }
    if !CONTAINERS.contains(&&kind) {
        return Ok(Atom::leaf(&kind, payload.to_vec()));
    }
    // ISO `meta` is a full box; QuickTime `meta` is not
    let prefix_len = if &kind == b"meta" && payload.len() >= 4 && payload[..4] == [0, 0, 0, 0] {
        4
    } else {
        0
    };
    let children = parse_atoms(&payload[prefix_len..])?;
    Ok(container_with_trailer(&kind, payload[..prefix_len].to_vec(), children))
}

/// Payload of the first `data` child: (type indicator, value)
fn item_data(item: &Atom) -> Option<(u32, &[u8])> {
    let data = item.child(b"data")?.leaf_data()?;
    if data.len() < 8 {
        return None;
    }
    let kind = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) & 0x00FF_FFFF;
    Some((kind, &data[8..]))
}

fn data_atom(kind: u32, value: &[u8]) -> Atom {
    let mut data = kind.to_be_bytes().to_vec();
    data.extend_from_slice(&[0, 0, 0, 0]);
    data.extend_from_slice(value);
    Atom::leaf(b"data", data)
}

/// `mean`/`name` payload after the 4 version/flag bytes
fn full_box_text(atom: Option<&Atom>) -> Option<String> {
    let data = atom?.leaf_data()?;
    data.get(4..).map(|t| String::from_utf8_lossy(t).into_owned())
}

fn freeform_item(mean: &str, name: &str, value: &[u8]) -> Atom {
    let text = |s: &str| {
        let mut data = vec![0, 0, 0, 0];
        data.extend_from_slice(s.as_bytes());
        data
    };
    Atom::container(
        b"----",
        Vec::new(),
        vec![
            Atom::leaf(b"mean", text(mean)),
            Atom::leaf(b"name", text(name)),
            data_atom(DATA_UTF8, value),
        ],
    )
}

fn is_freeform(item: &Atom, mean: &str, name: &str) -> bool {
    &item.kind == b"----"
        && full_box_text(item.child(b"mean")).as_deref() == Some(mean)
        && full_box_text(item.child(b"name")).map_or(false, |n| n.eq_ignore_ascii_case(name))
}

/// Freeform item name for a Serato frame
fn serato_item_name(frame: &str) -> String {
    match frame {
        "Serato Markers2" => "markersv2".to_string(),
        "Serato BeatGrid" => "beatgrid".to_string(),
        other => other
            .trim_start_matches("Serato ")
            .to_lowercase()
            .replace(' ', ""),
    }
}

#[derive(Debug, Clone)]
pub struct Mp4Tag {
    moov: Atom,
    moov_offset: usize,
    moov_len: usize,
    /// Chunk offsets point past `moov`
    moov_before_mdat: bool,
    duration_ms: Option<f64>,
}

impl Mp4Tag {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let top = scan_top_level(bytes)?;
        if !top.iter().any(|(kind, _, _)| kind == b"ftyp") {
            return Err(Error::UnsupportedFormat("not an MP4 file (no ftyp atom)".into()));
        }
        let &(_, moov_offset, moov_len) = top
            .iter()
            .find(|(kind, _, _)| kind == b"moov")
            .ok_or_else(|| Error::CorruptData("MP4 file has no moov atom".into()))?;
        let mdat_offset = top
            .iter()
            .find(|(kind, _, _)| kind == b"mdat")
            .map(|&(_, offset, _)| offset);

        let (kind, header_len, _) = read_header(bytes, moov_offset)?;
        let moov = parse_atom(kind, &bytes[moov_offset + header_len..moov_offset + moov_len])?;
        let duration_ms = moov
            .child(b"mvhd")
            .and_then(|a| a.leaf_data())
            .and_then(parse_mvhd_duration);

        debug!("Parsed MP4 moov of {} bytes at offset {}", moov_len, moov_offset);
        Ok(Self {
            moov,
            moov_offset,
            moov_len,
            moov_before_mdat: mdat_offset.map_or(false, |m| moov_offset < m),
            duration_ms,
        })
    }

    fn ilst(&self) -> Option<&Atom> {
        self.moov.child(b"udta")?.child(b"meta")?.child(b"ilst")
    }

    /// `moov/udta/meta/ilst`, created on demand
    fn ilst_mut(&mut self) -> Option<&mut Vec<Atom>> {
        let udta = self
            .moov
            .ensure_child(b"udta", || Atom::container(b"udta", Vec::new(), Vec::new()))?;
        let meta = udta.ensure_child(b"meta", || {
            Atom::container(
                b"meta",
                vec![0, 0, 0, 0],
                vec![Atom::leaf(b"hdlr", HDLR_MDIR.to_vec())],
            )
        })?;
        let ilst = meta.ensure_child(b"ilst", || Atom::container(b"ilst", Vec::new(), Vec::new()))?;
        ilst.children_mut()
    }

    fn items(&self) -> &[Atom] {
        self.ilst().map(Atom::children).unwrap_or(&[])
    }

    fn replace_item(&mut self, item: Option<Atom>, matches: impl Fn(&Atom) -> bool) -> bool {
        if item.is_none() && self.ilst().is_none() {
            return false;
        }
        let Some(items) = self.ilst_mut() else {
            return false;
        };
        let position = items.iter().position(|a| matches(a));
        let before = items.len();
        items.retain(|a| !matches(a));
        match (item, position) {
            (Some(item), Some(i)) => items.insert(i.min(items.len()), item),
            (Some(item), None) => items.push(item),
            (None, _) => {}
        }
        items.len() != before || position.is_some()
    }

    fn text_item(field: StandardField) -> Option<[u8; 4]> {
        match field {
            StandardField::Title => Some(*b"\xA9nam"),
            StandardField::Artist => Some(*b"\xA9ART"),
            StandardField::Album => Some(*b"\xA9alb"),
            StandardField::Genre => Some(*b"\xA9gen"),
            StandardField::Year => Some(*b"\xA9day"),
            StandardField::Comment => Some(*b"\xA9cmt"),
            _ => None,
        }
    }
}

fn parse_mvhd_duration(data: &[u8]) -> Option<f64> {
    let (timescale, duration) = match data.first()? {
        0 => {
            let b = data.get(12..20)?;
            (
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
                u32::from_be_bytes([b[4], b[5], b[6], b[7]]) as f64,
            )
        }
        _ => {
            let b = data.get(20..32)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&b[4..12]);
            (
                u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as f64,
                u64::from_be_bytes(raw) as f64,
            )
        }
    };
    (timescale > 0.0).then(|| duration / timescale * 1000.0)
}

impl TagContainer for Mp4Tag {
    fn format(&self) -> TagFormat {
        TagFormat::Mp4
    }

    fn get_frame(&self, name: &str) -> Option<Vec<u8>> {
        let item_name = serato_item_name(name);
        let item = self.items().iter().find(|a| is_freeform(a, SERATO_MEAN, &item_name))?;
        let (_, value) = item_data(item)?;
        unwrap_envelope(name, &String::from_utf8_lossy(value))
    }

    fn set_frame(&mut self, name: &str, data: &[u8]) {
        let item_name = serato_item_name(name);
        let item = freeform_item(SERATO_MEAN, &item_name, wrap_envelope(name, data).as_bytes());
        self.replace_item(Some(item), |a| is_freeform(a, SERATO_MEAN, &item_name));
    }

    fn remove_frame(&mut self, name: &str) -> bool {
        let item_name = serato_item_name(name);
        if !self.items().iter().any(|a| is_freeform(a, SERATO_MEAN, &item_name)) {
            return false;
        }
        self.replace_item(None, |a| is_freeform(a, SERATO_MEAN, &item_name))
    }

    fn get_text(&self, field: StandardField) -> Option<String> {
        let items = self.items();
        let value = match field {
            StandardField::Bpm => {
                let (_, v) = items.iter().find(|a| &a.kind == b"tmpo").and_then(item_data)?;
                (v.len() >= 2).then(|| u16::from_be_bytes([v[0], v[1]]).to_string())
            }
            StandardField::TrackNumber => {
                let (_, v) = items.iter().find(|a| &a.kind == b"trkn").and_then(item_data)?;
                (v.len() >= 4).then(|| u16::from_be_bytes([v[2], v[3]]).to_string())
            }
            StandardField::Key => items
                .iter()
                .find(|a| is_freeform(a, ITUNES_MEAN, "initialkey"))
                .and_then(item_data)
                .map(|(_, v)| String::from_utf8_lossy(v).into_owned()),
            _ => {
                let kind = Self::text_item(field)?;
                items
                    .iter()
                    .find(|a| a.kind == kind)
                    .and_then(item_data)
                    .map(|(_, v)| String::from_utf8_lossy(v).into_owned())
            }
        };
        value.filter(|v| !v.is_empty())
    }

    fn set_text(&mut self, field: StandardField, value: Option<&str>) {
        match field {
            StandardField::Bpm => {
                let item = value
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .map(|bpm| bpm.round().clamp(0.0, u16::MAX as f64) as u16)
                    .map(|bpm| {
                        Atom::container(b"tmpo", Vec::new(), vec![data_atom(DATA_INTEGER, &bpm.to_be_bytes())])
                    });
                self.replace_item(item, |a| &a.kind == b"tmpo");
            }
            StandardField::TrackNumber => {
                let item = value
                    .and_then(|v| v.split('/').next().and_then(|n| n.trim().parse::<u16>().ok()))
                    .map(|n| {
                        let [hi, lo] = n.to_be_bytes();
                        let value = [0, 0, hi, lo, 0, 0, 0, 0];
                        Atom::container(b"trkn", Vec::new(), vec![data_atom(DATA_IMPLICIT, &value)])
                    });
                self.replace_item(item, |a| &a.kind == b"trkn");
            }
            StandardField::Key => {
                let item = value.map(|v| freeform_item(ITUNES_MEAN, "initialkey", v.as_bytes()));
                self.replace_item(item, |a| is_freeform(a, ITUNES_MEAN, "initialkey"));
            }
            _ => {
                let Some(kind) = Self::text_item(field) else {
                    return;
                };
                let item = value.map(|v| {
                    Atom::container(&kind, Vec::new(), vec![data_atom(DATA_UTF8, v.as_bytes())])
                });
                self.replace_item(item, |a| a.kind == kind);
            }
        }
    }

    fn duration_ms(&self) -> Option<f64> {
        self.duration_ms
    }

    fn write_to(&self, original: &[u8]) -> Result<Vec<u8>> {
        let moov_end = self.moov_offset + self.moov_len;
        if moov_end > original.len() {
            return Err(Error::CorruptData("file shorter than its moov atom".into()));
        }

        let mut moov = self.moov.clone();
        let delta = moov.rendered_len() as i64 - self.moov_len as i64;
        if self.moov_before_mdat && delta != 0 {
            debug!("Shifting chunk offsets by {} bytes", delta);
            moov.shift_chunk_offsets(delta)?;
        }

        let mut out = Vec::with_capacity((original.len() as i64 + delta.max(0)) as usize);
        out.extend_from_slice(&original[..self.moov_offset]);
        moov.render(&mut out);
        out.extend_from_slice(&original[moov_end..]);
        Ok(out)
    }
}
