//! ID3v2.3 / ID3v2.4 tag editor
//!
//! Header (10 bytes):
//! - "ID3", major version, revision, flags
//! - tag size, syncsafe, excluding the header
//!
//! Frame header (10 bytes): 4-char id, size (syncsafe in v2.4, plain u32 in
//! v2.3), 2 flag bytes. Padding starts at the first NUL id byte.
//!
//! Reference: https://id3.org/id3v2.4.0-structure

use tracing::debug;

use crate::error::{Error, Result};
use crate::tags::text::{
    choose_encoding, decode_text, encode_text, split_terminated, terminator, ENCODING_LATIN1,
};
use crate::tags::TagContainer;
use crate::track::{StandardField, TagFormat};

const HEADER_LEN: usize = 10;
const FRAME_HEADER_LEN: usize = 10;
/// Room for later edits without moving the audio
const PADDING: usize = 1024;

const FLAG_UNSYNCHRONISATION: u8 = 0x80;
const FLAG_EXTENDED_HEADER: u8 = 0x40;
const FLAG_FOOTER: u8 = 0x10;

const GEOB_MIME: &str = "application/octet-stream";

/// One frame, kept as raw bytes
#[derive(Debug, Clone, PartialEq)]
struct Frame {
    id: [u8; 4],
    flags: [u8; 2],
    data: Vec<u8>,
}

impl Frame {
    fn new(id: &[u8; 4], data: Vec<u8>) -> Self {
        Self {
            id: *id,
            flags: [0, 0],
            data,
        }
    }

    /// Compressed, encrypted or unsynchronised frames are never interpreted
    fn is_plain(&self, major_version: u8) -> bool {
        match major_version {
            3 => self.flags[1] & 0xE0 == 0,
            _ => self.flags[1] & 0x0F == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Id3Tag {
    major_version: u8,
    frames: Vec<Frame>,
    /// Bytes of the original file occupied by the tag
    original_len: usize,
}

impl Id3Tag {
    /// Parse the tag at the start of `bytes`; a file without one gets an empty v2.4 tag
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..3] != b"ID3" {
            return Ok(Self {
                major_version: 4,
                frames: Vec::new(),
                original_len: 0,
            });
        }

        let major_version = bytes[3];
        if major_version != 3 && major_version != 4 {
            return Err(Error::UnsupportedVersion(format!("ID3v2.{}", major_version)));
        }
        let flags = bytes[5];
        if flags & FLAG_UNSYNCHRONISATION != 0 {
            return Err(Error::UnsupportedFormat("unsynchronised ID3 tag".into()));
        }

        let tag_size = syncsafe_to_u32([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        let tag_end = HEADER_LEN + tag_size;
        if tag_end > bytes.len() {
            return Err(Error::CorruptData(format!(
                "ID3 tag of {} bytes in a {} byte file",
                tag_size,
                bytes.len()
            )));
        }
        let footer_len = if major_version == 4 && flags & FLAG_FOOTER != 0 {
            HEADER_LEN
        } else {
            0
        };

        let mut pos = HEADER_LEN;
        if flags & FLAG_EXTENDED_HEADER != 0 {
            let raw = bytes
                .get(pos..pos + 4)
                .ok_or_else(|| Error::CorruptData("truncated extended header".into()))?;
            let raw = [raw[0], raw[1], raw[2], raw[3]];
            pos += match major_version {
                // v2.3 size excludes its own four bytes
                3 => u32::from_be_bytes(raw) as usize + 4,
                _ => syncsafe_to_u32(raw) as usize,
            };
        }

        let mut frames = Vec::new();
        while pos + FRAME_HEADER_LEN <= tag_end {
            let header = &bytes[pos..pos + FRAME_HEADER_LEN];
            if header[0] == 0 {
                break;
            }
            let id = [header[0], header[1], header[2], header[3]];
            if !id.iter().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()) {
                return Err(Error::CorruptData(format!("invalid ID3 frame id {:02x?}", id)));
            }
            let raw_size = [header[4], header[5], header[6], header[7]];
            let size = match major_version {
                3 => u32::from_be_bytes(raw_size),
                _ => syncsafe_to_u32(raw_size),
            } as usize;

            let start = pos + FRAME_HEADER_LEN;
            let end = start
                .checked_add(size)
                .filter(|&end| end <= tag_end)
                .ok_or_else(|| {
                    Error::CorruptData(format!(
                        "frame {} of {} bytes overruns the tag",
                        String::from_utf8_lossy(&id),
                        size
                    ))
                })?;

            frames.push(Frame {
                id,
                flags: [header[8], header[9]],
                data: bytes[start..end].to_vec(),
            });
            pos = end;
        }

        debug!("Parsed ID3v2.{} tag with {} frames", major_version, frames.len());
        Ok(Self {
            major_version,
            frames,
            original_len: tag_end + footer_len,
        })
    }

    pub fn major_version(&self) -> u8 {
        self.major_version
    }

    /// Frame ids in file order
    pub fn frame_ids(&self) -> Vec<String> {
        self.frames
            .iter()
            .map(|f| String::from_utf8_lossy(&f.id).into_owned())
            .collect()
    }

    /// Render the tag itself
    pub fn render(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        for frame in &self.frames {
            let size = u32::try_from(frame.data.len())
                .ok()
                .filter(|&s| self.major_version == 3 || s < (1 << 28))
                .ok_or_else(|| {
                    Error::CorruptData(format!(
                        "frame {} too large",
                        String::from_utf8_lossy(&frame.id)
                    ))
                })?;
            body.extend_from_slice(&frame.id);
            match self.major_version {
                3 => body.extend_from_slice(&size.to_be_bytes()),
                _ => body.extend_from_slice(&u32_to_syncsafe(size)),
            }
            body.extend_from_slice(&frame.flags);
            body.extend_from_slice(&frame.data);
        }
        body.resize(body.len() + PADDING, 0x00);

        let size = u32::try_from(body.len())
            .ok()
            .filter(|&s| s < (1 << 28))
            .ok_or_else(|| Error::CorruptData("ID3 tag too large".into()))?;

        let mut tag = Vec::with_capacity(HEADER_LEN + body.len());
        tag.extend_from_slice(b"ID3");
        tag.push(self.major_version);
        tag.push(0x00);
        tag.push(0x00);
        tag.extend_from_slice(&u32_to_syncsafe(size));
        tag.extend_from_slice(&body);
        Ok(tag)
    }

    fn find_geob(&self, name: &str) -> Option<usize> {
        self.frames.iter().position(|f| {
            &f.id == b"GEOB"
                && f.is_plain(self.major_version)
                && parse_geob(&f.data).map_or(false, |(desc, _)| desc == name)
        })
    }

    fn text_frame_ids(&self, field: StandardField) -> &'static [&'static [u8; 4]] {
        match field {
            StandardField::Title => &[b"TIT2"],
            StandardField::Artist => &[b"TPE1"],
            StandardField::Album => &[b"TALB"],
            StandardField::Genre => &[b"TCON"],
            StandardField::Year if self.major_version == 3 => &[b"TYER", b"TDRC"],
            StandardField::Year => &[b"TDRC", b"TYER"],
            StandardField::TrackNumber => &[b"TRCK"],
            StandardField::Bpm => &[b"TBPM"],
            StandardField::Key => &[b"TKEY"],
            StandardField::Comment => &[b"COMM"],
        }
    }

    /// Replace the first frame matching `pred` in place, else append
    fn upsert(&mut self, frame: Frame, pred: impl Fn(&Frame) -> bool) {
        match self.frames.iter().position(|f| pred(f)) {
            Some(i) => {
                self.frames[i] = frame;
                let mut seen = false;
                self.frames.retain(|f| {
                    if pred(f) {
                        let keep = !seen;
                        seen = true;
                        keep
                    } else {
                        true
                    }
                });
            }
            None => self.frames.push(frame),
        }
    }

    fn comment_index(&self) -> Option<usize> {
        let comments: Vec<usize> = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| &f.id == b"COMM" && f.is_plain(self.major_version))
            .map(|(i, _)| i)
            .collect();
        comments
            .iter()
            .copied()
            .find(|&i| parse_comment(&self.frames[i].data).map_or(false, |(desc, _)| desc.is_empty()))
            .or_else(|| comments.first().copied())
    }
}

impl TagContainer for Id3Tag {
    fn format(&self) -> TagFormat {
        TagFormat::Id3
    }

    fn get_frame(&self, name: &str) -> Option<Vec<u8>> {
        let index = self.find_geob(name)?;
        parse_geob(&self.frames[index].data).map(|(_, data)| data.to_vec())
    }

    fn set_frame(&mut self, name: &str, data: &[u8]) {
        let frame = Frame::new(b"GEOB", build_geob(name, data));
        match self.find_geob(name) {
            Some(i) => self.frames[i] = frame,
            None => self.frames.push(frame),
        }
    }

    fn remove_frame(&mut self, name: &str) -> bool {
        let before = self.frames.len();
        let version = self.major_version;
        self.frames.retain(|f| {
            !(&f.id == b"GEOB"
                && f.is_plain(version)
                && parse_geob(&f.data).map_or(false, |(desc, _)| desc == name))
        });
        self.frames.len() != before
    }

    fn get_text(&self, field: StandardField) -> Option<String> {
        if field == StandardField::Comment {
            let index = self.comment_index()?;
            return parse_comment(&self.frames[index].data)
                .map(|(_, text)| text)
                .filter(|t| !t.is_empty());
        }

        self.text_frame_ids(field).iter().find_map(|id| {
            self.frames
                .iter()
                .find(|f| &f.id == *id && f.is_plain(self.major_version))
                .and_then(|f| parse_text_frame(&f.data))
                .filter(|t| !t.is_empty())
        })
    }

    fn set_text(&mut self, field: StandardField, value: Option<&str>) {
        let version = self.major_version;

        if field == StandardField::Comment {
            match value {
                Some(text) => {
                    let frame = Frame::new(b"COMM", build_comment(text, version));
                    match self.comment_index() {
                        Some(i) => self.frames[i] = frame,
                        None => self.frames.push(frame),
                    }
                }
                None => {
                    if let Some(i) = self.comment_index() {
                        self.frames.remove(i);
                    }
                }
            }
            return;
        }

        let ids = self.text_frame_ids(field);
        let primary = ids[0];
        // Drop the alternate year frame so only one survives
        for id in &ids[1..] {
            self.frames.retain(|f| &f.id != *id);
        }
        match value {
            Some(text) => {
                let frame = Frame::new(primary, build_text_frame(text, version));
                self.upsert(frame, |f| &f.id == primary);
            }
            None => self.frames.retain(|f| &f.id != primary),
        }
    }

    fn write_to(&self, original: &[u8]) -> Result<Vec<u8>> {
        let audio = original.get(self.original_len..).ok_or_else(|| {
            Error::CorruptData("file shorter than its ID3 tag".into())
        })?;
        let mut out = self.render()?;
        out.extend_from_slice(audio);
        Ok(out)
    }
}

fn syncsafe_to_u32(b: [u8; 4]) -> u32 {
    ((b[0] as u32 & 0x7F) << 21) | ((b[1] as u32 & 0x7F) << 14) | ((b[2] as u32 & 0x7F) << 7) | (b[3] as u32 & 0x7F)
}

fn u32_to_syncsafe(v: u32) -> [u8; 4] {
    [
        ((v >> 21) & 0x7F) as u8,
        ((v >> 14) & 0x7F) as u8,
        ((v >> 7) & 0x7F) as u8,
        (v & 0x7F) as u8,
    ]
}

/// GEOB: encoding | mime\0 | filename | description | data
fn parse_geob(data: &[u8]) -> Option<(String, &[u8])> {
    let (&encoding, rest) = data.split_first()?;
    let mime_end = rest.iter().position(|&b| b == 0)?;
    let rest = &rest[mime_end + 1..];
    let (_filename, rest) = split_terminated(rest, encoding);
    let (description, rest) = split_terminated(rest, encoding);
    Some((description, rest))
}

fn build_geob(description: &str, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![ENCODING_LATIN1];
    data.extend_from_slice(GEOB_MIME.as_bytes());
    data.push(0x00);
    // Empty filename
    data.push(0x00);
    data.extend_from_slice(&encode_text(description, ENCODING_LATIN1));
    data.push(0x00);
    data.extend_from_slice(payload);
    data
}

/// Text frame: encoding | text, first value only
fn parse_text_frame(data: &[u8]) -> Option<String> {
    let (&encoding, rest) = data.split_first()?;
    let (text, _) = split_terminated(rest, encoding);
    Some(text)
}

fn build_text_frame(text: &str, major_version: u8) -> Vec<u8> {
    let encoding = choose_encoding(text, major_version);
    let mut data = vec![encoding];
    data.extend_from_slice(&encode_text(text, encoding));
    data
}

/// COMM: encoding | language(3) | description | text
fn parse_comment(data: &[u8]) -> Option<(String, String)> {
    let (&encoding, rest) = data.split_first()?;
    let rest = rest.get(3..)?;
    let (description, rest) = split_terminated(rest, encoding);
    Some((description, decode_text(rest, encoding)))
}

fn build_comment(text: &str, major_version: u8) -> Vec<u8> {
    let encoding = choose_encoding(text, major_version);
    let mut data = vec![encoding];
    data.extend_from_slice(b"eng");
    // Empty description, BOM included for UTF-16
    data.extend_from_slice(&encode_text("", encoding));
    data.extend_from_slice(terminator(encoding));
    data.extend_from_slice(&encode_text(text, encoding));
    data
}
