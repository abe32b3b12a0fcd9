//! FLAC Vorbis comment editor
//!
//! File layout: optional ID3v2 prefix, "fLaC", metadata blocks, audio frames.
//! Block header: 1 bit last-block flag, 7 bit type, 24 bit big-endian length.
//! VORBIS_COMMENT (type 4) is little-endian: vendor string, comment count,
//! then `KEY=value` strings, each prefixed with a u32 length.

use tracing::debug;

use crate::error::{Error, Result};
use crate::tags::{unwrap_envelope, wrap_envelope, TagContainer};
use crate::track::{StandardField, TagFormat};

const BLOCK_STREAMINFO: u8 = 0;
const BLOCK_VORBIS_COMMENT: u8 = 4;
const LAST_BLOCK: u8 = 0x80;
const MAX_BLOCK_LEN: usize = 0x00FF_FFFF;
const VENDOR: &str = "cuepoint";

#[derive(Debug, Clone)]
struct Block {
    kind: u8,
    data: Vec<u8>,
}

/// One Vorbis comment entry
#[derive(Debug, Clone, PartialEq)]
enum Comment {
    Field { key: String, value: String },
    /// Not UTF-8 or without `=`; written back byte for byte
    Raw(Vec<u8>),
}

impl Comment {
    fn field(&self) -> Option<(&str, &str)> {
        match self {
            Comment::Field { key, value } => Some((key.as_str(), value.as_str())),
            Comment::Raw(_) => None,
        }
    }

    fn has_key(&self, wanted: &str) -> bool {
        self.field().is_some_and(|(key, _)| key.eq_ignore_ascii_case(wanted))
    }
}

#[derive(Debug, Clone)]
pub struct FlacTag {
    /// ID3v2 tag some encoders put in front of "fLaC"
    prefix_len: usize,
    blocks: Vec<Block>,
    vendor: Vec<u8>,
    comments: Vec<Comment>,
    /// Offset of the first audio frame in the original file
    audio_offset: usize,
}

impl FlacTag {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let prefix_len = id3_prefix_len(bytes);
        if bytes.get(prefix_len..prefix_len + 4) != Some(b"fLaC".as_slice()) {
            return Err(Error::UnsupportedFormat("missing fLaC marker".into()));
        }

        let mut pos = prefix_len + 4;
        let mut blocks = Vec::new();
        loop {
            let header = bytes
                .get(pos..pos + 4)
                .ok_or_else(|| Error::CorruptData("truncated FLAC block header".into()))?;
            let last = header[0] & LAST_BLOCK != 0;
            let kind = header[0] & 0x7F;
            let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
            let data = bytes.get(pos + 4..pos + 4 + len).ok_or_else(|| {
                Error::CorruptData(format!("FLAC block type {} of {} bytes overruns the file", kind, len))
            })?;
            blocks.push(Block {
                kind,
                data: data.to_vec(),
            });
            pos += 4 + len;
            if last {
                break;
            }
        }

        if blocks.first().map(|b| b.kind) != Some(BLOCK_STREAMINFO) {
            return Err(Error::CorruptData("first FLAC block is not STREAMINFO".into()));
        }

        let (vendor, comments) = match blocks.iter().find(|b| b.kind == BLOCK_VORBIS_COMMENT) {
            Some(block) => parse_comments(&block.data)?,
            None => (VENDOR.as_bytes().to_vec(), Vec::new()),
        };

        debug!("Parsed FLAC with {} blocks, {} comments", blocks.len(), comments.len());
        Ok(Self {
            prefix_len,
            blocks,
            vendor,
            comments,
            audio_offset: pos,
        })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.comments
            .iter()
            .find(|c| c.has_key(key))
            .and_then(Comment::field)
            .map(|(_, value)| value)
    }

    /// Replace the first entry for `key` in place, dropping the rest
    fn set(&mut self, key: &str, value: Option<String>) -> bool {
        let position = self.comments.iter().position(|c| c.has_key(key));
        let before = self.comments.len();
        self.comments.retain(|c| !c.has_key(key));
        if let Some(value) = value {
            let index = position.unwrap_or(self.comments.len()).min(self.comments.len());
            self.comments.insert(
                index,
                Comment::Field {
                    key: key.to_string(),
                    value,
                },
            );
        }
        self.comments.len() != before || position.is_some()
    }

    pub fn comment_keys(&self) -> Vec<&str> {
        self.comments.iter().filter_map(Comment::field).map(|(key, _)| key).collect()
    }

    fn comment_block(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&(self.vendor.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.vendor);
        data.extend_from_slice(&(self.comments.len() as u32).to_le_bytes());
        for comment in &self.comments {
            let entry = match comment {
                Comment::Field { key, value } => format!("{}={}", key, value).into_bytes(),
                Comment::Raw(raw) => raw.clone(),
            };
            data.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            data.extend_from_slice(&entry);
        }
        data
    }
}

fn comment_key(field: StandardField) -> &'static str {
    match field {
        StandardField::Title => "TITLE",
        StandardField::Artist => "ARTIST",
        StandardField::Album => "ALBUM",
        StandardField::Genre => "GENRE",
        StandardField::Year => "DATE",
        StandardField::TrackNumber => "TRACKNUMBER",
        StandardField::Comment => "COMMENT",
        StandardField::Bpm => "BPM",
        StandardField::Key => "INITIALKEY",
    }
}

/// Comment key for a Serato frame
fn serato_key(frame: &str) -> String {
    match frame {
        "Serato Markers2" => "SERATO_MARKERS_V2".to_string(),
        "Serato BeatGrid" => "SERATO_BEATGRID".to_string(),
        other => other.to_uppercase().replace(' ', "_"),
    }
}

fn id3_prefix_len(bytes: &[u8]) -> usize {
    if bytes.len() < 10 || &bytes[..3] != b"ID3" {
        return 0;
    }
    let s = &bytes[6..10];
    let size = ((s[0] as usize & 0x7F) << 21)
        | ((s[1] as usize & 0x7F) << 14)
        | ((s[2] as usize & 0x7F) << 7)
        | (s[3] as usize & 0x7F);
    10 + size
}

fn parse_comments(data: &[u8]) -> Result<(Vec<u8>, Vec<Comment>)> {
    let mut pos = 0;
    let read_u32 = |pos: &mut usize| -> Result<usize> {
        let b = data
            .get(*pos..*pos + 4)
            .ok_or_else(|| Error::CorruptData("truncated Vorbis comment block".into()))?;
        *pos += 4;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    };

    let vendor_len = read_u32(&mut pos)?;
    let vendor = data
        .get(pos..pos + vendor_len)
        .ok_or_else(|| Error::CorruptData("Vorbis vendor string overruns its block".into()))?;
    let vendor = vendor.to_vec();
    pos += vendor_len;

    let count = read_u32(&mut pos)?;
    let mut comments = Vec::new();
    for _ in 0..count {
        let len = read_u32(&mut pos)?;
        let entry = data
            .get(pos..pos + len)
            .ok_or_else(|| Error::CorruptData("Vorbis comment overruns its block".into()))?;
        pos += len;
        let field = std::str::from_utf8(entry).ok().and_then(|e| e.split_once('='));
        comments.push(match field {
            Some((key, value)) => Comment::Field {
                key: key.to_string(),
                value: value.to_string(),
            },
            None => {
                debug!("Keeping malformed Vorbis comment of {} bytes as is", entry.len());
                Comment::Raw(entry.to_vec())
            }
        });
    }
    Ok((vendor, comments))
}

/// Track length from STREAMINFO: 20 bit sample rate, 36 bit sample count
fn streaminfo_duration(data: &[u8]) -> Option<f64> {
    let b = data.get(10..18)?;
    let sample_rate = ((b[0] as u64) << 12) | ((b[1] as u64) << 4) | ((b[2] as u64) >> 4);
    let total_samples = (((b[3] & 0x0F) as u64) << 32)
        | ((b[4] as u64) << 24)
        | ((b[5] as u64) << 16)
        | ((b[6] as u64) << 8)
        | (b[7] as u64);
    (sample_rate > 0 && total_samples > 0).then(|| total_samples as f64 / sample_rate as f64 * 1000.0)
}

impl TagContainer for FlacTag {
    fn format(&self) -> TagFormat {
        TagFormat::Flac
    }

    fn get_frame(&self, name: &str) -> Option<Vec<u8>> {
        unwrap_envelope(name, self.get(&serato_key(name))?)
    }

    fn set_frame(&mut self, name: &str, data: &[u8]) {
        let value = wrap_envelope(name, data);
        self.set(&serato_key(name), Some(value));
    }

    fn remove_frame(&mut self, name: &str) -> bool {
        self.set(&serato_key(name), None)
    }

    fn get_text(&self, field: StandardField) -> Option<String> {
        self.get(comment_key(field))
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    }

    fn set_text(&mut self, field: StandardField, value: Option<&str>) {
        self.set(comment_key(field), value.map(str::to_string));
    }

    fn duration_ms(&self) -> Option<f64> {
        streaminfo_duration(&self.blocks.first()?.data)
    }

    fn write_to(&self, original: &[u8]) -> Result<Vec<u8>> {
        let audio = original
            .get(self.audio_offset..)
            .ok_or_else(|| Error::CorruptData("file shorter than its FLAC metadata".into()))?;

        let comment = Block {
            kind: BLOCK_VORBIS_COMMENT,
            data: self.comment_block(),
        };
        if comment.data.len() > MAX_BLOCK_LEN {
            return Err(Error::CorruptData("Vorbis comment block too large".into()));
        }

        let mut blocks: Vec<&Block> = Vec::with_capacity(self.blocks.len() + 1);
        let mut placed = false;
        for block in &self.blocks {
            if block.kind == BLOCK_VORBIS_COMMENT {
                if !placed {
                    blocks.push(&comment);
                    placed = true;
                }
            } else {
                blocks.push(block);
            }
        }
        if !placed {
            // Directly after STREAMINFO
            blocks.insert(1.min(blocks.len()), &comment);
        }

        let mut out = Vec::with_capacity(original.len() + 1024);
        out.extend_from_slice(&original[..self.prefix_len]);
        out.extend_from_slice(b"fLaC");
        let last = blocks.len() - 1;
        for (i, block) in blocks.iter().enumerate() {
            let flag = if i == last { LAST_BLOCK } else { 0 };
            let len = (block.data.len() as u32).to_be_bytes();
            out.push(flag | block.kind);
            out.extend_from_slice(&len[1..]);
            out.extend_from_slice(&block.data);
        }
        out.extend_from_slice(audio);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(kind: u8, last: bool, data: &[u8]) -> Vec<u8> {
        let mut out = vec![kind | if last { LAST_BLOCK } else { 0 }];
        out.extend_from_slice(&(data.len() as u32).to_be_bytes()[1..]);
        out.extend_from_slice(data);
        out
    }

    fn streaminfo() -> Vec<u8> {
        // 44100 Hz, 441000 samples (10 s)
        let mut data = vec![0u8; 34];
        data[10] = (44100u32 >> 12) as u8;
        data[11] = (44100u32 >> 4) as u8;
        data[12] = ((44100u32 & 0x0F) << 4) as u8;
        data[14..18].copy_from_slice(&441_000u32.to_be_bytes());
        data
    }

    fn sample_file(with_comments: bool) -> Vec<u8> {
        let mut file = b"fLaC".to_vec();
        file.extend(block(BLOCK_STREAMINFO, false, &streaminfo()));
        if with_comments {
            let mut comments = Vec::new();
            comments.extend_from_slice(&4u32.to_le_bytes());
            comments.extend_from_slice(b"test");
            comments.extend_from_slice(&2u32.to_le_bytes());
            for entry in ["title=Old", "REPLAYGAIN_TRACK_GAIN=-3.2 dB"] {
                comments.extend_from_slice(&(entry.len() as u32).to_le_bytes());
                comments.extend_from_slice(entry.as_bytes());
            }
            file.extend(block(BLOCK_VORBIS_COMMENT, false, &comments));
        }
        // PICTURE block we never touch
        file.extend(block(6, true, b"picture-bytes"));
        file.extend_from_slice(b"\xFF\xF8FRAMES");
        file
    }

    #[test]
    fn test_parse_and_duration() {
        let tag = FlacTag::parse(&sample_file(true)).unwrap();
        assert_eq!(tag.get_text(StandardField::Title).as_deref(), Some("Old"));
        assert_eq!(tag.duration_ms(), Some(10_000.0));
        assert_eq!(tag.vendor, b"test");
    }

    #[test]
    fn test_write_preserves_other_blocks_and_comments() {
        let file = sample_file(true);
        let mut tag = FlacTag::parse(&file).unwrap();
        tag.set_text(StandardField::Title, Some("New"));
        tag.set_frame("Serato Markers2", &[0x01, 0x01, 0x43]);

        let written = tag.write_to(&file).unwrap();
        assert!(written.ends_with(b"\xFF\xF8FRAMES"));

        let reread = FlacTag::parse(&written).unwrap();
        assert_eq!(reread.comment_keys(), vec!["TITLE", "REPLAYGAIN_TRACK_GAIN", "SERATO_MARKERS_V2"]);
        assert_eq!(reread.get_text(StandardField::Title).as_deref(), Some("New"));
        assert_eq!(reread.get_frame("Serato Markers2"), Some(vec![0x01, 0x01, 0x43]));
        assert_eq!(reread.blocks.len(), 3);
        assert_eq!(reread.blocks[2].data, b"picture-bytes");
    }

    #[test]
    fn test_inserts_missing_comment_block() {
        let file = sample_file(false);
        let mut tag = FlacTag::parse(&file).unwrap();
        tag.set_text(StandardField::Bpm, Some("126"));

        let written = tag.write_to(&file).unwrap();
        let reread = FlacTag::parse(&written).unwrap();
        let kinds: Vec<u8> = reread.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec![BLOCK_STREAMINFO, BLOCK_VORBIS_COMMENT, 6]);
        assert_eq!(reread.get_text(StandardField::Bpm).as_deref(), Some("126"));
    }

    #[test]
    fn test_rejects_non_flac() {
        assert!(matches!(FlacTag::parse(b"OggS...."), Err(Error::UnsupportedFormat(_))));
        let mut truncated = sample_file(true);
        truncated.truncate(20);
        assert!(matches!(FlacTag::parse(&truncated), Err(Error::CorruptData(_))));
    }

    #[test]
    fn test_malformed_comments_written_back_verbatim() {
        let mut comments = Vec::new();
        comments.extend_from_slice(&4u32.to_le_bytes());
        comments.extend_from_slice(b"v\xE9n\xFF");
        comments.extend_from_slice(&3u32.to_le_bytes());
        let entries: [&[u8]; 3] = [b"NOEQUALS", b"ARTIST=Caf\xE9", b"title=Old"];
        for entry in entries {
            comments.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            comments.extend_from_slice(entry);
        }
        let mut file = b"fLaC".to_vec();
        file.extend(block(BLOCK_STREAMINFO, false, &streaminfo()));
        file.extend(block(BLOCK_VORBIS_COMMENT, true, &comments));
        file.extend_from_slice(b"\xFF\xF8FRAMES");

        let mut tag = FlacTag::parse(&file).unwrap();
        assert_eq!(tag.comment_keys(), vec!["title"]);
        tag.set_text(StandardField::Title, Some("New"));
        let written = tag.write_to(&file).unwrap();

        let reread = FlacTag::parse(&written).unwrap();
        assert_eq!(reread.vendor, b"v\xE9n\xFF");
        assert_eq!(
            reread.comments[..2],
            [
                Comment::Raw(b"NOEQUALS".to_vec()),
                Comment::Raw(b"ARTIST=Caf\xE9".to_vec())
            ]
        );
        assert_eq!(reread.get_text(StandardField::Title).as_deref(), Some("New"));
    }
}
