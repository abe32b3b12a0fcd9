//! ID3v2 text encoding
//!
//! ID3v2 text carries a leading encoding byte:
//! - 0x00: ISO-8859-1, single NUL terminator
//! - 0x01: UTF-16 with BOM, double NUL terminator
//! - 0x02: UTF-16BE without BOM (v2.4 only), double NUL terminator
//! - 0x03: UTF-8 (v2.4 only), single NUL terminator

pub const ENCODING_LATIN1: u8 = 0x00;
pub const ENCODING_UTF16: u8 = 0x01;
pub const ENCODING_UTF16BE: u8 = 0x02;
pub const ENCODING_UTF8: u8 = 0x03;

/// Pick the encoding a tag version should use for `s`
///
/// v2.4 always writes UTF-8. v2.3 writes Latin-1 when every character fits,
/// UTF-16 otherwise.
pub fn choose_encoding(s: &str, major_version: u8) -> u8 {
    if major_version >= 4 {
        ENCODING_UTF8
    } else if s.chars().all(|c| (c as u32) < 0x100) {
        ENCODING_LATIN1
    } else {
        ENCODING_UTF16
    }
}

/// Encode `s` without terminator
pub fn encode_text(s: &str, encoding: u8) -> Vec<u8> {
    match encoding {
        ENCODING_LATIN1 => s
            .chars()
            .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
            .collect(),
        ENCODING_UTF16 => {
            let mut result = vec![0xFF, 0xFE];
            for unit in s.encode_utf16() {
                result.extend_from_slice(&unit.to_le_bytes());
            }
            result
        }
        ENCODING_UTF16BE => s.encode_utf16().flat_map(|u| u.to_be_bytes()).collect(),
        _ => s.as_bytes().to_vec(),
    }
}

/// Terminator for an encoding
pub fn terminator(encoding: u8) -> &'static [u8] {
    match encoding {
        ENCODING_UTF16 | ENCODING_UTF16BE => &[0x00, 0x00],
        _ => &[0x00],
    }
}

/// Decode a whole buffer, dropping trailing terminators
pub fn decode_text(bytes: &[u8], encoding: u8) -> String {
    let text = match encoding {
        ENCODING_LATIN1 => bytes.iter().map(|&b| b as char).collect::<String>(),
        ENCODING_UTF16 => {
            let (little_endian, body) = match bytes {
                [0xFF, 0xFE, rest @ ..] => (true, rest),
                [0xFE, 0xFF, rest @ ..] => (false, rest),
                _ => (true, bytes),
            };
            decode_utf16(body, little_endian)
        }
        ENCODING_UTF16BE => decode_utf16(bytes, false),
        _ => String::from_utf8_lossy(bytes).into_owned(),
    };
    text.trim_end_matches('\0').to_string()
}

fn decode_utf16(bytes: &[u8], little_endian: bool) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16_lossy(&units)
}

/// Split a terminated string off the front of `bytes`
///
/// Returns the decoded string and the bytes after its terminator. A missing
/// terminator consumes the whole buffer.
pub fn split_terminated(bytes: &[u8], encoding: u8) -> (String, &[u8]) {
    let end = match encoding {
        ENCODING_UTF16 | ENCODING_UTF16BE => bytes
            .chunks_exact(2)
            .position(|pair| pair == [0x00, 0x00])
            .map(|i| (i * 2, i * 2 + 2)),
        _ => bytes.iter().position(|&b| b == 0x00).map(|i| (i, i + 1)),
    };
    match end {
        Some((text_end, rest_start)) => (decode_text(&bytes[..text_end], encoding), &bytes[rest_start..]),
        None => (decode_text(bytes, encoding), &[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choose_encoding() {
        assert_eq!(choose_encoding("Café", 3), ENCODING_LATIN1);
        assert_eq!(choose_encoding("日本語", 3), ENCODING_UTF16);
        assert_eq!(choose_encoding("Café", 4), ENCODING_UTF8);
    }

    #[test]
    fn test_utf16_with_bom() {
        let encoded = encode_text("日本語", ENCODING_UTF16);
        assert_eq!(&encoded[..2], &[0xFF, 0xFE]);
        // BOM + 3 characters * 2 bytes
        assert_eq!(encoded.len(), 8);
        assert_eq!(decode_text(&encoded, ENCODING_UTF16), "日本語");
    }

    #[test]
    fn test_latin1() {
        let encoded = encode_text("Café", ENCODING_LATIN1);
        assert_eq!(encoded, vec![b'C', b'a', b'f', 0xE9]);
        assert_eq!(decode_text(&encoded, ENCODING_LATIN1), "Café");
    }

    #[test]
    fn test_split_terminated() {
        let mut bytes = encode_text("desc", ENCODING_UTF16);
        bytes.extend_from_slice(terminator(ENCODING_UTF16));
        bytes.extend_from_slice(b"rest");

        let (text, rest) = split_terminated(&bytes, ENCODING_UTF16);
        assert_eq!(text, "desc");
        assert_eq!(rest, b"rest");

        let (text, rest) = split_terminated(b"plain", ENCODING_LATIN1);
        assert_eq!(text, "plain");
        assert!(rest.is_empty());
    }

    #[test]
    fn test_trailing_nuls_dropped() {
        assert_eq!(decode_text(b"128\0", ENCODING_UTF8), "128");
    }
}
