//! Cue point model and the fixed color palette

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lowest hot-cue slot id
pub const MIN_CUE_ID: u8 = 1;
/// Highest hot-cue slot id the format can carry
pub const MAX_CUE_ID: u8 = 16;
/// Longest label, in characters, strict validation accepts
pub const MAX_LABEL_LEN: usize = 50;

/// Cue point type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CueType {
    #[default]
    HotCue = 0,
    LoopIn = 1,
    LoopOut = 2,
    FadeIn = 3,
    FadeOut = 4,
    Intro = 5,
    Outro = 6,
}

impl CueType {
    pub const ALL: [CueType; 7] = [
        CueType::HotCue,
        CueType::LoopIn,
        CueType::LoopOut,
        CueType::FadeIn,
        CueType::FadeOut,
        CueType::Intro,
        CueType::Outro,
    ];

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// The 16-entry cue palette
///
/// Each entry has a display color and exactly one Serato color. Both
/// directions are exact lookups; `nearest` is only used by repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CueColor {
    Red,
    Blue,
    Orange,
    Purple,
    Green,
    OrangeRed,
    BluePurple,
    LightGreen,
    Pink,
    CyanGreen,
    PurpleBlue,
    LightOrange,
    LightBlue,
    LightPurple,
    LightPink,
    LightCyan,
}

impl CueColor {
    /// Slot order: default color of slot N is `ALL[N - 1]`
    pub const ALL: [CueColor; 16] = [
        CueColor::Red,
        CueColor::Blue,
        CueColor::Orange,
        CueColor::Purple,
        CueColor::Green,
        CueColor::OrangeRed,
        CueColor::BluePurple,
        CueColor::LightGreen,
        CueColor::Pink,
        CueColor::CyanGreen,
        CueColor::PurpleBlue,
        CueColor::LightOrange,
        CueColor::LightBlue,
        CueColor::LightPurple,
        CueColor::LightPink,
        CueColor::LightCyan,
    ];

    /// Display RGB (0xRRGGBB)
    pub const fn rgb(self) -> u32 {
        match self {
            CueColor::Red => 0xFF3366,
            CueColor::Blue => 0x33AAFF,
            CueColor::Orange => 0xFFAA33,
            CueColor::Purple => 0xAA33FF,
            CueColor::Green => 0x33FF66,
            CueColor::OrangeRed => 0xFF6633,
            CueColor::BluePurple => 0x3366FF,
            CueColor::LightGreen => 0x66FF33,
            CueColor::Pink => 0xFF3399,
            CueColor::CyanGreen => 0x33FFAA,
            CueColor::PurpleBlue => 0x9933FF,
            CueColor::LightOrange => 0xFFAA66,
            CueColor::LightBlue => 0x66AAFF,
            CueColor::LightPurple => 0xAA66FF,
            CueColor::LightPink => 0xFF6699,
            CueColor::LightCyan => 0x66FFAA,
        }
    }

    /// Serato's native RGB for this entry
    pub const fn serato_rgb(self) -> u32 {
        match self {
            CueColor::Red => 0xCC0000,
            CueColor::Blue => 0x0088CC,
            CueColor::Orange => 0xCC8800,
            CueColor::Purple => 0x8800CC,
            CueColor::Green => 0x00CC00,
            CueColor::OrangeRed => 0xCC4400,
            CueColor::BluePurple => 0x0044CC,
            CueColor::LightGreen => 0x88CC00,
            CueColor::Pink => 0xCC0088,
            CueColor::CyanGreen => 0x00CC88,
            CueColor::PurpleBlue => 0x4400CC,
            CueColor::LightOrange => 0x884400,
            CueColor::LightBlue => 0x888888,
            CueColor::LightPurple => 0x000000,
            CueColor::LightPink => 0xCC0044,
            CueColor::LightCyan => 0x00CC44,
        }
    }

    pub fn from_rgb(rgb: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.rgb() == rgb)
    }

    pub fn from_serato_rgb(rgb: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.serato_rgb() == rgb)
    }

    /// Parse `#RRGGBB` (case-insensitive) into a palette entry
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.strip_prefix('#')?;
        if digits.len() != 6 {
            return None;
        }
        let rgb = u32::from_str_radix(digits, 16).ok()?;
        Self::from_rgb(rgb)
    }

    pub fn to_hex(self) -> String {
        format!("#{:06X}", self.rgb())
    }

    /// Default color for a hot-cue slot (1-16)
    pub fn default_for_slot(id: u8) -> Self {
        let index = (id.max(1) as usize - 1) % Self::ALL.len();
        Self::ALL[index]
    }

    /// Closest Serato palette entry by squared RGB distance, lowest index on ties
    pub fn nearest_serato(rgb: u32) -> Self {
        let mut best = Self::ALL[0];
        let mut best_distance = u32::MAX;
        for color in Self::ALL {
            let distance = rgb_distance(rgb, color.serato_rgb());
            if distance < best_distance {
                best = color;
                best_distance = distance;
            }
        }
        best
    }
}

fn rgb_distance(a: u32, b: u32) -> u32 {
    let channel = |v: u32, shift: u32| ((v >> shift) & 0xFF) as i32;
    [16, 8, 0]
        .iter()
        .map(|&shift| {
            let d = channel(a, shift) - channel(b, shift);
            (d * d) as u32
        })
        .sum()
}

impl fmt::Display for CueColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<CueColor> for String {
    fn from(color: CueColor) -> Self {
        color.to_hex()
    }
}

impl TryFrom<String> for CueColor {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        CueColor::from_hex(&value).ok_or_else(|| format!("{} is not a palette color", value))
    }
}

/// A hot cue, loop or section marker on a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CuePoint {
    /// Slot id (1-16), unique within a track
    pub id: u8,
    /// Milliseconds from track start
    pub position_ms: f64,
    #[serde(default)]
    pub label: String,
    pub color: CueColor,
    #[serde(rename = "type", default)]
    pub cue_type: CueType,
    /// Slot Serato assigned when the cue was imported from its tags
    #[serde(default)]
    pub serato_id: Option<u8>,
}

impl CuePoint {
    pub fn new(id: u8, position_ms: f64) -> Self {
        Self {
            id,
            position_ms,
            label: String::new(),
            color: CueColor::default_for_slot(id),
            cue_type: CueType::HotCue,
            serato_id: None,
        }
    }

    pub fn position_secs(&self) -> f64 {
        self.position_ms / 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_palette_is_bijective() {
        let display: HashSet<u32> = CueColor::ALL.iter().map(|c| c.rgb()).collect();
        let serato: HashSet<u32> = CueColor::ALL.iter().map(|c| c.serato_rgb()).collect();
        assert_eq!(display.len(), 16);
        assert_eq!(serato.len(), 16);

        for color in CueColor::ALL {
            assert_eq!(CueColor::from_serato_rgb(color.serato_rgb()), Some(color));
            assert_eq!(CueColor::from_rgb(color.rgb()), Some(color));
        }
    }

    #[test]
    fn test_hex_parsing_is_exact() {
        assert_eq!(CueColor::from_hex("#FF3366"), Some(CueColor::Red));
        assert_eq!(CueColor::from_hex("#ff3366"), Some(CueColor::Red));
        // One step off the palette is not a palette color
        assert_eq!(CueColor::from_hex("#FF3367"), None);
        assert_eq!(CueColor::from_hex("FF3366"), None);
        assert_eq!(CueColor::Red.to_hex(), "#FF3366");
    }

    #[test]
    fn test_unknown_serato_color_has_no_exact_match() {
        assert_eq!(CueColor::from_serato_rgb(0xC10000), None);
        assert_eq!(CueColor::nearest_serato(0xC10000), CueColor::Red);
    }

    #[test]
    fn test_default_slot_colors() {
        assert_eq!(CueColor::default_for_slot(1), CueColor::Red);
        assert_eq!(CueColor::default_for_slot(16), CueColor::LightCyan);
    }

    #[test]
    fn test_cue_json_shape() {
        let cue = CuePoint {
            label: "Intro".into(),
            ..CuePoint::new(1, 5000.0)
        };
        let json = serde_json::to_value(&cue).unwrap();
        assert_eq!(json["color"], "#FF3366");
        assert_eq!(json["type"], "hot_cue");
        assert_eq!(json["serato_id"], serde_json::Value::Null);

        let back: CuePoint = serde_json::from_value(json).unwrap();
        assert_eq!(back, cue);
    }

    #[test]
    fn test_cue_type_codes() {
        for cue_type in CueType::ALL {
            assert_eq!(CueType::from_code(cue_type.code()), Some(cue_type));
        }
        assert_eq!(CueType::from_code(7), None);
    }
}
