//! Validation and repair of decoded Serato cues
//!
//! Every repair is recorded with the value it replaced and logged.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::cue::{CueColor, CuePoint, MAX_LABEL_LEN, MIN_CUE_ID};
use crate::serato::markers2::SeratoCue;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ValidationIssue {
    SlotOutOfRange { id: u8, max: u8 },
    NegativePosition { position_ms: f64 },
    PositionBeyondEnd { position_ms: f64, duration_ms: f64 },
    NonFinitePosition,
    UnknownColor { rgb: u32 },
    EmptyLabel,
    LabelTooLong { chars: usize },
    ControlCharacters,
}

/// One field changed by `repair`, kept for undo
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub cue_id: u8,
    pub field: String,
    pub original: String,
    pub repaired: String,
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub cue: CuePoint,
    pub records: Vec<RepairRecord>,
}

/// List everything wrong with a decoded cue
pub fn validate(cue: &SeratoCue, duration_ms: Option<f64>, config: &Config) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if cue.id < MIN_CUE_ID || cue.id > config.max_cues {
        issues.push(ValidationIssue::SlotOutOfRange {
            id: cue.id,
            max: config.max_cues,
        });
    }

    if !cue.position_ms.is_finite() {
        issues.push(ValidationIssue::NonFinitePosition);
    } else if cue.position_ms < 0.0 {
        issues.push(ValidationIssue::NegativePosition {
            position_ms: cue.position_ms,
        });
    } else if let Some(duration) = duration_ms {
        if cue.position_ms > duration {
            issues.push(ValidationIssue::PositionBeyondEnd {
                position_ms: cue.position_ms,
                duration_ms: duration,
            });
        }
    }

    if CueColor::from_serato_rgb(cue.rgb).is_none() {
        issues.push(ValidationIssue::UnknownColor { rgb: cue.rgb });
    }

    if cue.label.chars().any(char::is_control) {
        issues.push(ValidationIssue::ControlCharacters);
    }
    let chars = cue.label.chars().count();
    if chars == 0 && config.validation_strict {
        issues.push(ValidationIssue::EmptyLabel);
    }
    if chars > MAX_LABEL_LEN {
        issues.push(ValidationIssue::LabelTooLong { chars });
    }

    issues
}

/// Fix the listed issues, producing a cue that converts cleanly
pub fn repair(
    cue: &SeratoCue,
    issues: &[ValidationIssue],
    duration_ms: Option<f64>,
    config: &Config,
) -> RepairOutcome {
    let mut records = Vec::new();
    let mut id = cue.id;
    let mut position = cue.position_ms;
    let mut rgb = cue.rgb;
    let mut label = cue.label.clone();

    let mut record = |field: &'static str, original: String, repaired: String| {
        warn!(
            "Repaired cue {} {}: {:?} -> {:?}",
            cue.id, field, original, repaired
        );
        records.push(RepairRecord {
            cue_id: cue.id,
            field: field.to_string(),
            original,
            repaired,
        });
    };

    for issue in issues {
        match issue {
            ValidationIssue::SlotOutOfRange { .. } => {
                let fixed = id.clamp(MIN_CUE_ID, config.max_cues);
                record("id", id.to_string(), fixed.to_string());
                id = fixed;
            }
            ValidationIssue::NonFinitePosition | ValidationIssue::NegativePosition { .. } => {
                record("position_ms", position.to_string(), "0".into());
                position = 0.0;
            }
            ValidationIssue::PositionBeyondEnd { duration_ms, .. } => {
                record("position_ms", position.to_string(), duration_ms.to_string());
                position = *duration_ms;
            }
            ValidationIssue::UnknownColor { .. } => {
                let fixed = CueColor::nearest_serato(rgb).serato_rgb();
                record("color", format!("#{:06X}", rgb), format!("#{:06X}", fixed));
                rgb = fixed;
            }
            ValidationIssue::ControlCharacters => {
                let fixed: String = label.chars().filter(|c| !c.is_control()).collect();
                record("label", label.clone(), fixed.clone());
                label = fixed;
            }
            ValidationIssue::LabelTooLong { .. } => {
                let fixed: String = label.chars().take(MAX_LABEL_LEN).collect();
                record("label", label.clone(), fixed.clone());
                label = fixed;
            }
            ValidationIssue::EmptyLabel => {}
        }
    }

    // Stripping characters can leave an empty label behind
    if label.is_empty() && config.validation_strict {
        let fixed = format!("Cue {}", id);
        record("label", label.clone(), fixed.clone());
        label = fixed;
    }

    if let Some(duration) = duration_ms {
        position = position.clamp(0.0, duration.max(0.0));
    }

    let color = CueColor::from_serato_rgb(rgb).unwrap_or_else(|| CueColor::nearest_serato(rgb));

    RepairOutcome {
        cue: CuePoint {
            id,
            position_ms: position,
            label,
            color,
            cue_type: cue.cue_type,
            serato_id: cue.serato_id,
        },
        records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cue::CueType;

    fn raw_cue() -> SeratoCue {
        SeratoCue {
            id: 2,
            position_ms: 1000.0,
            label: "Verse".into(),
            rgb: CueColor::Blue.serato_rgb(),
            cue_type: CueType::HotCue,
            serato_id: Some(2),
        }
    }

    #[test]
    fn test_clean_cue_has_no_issues() {
        let issues = validate(&raw_cue(), Some(5000.0), &Config::default());
        assert!(issues.is_empty());
    }

    #[test]
    fn test_detects_every_issue() {
        let cue = SeratoCue {
            id: 20,
            position_ms: 9000.0,
            label: format!("{}\u{7}", "x".repeat(60)),
            rgb: 0x010203,
            ..raw_cue()
        };
        let issues = validate(&cue, Some(5000.0), &Config::default());
        assert!(issues.contains(&ValidationIssue::SlotOutOfRange { id: 20, max: 16 }));
        assert!(issues.contains(&ValidationIssue::PositionBeyondEnd {
            position_ms: 9000.0,
            duration_ms: 5000.0
        }));
        assert!(issues.contains(&ValidationIssue::UnknownColor { rgb: 0x010203 }));
        assert!(issues.contains(&ValidationIssue::ControlCharacters));
        assert!(issues.contains(&ValidationIssue::LabelTooLong { chars: 61 }));
    }

    #[test]
    fn test_repair_records_originals() {
        let cue = SeratoCue {
            id: 20,
            position_ms: 9000.0,
            rgb: 0xC10000,
            ..raw_cue()
        };
        let config = Config::default();
        let issues = validate(&cue, Some(5000.0), &config);
        let outcome = repair(&cue, &issues, Some(5000.0), &config);

        assert_eq!(outcome.cue.id, 16);
        assert_eq!(outcome.cue.position_ms, 5000.0);
        assert_eq!(outcome.cue.color, CueColor::Red);
        assert_eq!(outcome.records.len(), 3);

        let color = outcome.records.iter().find(|r| r.field == "color").unwrap();
        assert_eq!(color.original, "#C10000");
        assert_eq!(color.repaired, "#CC0000");
    }

    #[test]
    fn test_empty_label_synthesized_when_strict() {
        let cue = SeratoCue {
            label: String::new(),
            ..raw_cue()
        };
        let config = Config::default();
        let issues = validate(&cue, None, &config);
        assert_eq!(issues, vec![ValidationIssue::EmptyLabel]);

        let outcome = repair(&cue, &issues, None, &config);
        assert_eq!(outcome.cue.label, "Cue 2");

        let relaxed = Config {
            validation_strict: false,
            ..Config::default()
        };
        assert!(validate(&cue, None, &relaxed).is_empty());
    }

    #[test]
    fn test_label_truncation_and_stripping() {
        let cue = SeratoCue {
            label: format!("A\tB{}", "c".repeat(55)),
            ..raw_cue()
        };
        let config = Config::default();
        let issues = validate(&cue, None, &config);
        let outcome = repair(&cue, &issues, None, &config);
        assert_eq!(outcome.cue.label.chars().count(), MAX_LABEL_LEN);
        assert!(outcome.cue.label.starts_with("ABc"));
    }
}
