use serde::{Deserialize, Serialize};

pub const DEFAULT_GARMENT: &str = "garment";
pub const DEFAULT_LOCATION: &str = "center front of the garment";

/// Where the logo goes, and on what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementHint {
    pub garment_type: String,
    pub placement_location: String,
}

impl Default for PlacementHint {
    fn default() -> Self {
        Self {
            garment_type: DEFAULT_GARMENT.to_string(),
            placement_location: DEFAULT_LOCATION.to_string(),
        }
    }
}

impl PlacementHint {
    /// Reads an answer shaped like `Garment: hoodie | Location: left chest`.
    /// Labels are matched case-insensitively; a missing or blank field keeps its default.
    pub fn parse(answer: &str) -> Self {
        let mut hint = Self::default();
        if let Some(garment) = labeled_value(answer, "garment:", &['|', '\n']) {
            hint.garment_type = garment.to_lowercase();
        }
        if let Some(location) = labeled_value(answer, "location:", &['\n']) {
            hint.placement_location = location;
        }
        hint
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

fn labeled_value(answer: &str, label: &str, terminators: &[char]) -> Option<String> {
    // ASCII lowercasing keeps byte offsets aligned with `answer`.
    let lowered = answer.to_ascii_lowercase();
    let start = lowered.find(label)? + label.len();
    let rest = &answer[start..];
    let end = rest.find(terminators).unwrap_or(rest.len());
    let value = rest[..end]
        .trim()
        .trim_matches(|ch| matches!(ch, '\'' | '"' | '*' | '.'))
        .trim();
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_both_labeled_fields() {
        let hint = PlacementHint::parse("Garment: Hoodie | Location: left chest");
        assert_eq!(
            hint,
            PlacementHint {
                garment_type: "hoodie".into(),
                placement_location: "left chest".into(),
            }
        );
    }

    #[test]
    fn labels_are_case_insensitive_and_multiline() {
        let hint = PlacementHint::parse("GARMENT: T-Shirt\nlocation: back center\nThanks!");
        assert_eq!(hint.garment_type, "t-shirt");
        assert_eq!(hint.placement_location, "back center");
    }

    #[test]
    fn unparsable_answer_yields_exact_default() {
        let hint = PlacementHint::parse("I cannot tell from this photo.");
        assert_eq!(
            hint,
            PlacementHint {
                garment_type: "garment".into(),
                placement_location: "center front of the garment".into(),
            }
        );
        assert!(hint.is_default());
    }

    #[test]
    fn missing_field_keeps_its_default() {
        let hint = PlacementHint::parse("Location: front chest");
        assert_eq!(hint.garment_type, DEFAULT_GARMENT);
        assert_eq!(hint.placement_location, "front chest");
    }

    #[test]
    fn blank_value_keeps_default() {
        let hint = PlacementHint::parse("Garment: | Location:");
        assert!(hint.is_default());
    }

    #[test]
    fn quoted_answer_is_unwrapped() {
        let hint = PlacementHint::parse("'Garment: sweatshirt | Location: front chest'");
        assert_eq!(hint.garment_type, "sweatshirt");
        assert_eq!(hint.placement_location, "front chest");
    }
}
