use serde::Serialize;
use std::fmt;

pub const MAX_STYLE_CHARS: usize = 400;

pub const DEFAULT_STUDIO_STYLE: &str = "Professional studio lighting with soft, even illumination and clean white background for crisp, wrinkle-free presentation";

pub const FALLBACK_STYLE: &str = "Professional e-commerce photography style";

/// Photography-style guidance, bounded to [`MAX_STYLE_CHARS`] characters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StyleDescription(String);

impl StyleDescription {
    /// Bounds `text`; blank input falls back to a generic studio style.
    pub fn bounded(text: &str) -> Self {
        let truncated = truncate_text(text.trim(), MAX_STYLE_CHARS);
        if truncated.trim().is_empty() {
            Self(FALLBACK_STYLE.to_string())
        } else {
            Self(truncated)
        }
    }

    pub fn studio_default() -> Self {
        Self(DEFAULT_STUDIO_STYLE.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StyleDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cuts `text` to at most `max_chars` characters, preferring the last sentence
/// end past 70% of the budget, then the last word boundary followed by `...`.
/// The marker counts against the budget.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    const MARKER: &str = "...";
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: Vec<char> = text.chars().take(max_chars).collect();

    if let Some(period) = head.iter().rposition(|ch| *ch == '.')
        && period as f64 > max_chars as f64 * 0.7
    {
        return head[..=period].iter().collect();
    }

    let room = &head[..max_chars.saturating_sub(MARKER.len())];
    let cut = match room.iter().rposition(|ch| *ch == ' ') {
        Some(space) if space > 0 => space,
        _ => room.len(),
    };
    let mut out: String = room[..cut].iter().collect();
    out.push_str(MARKER);
    out
}
