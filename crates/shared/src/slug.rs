use serde::{Deserialize, Serialize};

/// Longest name the chat gateway accepts for a channel; spreadsheet titles
/// allow more, so this is the binding limit.
const MAX_SLUG_LEN: usize = 80;

/// Fallback for display names that contain no usable characters at all.
const EMPTY_NAME_SLUG: &str = "puzzle";

/// Canonical puzzle identifier, derived deterministically from the display
/// name. The slug is the join key between a puzzle's chat channel and its
/// spreadsheet, so it must be legal on both sides: lowercase ASCII
/// alphanumerics separated by single dashes, at most [`MAX_SLUG_LEN`] bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Slug(String);

impl Slug {
    /// Derives the slug for a display name. Pure, deterministic and
    /// idempotent: slugifying an existing slug returns it unchanged.
    pub fn new(display_name: &str) -> Self {
        let mut out = String::with_capacity(display_name.len());
        let mut pending_separator = false;
        for ch in display_name.chars() {
            if ch.is_ascii_alphanumeric() {
                if pending_separator && !out.is_empty() {
                    out.push('-');
                }
                pending_separator = false;
                out.push(ch.to_ascii_lowercase());
            } else {
                pending_separator = true;
            }
            if out.len() >= MAX_SLUG_LEN {
                break;
            }
        }
        out.truncate(MAX_SLUG_LEN);
        while out.ends_with('-') {
            out.pop();
        }
        if out.is_empty() {
            out.push_str(EMPTY_NAME_SLUG);
        }
        Slug(out)
    }

    /// Appends a numeric disambiguator, trimming the base so the result
    /// stays within the length limit. Used when a display name collides
    /// with an archived puzzle's slug.
    pub fn with_disambiguator(&self, n: u32) -> Self {
        let suffix = format!("-{n}");
        let mut base = self.0.clone();
        if base.len() + suffix.len() > MAX_SLUG_LEN {
            base.truncate(MAX_SLUG_LEN - suffix.len());
            while base.ends_with('-') {
                base.pop();
            }
        }
        Slug(format!("{base}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Slug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
#[path = "tests/slug_tests.rs"]
mod tests;
