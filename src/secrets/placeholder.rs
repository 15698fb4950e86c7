//! Detection of template values left in `.env` files.

use regex::Regex;
use std::sync::LazyLock;

/// Sentinels shipped in `.env.example`-style templates
static PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(your[-_].*|<.*>|changeme|change[-_]me|x{3,}.*|.*placeholder.*|sk-\.\.\..*|todo|tbd|replace[-_]me)$",
    )
    .ok()
});

/// Whether `value` is empty or a known template placeholder (case-insensitive)
pub fn is_placeholder(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return true;
    }
    PLACEHOLDER
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(trimmed))
}
