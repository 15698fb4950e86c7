//! # Duration Parsing
//!
//! Parses the duration strings accepted by `--timeout`.

use anyhow::Result;
use regex::Regex;
use std::time::Duration;

/// Parse a duration string into `std::time::Duration`.
///
/// Supports `<number><unit>` with unit `s`, `m`, `h` or `d` (`"30s"`, `"10m"`,
/// `"1h"`), and a bare number of seconds (`"600"`).
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let trimmed = duration_str.trim();

    if trimmed.is_empty() {
        return Err(anyhow::anyhow!("Duration string cannot be empty"));
    }

    let duration_regex = Regex::new(r"^(?P<number>\d+)(?P<unit>[smhd]?)$")
        .map_err(|e| anyhow::anyhow!("Failed to compile regex: {e}"))?;

    let lower = trimmed.to_lowercase();
    let captures = duration_regex.captures(&lower).ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid duration format '{}'. Expected format: <number><unit> (e.g., '30s', '10m', '1h')",
            trimmed
        )
    })?;

    let number: u64 = captures["number"].parse().map_err(|e| {
        anyhow::anyhow!("Invalid duration number in '{}': {}", trimmed, e)
    })?;

    if number == 0 {
        return Err(anyhow::anyhow!(
            "Duration must be greater than 0, got '{}'",
            trimmed
        ));
    }

    let seconds = match &captures["unit"] {
        "" | "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        unit => {
            return Err(anyhow::anyhow!(
                "Invalid unit '{}' in duration '{}'. Expected: s, m, h, or d",
                unit,
                trimmed
            ));
        }
    };

    Ok(Duration::from_secs(seconds))
}
