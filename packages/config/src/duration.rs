// ABOUTME: Human-readable duration parsing for interval and timeout settings
// ABOUTME: Accepts values like "500ms", "10s", "15m", "12h" and "7d"

use std::time::Duration;

/// Parse a duration with a unit suffix. A bare number is read as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let split_at = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (digits, unit) = value.split_at(split_at);

    let amount: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", value))?;

    let duration = match unit.trim() {
        "ms" => Some(Duration::from_millis(amount)),
        "" | "s" => Some(Duration::from_secs(amount)),
        "m" => amount.checked_mul(60).map(Duration::from_secs),
        "h" => amount.checked_mul(60 * 60).map(Duration::from_secs),
        "d" => amount.checked_mul(60 * 60 * 24).map(Duration::from_secs),
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, value)),
    };

    duration.ok_or_else(|| format!("duration '{}' is too large", value))
}
