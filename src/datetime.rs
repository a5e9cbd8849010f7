// Evaluation timestamp handling
// `$now()` and `$millis()` read one timestamp captured when an evaluation starts.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};

/// Capture the timestamp for a new evaluation.
pub fn capture() -> DateTime<Utc> {
    Utc::now()
}

/// Parse a `±HHMM` or `±HH:MM` timezone offset.
pub fn parse_timezone(timezone: &str) -> Option<FixedOffset> {
    let (sign, digits) = match timezone.as_bytes().first()? {
        b'+' => (1, &timezone[1..]),
        b'-' => (-1, &timezone[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}

/// ISO-8601 rendering with millisecond precision, in UTC unless a valid
/// offset is given.
pub fn format_timestamp(timestamp: DateTime<Utc>, timezone: Option<&str>) -> String {
    match timezone.and_then(parse_timezone) {
        Some(offset) if offset.local_minus_utc() != 0 => timestamp
            .with_timezone(&offset)
            .to_rfc3339_opts(SecondsFormat::Millis, false),
        _ => timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 5).unwrap()
    }

    #[test]
    fn test_format_utc() {
        assert_eq!(format_timestamp(fixed(), None), "2024-03-01T12:30:05.000Z");
    }

    #[test]
    fn test_format_with_offset() {
        assert_eq!(format_timestamp(fixed(), Some("-0500")), "2024-03-01T07:30:05.000-05:00");
        assert_eq!(format_timestamp(fixed(), Some("+01:30")), "2024-03-01T14:00:05.000+01:30");
        assert_eq!(format_timestamp(fixed(), Some("bogus")), "2024-03-01T12:30:05.000Z");
    }

    #[test]
    fn test_parse_timezone() {
        assert_eq!(parse_timezone("+0000").map(|o| o.local_minus_utc()), Some(0));
        assert_eq!(parse_timezone("-0130").map(|o| o.local_minus_utc()), Some(-5400));
        assert!(parse_timezone("0100").is_none());
        assert!(parse_timezone("+1").is_none());
    }
}
