//! Renamer: human-readable display labels for published endpoints
//!
//! Labels are attached as a percent-encoded URI fragment; connection
//! parameters are never touched.

use crate::curator::models::EndpointRecord;
use once_cell::sync::Lazy;
use regex::Regex;

/// Marker appended to endpoints flagged as likely spam-blocked
const LOW_PRIORITY_MARKER: &str = "LOW-PRIO";

static COUNTRY_CODE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b([A-Za-z]{2})\b").expect("invalid country code regex"));

/// Build the display label for a record:
/// `{flag} {location} | {last successful check} [| LOW-PRIO]`
pub fn display_label(record: &EndpointRecord) -> String {
    let location = record.location.as_deref().unwrap_or("??");
    let flag = flag_emoji(record.location.as_deref());
    let checked = record
        .last_success_at()
        .map(|t| t.format("%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());

    let mut label = format!("{} {} | {}", flag, location, checked);
    if record.is_spam_blocked() {
        label.push_str(" | ");
        label.push_str(LOW_PRIORITY_MARKER);
    }
    label
}

/// Return the record's URI with the display label as its fragment. Any
/// pre-existing fragment was already stripped at harvest time.
pub fn renamed_uri(record: &EndpointRecord) -> String {
    format!(
        "{}#{}",
        record.uri,
        urlencoding::encode(&display_label(record))
    )
}

/// Convert a location name into a flag emoji via regional indicator symbols.
/// Falls back to the globe when no two-letter code can be found.
pub fn flag_emoji(location: Option<&str>) -> String {
    let Some(location) = location else {
        return "🌍".to_string();
    };

    let code = if location.len() == 2 && location.chars().all(|c| c.is_ascii_alphabetic()) {
        location.to_ascii_uppercase()
    } else if let Some(caps) = COUNTRY_CODE_REGEX.captures(location) {
        caps[1].to_ascii_uppercase()
    } else {
        return "🌍".to_string();
    };

    // Telegram groups habitually write UK for Great Britain
    let code = if code == "UK" { "GB".to_string() } else { code };

    let base = 0x1F1E6u32;
    code.chars()
        .map(|c| {
            char::from_u32(base + (c as u32 - 'A' as u32)).expect("regional indicator in range")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn record(location: Option<&str>, http_code: Option<i64>) -> EndpointRecord {
        EndpointRecord {
            uri: "vless://uuid@host:443?type=ws".to_string(),
            protocol: "vless".to_string(),
            location: location.map(String::from),
            delay_ms: Some(40),
            last_checked_at: Some(Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap()),
            latency_passed: true,
            download_mbps: Some(25.0),
            last_speed_checked_at: None,
            speed_passed: true,
            http_code,
            retry_count: 0,
            first_seen_at: Utc::now(),
            source_ref: None,
        }
    }

    #[test]
    fn test_flag_emoji_from_code() {
        assert_eq!(flag_emoji(Some("US")), "🇺🇸");
        assert_eq!(flag_emoji(Some("de")), "🇩🇪");
    }

    #[test]
    fn test_flag_emoji_uk_alias() {
        assert_eq!(flag_emoji(Some("UK")), "🇬🇧");
    }

    #[test]
    fn test_flag_emoji_embedded_code() {
        assert_eq!(flag_emoji(Some("Frankfurt DE node")), "🇩🇪");
    }

    #[test]
    fn test_flag_emoji_fallback() {
        assert_eq!(flag_emoji(None), "🌍");
        assert_eq!(flag_emoji(Some("Somewhere")), "🌍");
    }

    #[test]
    fn test_label_includes_timestamp() {
        let label = display_label(&record(Some("US"), Some(200)));
        assert!(label.contains("US"));
        assert!(label.contains("03-14 09:30"));
        assert!(!label.contains(LOW_PRIORITY_MARKER));
    }

    #[test]
    fn test_label_marks_spam_blocked() {
        let label = display_label(&record(Some("US"), Some(403)));
        assert!(label.ends_with(LOW_PRIORITY_MARKER));
    }

    #[test]
    fn test_renamed_uri_keeps_connection_params() {
        let renamed = renamed_uri(&record(Some("US"), Some(200)));
        assert!(renamed.starts_with("vless://uuid@host:443?type=ws#"));
        // Fragment must be URL-safe
        let fragment = renamed.split('#').nth(1).unwrap();
        assert!(!fragment.contains(' '));
        assert!(!fragment.contains('|'));
    }
}
