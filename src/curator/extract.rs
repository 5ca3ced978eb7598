//! Link extractor: raw message text to normalized candidate URIs
//!
//! Pure functions, no state. Extraction finds URIs for the five supported
//! schemes, normalization makes re-harvested duplicates of the same endpoint
//! collapse onto one key:
//! - the display fragment (`#...`) is volatile and stripped
//! - query parameters are sorted into a stable order
//! - trailing message punctuation is trimmed

use crate::curator::models::Protocol;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

/// Matches candidate URIs for the supported schemes in free-form text
static LINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(?:vless|vmess|ss|ssr|trojan)://[^\s<>"'`]+"#).expect("invalid link regex")
});

/// Extract all candidate endpoint URIs from a message text.
///
/// Returns normalized URIs with in-text duplicates collapsed, in a stable
/// order.
pub fn extract_links(text: &str) -> Vec<String> {
    let mut links = BTreeSet::new();
    for m in LINK_REGEX.find_iter(text) {
        if let Some(normalized) = normalize_link(m.as_str()) {
            links.insert(normalized);
        }
    }
    links.into_iter().collect()
}

/// Normalize a single raw candidate. Returns `None` for candidates that do
/// not survive validation (unknown scheme, undecodable vmess payload).
pub fn normalize_link(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches(['.', ',', ';', ')', ']', '!']);
    let protocol = Protocol::from_uri(trimmed)?;

    // Display name is whatever the publisher put there; never part of identity
    let without_fragment = match trimmed.split_once('#') {
        Some((base, _)) => base,
        None => trimmed,
    };

    if protocol == Protocol::Vmess {
        // vmess carries its parameters in a base64 JSON payload; keep the
        // link only if the payload actually decodes
        let payload = without_fragment.strip_prefix("vmess://")?;
        decode_vmess_payload(payload)?;
        return Some(without_fragment.to_string());
    }

    Some(sort_query_params(without_fragment))
}

/// Rewrite `...?b=2&a=1` as `...?a=1&b=2` so that equivalent links hash the
/// same. Links without a query string pass through untouched.
fn sort_query_params(uri: &str) -> String {
    match uri.split_once('?') {
        Some((base, query)) if !query.is_empty() => {
            let mut params: Vec<&str> = query.split('&').collect();
            params.sort_unstable();
            format!("{}?{}", base, params.join("&"))
        }
        _ => uri.to_string(),
    }
}

/// Decode a vmess base64 payload into its JSON object.
///
/// Handles missing padding and both the standard and URL-safe alphabets.
pub fn decode_vmess_payload(payload: &str) -> Option<Value> {
    let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    let padded = format!("{}{}", compact, "=".repeat((4 - compact.len() % 4) % 4));

    let engines = [
        base64::engine::general_purpose::STANDARD,
        base64::engine::general_purpose::URL_SAFE,
    ];
    for engine in engines {
        if let Ok(bytes) = engine.decode(&padded) {
            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                if value.is_object() {
                    return Some(value);
                }
            }
        }
    }
    None
}
