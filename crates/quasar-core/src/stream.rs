//! Stream Descriptors and Tag Canonicalisation
//!
//! A stream is identified by a UUID and described by a collection name
//! plus a set of key/value tags. The collection map persists the tag set
//! as a single canonical string so that the same tags always produce the
//! same key regardless of insertion order.
//!
//! ## Canonical Tag String
//!
//! Tags sorted by key, each pair rendered as `key@value@` and joined:
//!
//! ```text
//! {"loc": "x1", "chan": "A"}  ->  "chan@A@loc@x1@"
//! ```
//!
//! The trailing `@` means splitting on `@` yields one empty trailing
//! element, which parsing drops.
//!
//! ## Validation Rules
//!
//! - Collection names and tag keys: `^[a-z][a-z0-9_.]{0,254}$`
//! - Tag values: `^[a-zA-Z0-9 .-]*$`
//!
//! These rules keep persisted object names and map keys unambiguous:
//! `@` and `;` never appear in a valid key or value, so the canonical
//! string and the `<collection>;<tags>` metadata attribute parse back
//! without escaping.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

static COLLECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_.]{0,254}$").expect("static regex"));
static TAG_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9 .-]*$").expect("static regex"));

pub fn is_valid_collection(c: &str) -> bool {
    COLLECTION_RE.is_match(c)
}

/// Tag keys follow the same rule as collection names.
pub fn is_valid_tag_key(k: &str) -> bool {
    COLLECTION_RE.is_match(k)
}

pub fn is_valid_tag_value(v: &str) -> bool {
    TAG_VALUE_RE.is_match(v)
}

/// Validate a full tag map, surfacing the offending key or value.
pub fn validate_tags(tags: &HashMap<String, String>) -> Result<()> {
    for (k, v) in tags {
        if !is_valid_tag_key(k) {
            return Err(Error::InvalidTagKey(k.clone()));
        }
        if !is_valid_tag_value(v) {
            return Err(Error::InvalidTagValue(v.clone()));
        }
    }
    Ok(())
}

/// Render a tag map as the canonical `k@v@k@v@` string, sorted by key.
pub fn canonical_tag_string(tags: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = tags.iter().collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    let mut out = String::new();
    for (k, v) in pairs {
        out.push_str(k);
        out.push('@');
        out.push_str(v);
        out.push('@');
    }
    out
}

/// Parse a canonical tag string back into a tag map.
///
/// The trailing empty element produced by the final `@` is dropped. An
/// odd number of remaining elements means the persisted key was not
/// produced by [`canonical_tag_string`] and is treated as corruption.
pub fn parse_tag_string(s: &str) -> Result<HashMap<String, String>> {
    if s.is_empty() {
        return Ok(HashMap::new());
    }
    let mut parts: Vec<&str> = s.split('@').collect();
    if parts.last() == Some(&"") {
        parts.pop();
    }
    if parts.len() % 2 != 0 {
        return Err(Error::Corrupt(format!("odd tag string: {s:?}")));
    }
    let mut tags = HashMap::with_capacity(parts.len() / 2);
    for pair in parts.chunks(2) {
        tags.insert(pair[0].to_string(), pair[1].to_string());
    }
    Ok(tags)
}

/// Parse the `stream` metadata attribute: `<collection>;<canonical tags>`.
pub fn parse_stream_entry(s: &str) -> Result<(String, HashMap<String, String>)> {
    let (collection, tag_str) = s
        .split_once(';')
        .ok_or_else(|| Error::Corrupt(format!("malformed stream entry: {s:?}")))?;
    Ok((collection.to_string(), parse_tag_string(tag_str)?))
}

/// Descriptor for one stream: identity, collection and tags.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub uuid: Uuid,
    pub collection: String,
    pub tags: HashMap<String, String>,
}

impl StreamInfo {
    pub fn new(uuid: Uuid, collection: impl Into<String>, tags: HashMap<String, String>) -> Self {
        Self {
            uuid,
            collection: collection.into(),
            tags,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    #[test]
    fn test_valid_collections() {
        assert!(is_valid_collection("phasor"));
        assert!(is_valid_collection("a"));
        assert!(is_valid_collection("grid.west_7"));
        assert!(is_valid_collection(&format!("a{}", "b".repeat(254))));
    }

    #[test]
    fn test_invalid_collections() {
        assert!(!is_valid_collection(""));
        assert!(!is_valid_collection("Phasor"));
        assert!(!is_valid_collection("7grid"));
        assert!(!is_valid_collection("has space"));
        assert!(!is_valid_collection("has@at"));
        assert!(!is_valid_collection(&format!("a{}", "b".repeat(255))));
    }

    #[test]
    fn test_tag_value_rules() {
        assert!(is_valid_tag_value(""));
        assert!(is_valid_tag_value("A1 b.c-d"));
        assert!(!is_valid_tag_value("nope@"));
        assert!(!is_valid_tag_value("semi;colon"));
    }

    #[test]
    fn test_validate_tags_reports_offender() {
        let t = tags(&[("chan", "A"), ("BAD", "x")]);
        assert_eq!(
            validate_tags(&t),
            Err(Error::InvalidTagKey("BAD".to_string()))
        );
        let t = tags(&[("chan", "A@B")]);
        assert_eq!(
            validate_tags(&t),
            Err(Error::InvalidTagValue("A@B".to_string()))
        );
    }

    // ---------------------------------------------------------------
    // Canonical string
    // ---------------------------------------------------------------

    #[test]
    fn test_canonical_sorted_by_key() {
        let t = tags(&[("loc", "x1"), ("chan", "A")]);
        assert_eq!(canonical_tag_string(&t), "chan@A@loc@x1@");
    }

    #[test]
    fn test_canonical_empty() {
        assert_eq!(canonical_tag_string(&HashMap::new()), "");
    }

    #[test]
    fn test_canonical_insertion_order_irrelevant() {
        let a = tags(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let mut b = HashMap::new();
        b.insert("c".to_string(), "3".to_string());
        b.insert("a".to_string(), "1".to_string());
        b.insert("b".to_string(), "2".to_string());
        assert_eq!(canonical_tag_string(&a), canonical_tag_string(&b));
    }

    #[test]
    fn test_parse_roundtrip() {
        let t = tags(&[("chan", "A"), ("loc", "x1"), ("unit", "volts")]);
        let s = canonical_tag_string(&t);
        assert_eq!(parse_tag_string(&s).expect("parse"), t);
    }

    #[test]
    fn test_parse_empty() {
        assert!(parse_tag_string("").expect("parse").is_empty());
    }

    #[test]
    fn test_parse_empty_value() {
        let t = tags(&[("chan", "")]);
        let s = canonical_tag_string(&t);
        assert_eq!(s, "chan@@");
        assert_eq!(parse_tag_string(&s).expect("parse"), t);
    }

    #[test]
    fn test_parse_odd_is_corrupt() {
        assert!(matches!(
            parse_tag_string("chan@A@loc@"),
            Err(Error::Corrupt(_))
        ));
    }

    // ---------------------------------------------------------------
    // Stream entry
    // ---------------------------------------------------------------

    #[test]
    fn test_stream_entry_roundtrip() {
        let t = tags(&[("chan", "A")]);
        let entry = format!("phasor;{}", canonical_tag_string(&t));
        let (collection, parsed) = parse_stream_entry(&entry).expect("parse");
        assert_eq!(collection, "phasor");
        assert_eq!(parsed, t);
    }

    #[test]
    fn test_stream_entry_no_tags() {
        let (collection, parsed) = parse_stream_entry("phasor;").expect("parse");
        assert_eq!(collection, "phasor");
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_stream_entry_missing_separator() {
        assert!(matches!(
            parse_stream_entry("phasor"),
            Err(Error::Corrupt(_))
        ));
    }
}
