//! Identifier sanitization
//!
//! Target-store identifiers start with a letter, contain only
//! `[A-Za-z0-9_]`, never end with `_` and are at most 254 characters.
//! Raw identifiers arrive in whatever shape the publisher chose, sometimes
//! already carrying a type prefix meant for a different record kind.

use super::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Longest identifier the target store accepts.
pub const MAX_IDENTIFIER_LEN: usize = 254;

/// Prefix used when an identifier needs one and no slot prefix applies.
pub const FALLBACK_PREFIX: &str = "id_";

/// Record kind → type prefix (e.g. `event` → `hal_`).
///
/// The table's values are the "known" prefixes: one of them at the start of
/// a raw identifier is stripped before the correct prefix is applied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrefixTable(BTreeMap<String, String>);

impl PrefixTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: impl Into<String>, prefix: impl Into<String>) -> Self {
        self.0.insert(kind.into(), prefix.into());
        self
    }

    /// Prefix registered for a record kind or relation name.
    pub fn prefix_for(&self, kind: &str) -> Option<&str> {
        self.0.get(kind).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Longest known (or slot) prefix at the start of `raw`.
    fn strip_known<'a, 'p>(
        &'p self,
        raw: &'a str,
        slot: Option<&'p str>,
    ) -> Option<(&'p str, &'a str)> {
        self.0
            .values()
            .map(String::as_str)
            .chain(slot)
            .filter(|p| !p.is_empty() && raw.starts_with(*p))
            .max_by_key(|p| p.len())
            .map(|p| (p, &raw[p.len()..]))
    }
}

/// True if `prefix` could itself start a valid identifier.
pub fn is_valid_prefix(prefix: &str) -> bool {
    prefix.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Sanitize a raw identifier for a slot expecting `slot_prefix`.
///
/// Idempotent: `sanitize(sanitize(x)) == sanitize(x)` for the same slot.
pub fn sanitize_identifier(
    raw: &str,
    slot_prefix: Option<&str>,
    table: &PrefixTable,
) -> Result<String, ValidationError> {
    let (stripped, rest) = match table.strip_known(raw, slot_prefix) {
        Some((prefix, rest)) => (Some(prefix), rest),
        None => (None, raw),
    };

    let mut body: String = rest
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();

    if body.trim_matches('_').is_empty() {
        return Err(ValidationError::EmptyIdentifier(raw.to_string()));
    }

    let starts_with_letter = body.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    if stripped.is_some() || !starts_with_letter {
        let prefix = slot_prefix.or(stripped).unwrap_or(FALLBACK_PREFIX);
        body.insert_str(0, prefix);
    }

    // ASCII only from here on, so byte truncation is safe
    let mut out = body.trim_end_matches('_').to_string();
    if out.len() > MAX_IDENTIFIER_LEN {
        out.truncate(MAX_IDENTIFIER_LEN);
        out.truncate(out.trim_end_matches('_').len());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PrefixTable {
        PrefixTable::new()
            .with("event", "hal_")
            .with("definition", "had_")
            .with("frame", "haf_")
            .with("asset", "haa_")
    }

    fn is_valid(id: &str) -> bool {
        id.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            && !id.ends_with('_')
            && id.len() <= MAX_IDENTIFIER_LEN
    }

    #[test]
    fn digit_start_gets_slot_prefix_and_keeps_digits() {
        let out = sanitize_identifier("75_site", Some("haa_"), &table()).unwrap();
        assert_eq!(out, "haa_75_site");
    }

    #[test]
    fn matching_prefix_is_kept() {
        let out = sanitize_identifier("had_75_def", Some("had_"), &table()).unwrap();
        assert_eq!(out, "had_75_def");
    }

    #[test]
    fn foreign_prefix_is_replaced() {
        let out = sanitize_identifier("had_75_def", Some("hal_"), &table()).unwrap();
        assert_eq!(out, "hal_75_def");
    }

    #[test]
    fn stripped_prefix_is_restored_without_slot() {
        let out = sanitize_identifier("haf_9.x", None, &table()).unwrap();
        assert_eq!(out, "haf_9_x");
    }

    #[test]
    fn dots_and_symbols_become_underscores() {
        let out = sanitize_identifier("sensor.kitchen-temp", None, &table()).unwrap();
        assert_eq!(out, "sensor_kitchen_temp");
    }

    #[test]
    fn trailing_underscores_are_trimmed() {
        let out = sanitize_identifier("alarm.", None, &table()).unwrap();
        assert_eq!(out, "alarm");
    }

    #[test]
    fn digit_start_without_slot_uses_fallback() {
        let out = sanitize_identifier("42", None, &table()).unwrap();
        assert_eq!(out, "id_42");
    }

    #[test]
    fn longest_known_prefix_wins() {
        let t = table().with("area", "ha_");
        let out = sanitize_identifier("hal_1", Some("haa_"), &t).unwrap();
        assert_eq!(out, "haa_1");
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        assert!(sanitize_identifier("", None, &table()).is_err());
        assert!(sanitize_identifier("...", Some("hal_"), &table()).is_err());
        assert!(sanitize_identifier("hal_", Some("hal_"), &table()).is_err());
    }

    #[test]
    fn long_identifiers_are_truncated() {
        let raw = format!("a{}", "b_".repeat(200));
        let out = sanitize_identifier(&raw, None, &table()).unwrap();
        assert!(out.len() <= MAX_IDENTIFIER_LEN);
        assert!(is_valid(&out));
    }

    #[test]
    fn sanitize_is_idempotent() {
        let inputs = [
            "75_site", "had_75_def", "hal_75_def", "x.y.z", "_lead", "9", "trail__",
            "Ünïcode-id", "haa_haa_1", "a b c", "hal__x",
        ];
        let long = "9".repeat(400);
        let t = table();
        for slot in [None, Some("hal_"), Some("haa_")] {
            for raw in inputs.iter().copied().chain(std::iter::once(long.as_str())) {
                let once = sanitize_identifier(raw, slot, &t).unwrap();
                let twice = sanitize_identifier(&once, slot, &t).unwrap();
                assert_eq!(once, twice, "input {:?} slot {:?}", raw, slot);
                assert!(is_valid(&once), "invalid output {:?}", once);
            }
        }
    }

    #[test]
    fn prefix_validity() {
        assert!(is_valid_prefix("hal_"));
        assert!(!is_valid_prefix("1x_"));
        assert!(!is_valid_prefix("a-b"));
        assert!(!is_valid_prefix(""));
    }
}
