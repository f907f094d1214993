//! Storage-safe domain keys.
//!
//! The store addresses nested values with `.`-separated paths, so a hostname
//! cannot be used as a key verbatim. Every `.` becomes `_` on the way in and
//! every `_` becomes `.` on the way out.
//!
//! Known limitation: a domain that already contains `_` does not round-trip,
//! because its underscores decode to dots. Hostnames never contain `_`, but
//! arbitrary input can; such keys are stored as-is and reported decoded.

use std::collections::BTreeMap;

pub const SEPARATOR: &str = ".";
pub const PLACEHOLDER: &str = "_";

pub fn encode_domain(domain: &str) -> String {
    domain.replace(SEPARATOR, PLACEHOLDER)
}

pub fn decode_key(key: &str) -> String {
    key.replace(PLACEHOLDER, SEPARATOR)
}

/// Whether `domain` survives an encode/decode round trip.
pub fn is_lossless(domain: &str) -> bool {
    !domain.contains(PLACEHOLDER)
}

/// Encodes every key of a domain -> seconds mapping.
///
/// Distinct domains that encode to the same key have their seconds summed so
/// no duration is dropped from the payload.
pub fn encode_payload(entries: &BTreeMap<String, u64>) -> BTreeMap<String, u64> {
    let mut out: BTreeMap<String, u64> = BTreeMap::new();
    for (domain, seconds) in entries {
        *out.entry(encode_domain(domain)).or_insert(0) += *seconds;
    }
    out
}
