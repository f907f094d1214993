use tracing::warn;
use usage_protocol::{decode_key, Report};

use crate::store::StoredEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Category {
    Productive,
    Unproductive,
    Neutral,
}

/// Keyword rules in precedence order. A domain belongs to the first category
/// with a keyword that occurs anywhere in it; no match means neutral.
const CATEGORY_RULES: &[(Category, &[&str])] = &[
    (Category::Productive, &["github", "stackoverflow", "localhost"]),
    (
        Category::Unproductive,
        &["youtube", "facebook", "reddit", "instagram"],
    ),
];

pub fn classify(domain: &str) -> Category {
    CATEGORY_RULES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|k| domain.contains(k)))
        .map(|(category, _)| *category)
        .unwrap_or(Category::Neutral)
}

/// Builds the categorized report from a user's stored entries. `None` (no
/// record) yields the all-zero report.
pub fn build_report(entries: Option<&[StoredEntry]>) -> Report {
    let mut report = Report::default();
    let Some(entries) = entries else {
        return report;
    };

    for (key, seconds) in entries {
        let Some(seconds) = *seconds else {
            warn!(key = %key, "skipping non-numeric stored duration");
            continue;
        };

        let domain = decode_key(key);
        let bucket = match classify(&domain) {
            Category::Productive => &mut report.productive,
            Category::Unproductive => &mut report.unproductive,
            Category::Neutral => &mut report.neutral,
        };
        *bucket = bucket.saturating_add(seconds);
        // Keys that decode to the same domain (see codec) share one entry.
        let total = report.details.entry(domain).or_insert(0);
        *total = total.saturating_add(seconds);
    }
    report
}
