//! Wire types shared by the usage server and its collectors.
//!
//! The server remains the authority on validation; collectors reuse these
//! types so that the JSON they send and read cannot drift from what the
//! server produces.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod codec;

pub use codec::{decode_key, encode_domain, encode_payload, is_lossless};

/// The single fixed identity every collector reports as.
pub const DEFAULT_USER_ID: &str = "user123";

pub const TRACK_PATH: &str = "/api/track";
pub const REPORT_PATH: &str = "/api/report";

pub fn report_path(user_id: &str) -> String {
    format!("{REPORT_PATH}/{user_id}")
}

/// Body of `POST /api/track`. Keys of `data` are already encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub data: BTreeMap<String, u64>,
}

/// All-time per-domain totals held by the server for one user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumulativeRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub data: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CumulativeRecord>,
}

/// The part of a `/api/track` response a collector relies on. The echoed
/// record is ignored, so a server that stores totals in another numeric form
/// still confirms delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TrackAck {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

/// Categorized view of a user's cumulative record, keyed by decoded domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub productive: u64,
    pub unproductive: u64,
    pub neutral: u64,
    #[serde(default)]
    pub details: BTreeMap<String, u64>,
}

impl Report {
    pub fn total(&self) -> u64 {
        self.productive
            .saturating_add(self.unproductive)
            .saturating_add(self.neutral)
    }

    /// Domains with at least `min_seconds`, most used first, at most `limit`.
    /// Ties are broken by domain name so the order is stable.
    pub fn top_domains(&self, limit: usize, min_seconds: u64) -> Vec<(&str, u64)> {
        let mut ranked: Vec<(&str, u64)> = self
            .details
            .iter()
            .filter(|(_, seconds)| **seconds >= min_seconds)
            .map(|(domain, seconds)| (domain.as_str(), *seconds))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.truncate(limit);
        ranked
    }
}
