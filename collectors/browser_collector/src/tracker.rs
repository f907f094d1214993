//! Single-active-domain dwell tracking.
//!
//! At any instant at most one domain accrues time. Every event first closes
//! the running session into the buffer and only then decides what (if
//! anything) is measured next.

use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, error};

use crate::buffer::{DurableStore, LocalBuffer};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Tab {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabEvent {
    TabActivated(Option<Tab>),
    TabUrlChanged(Tab),
    WindowFocusLost,
    WindowFocusGained(Option<Tab>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResolutionFailure {
    #[error("tab has no url")]
    MissingUrl,
    #[error("malformed url: {0}")]
    Malformed(String),
    #[error("untracked scheme '{0}'")]
    UntrackedScheme(String),
    #[error("url has no host")]
    MissingHost,
}

/// Hostname of an http(s) tab.
pub fn resolve_domain(tab: &Tab) -> Result<String, ResolutionFailure> {
    let raw = tab.url.as_deref().ok_or(ResolutionFailure::MissingUrl)?;
    let url = Url::parse(raw).map_err(|e| ResolutionFailure::Malformed(e.to_string()))?;
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(ResolutionFailure::UntrackedScheme(other.to_string())),
    }
    url.host_str()
        .filter(|h| !h.is_empty())
        .map(str::to_string)
        .ok_or(ResolutionFailure::MissingHost)
}

#[derive(Debug, Default)]
pub struct DwellTracker {
    active_domain: Option<String>,
    session_start: Option<DateTime<Utc>>,
    /// Closed seconds the buffer refused; retried on every flush.
    unrecorded: BTreeMap<String, u64>,
}

impl DwellTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_domain(&self) -> Option<&str> {
        self.active_domain.as_deref()
    }

    #[cfg(test)]
    pub fn session_start(&self) -> Option<DateTime<Utc>> {
        self.session_start
    }

    /// Applies one focus/navigation event. Never fails: an unresolvable tab
    /// simply means nothing is measured until the next event.
    pub fn handle<S: DurableStore>(
        &mut self,
        event: &TabEvent,
        now: DateTime<Utc>,
        buffer: &mut LocalBuffer<S>,
    ) {
        let tab = match event {
            TabEvent::TabUrlChanged(tab) if !tab.active => return,
            TabEvent::TabUrlChanged(tab) => Some(tab),
            TabEvent::TabActivated(tab) | TabEvent::WindowFocusGained(tab) => tab.as_ref(),
            TabEvent::WindowFocusLost => None,
        };

        self.flush(now, buffer);

        self.active_domain = tab.and_then(|tab| match resolve_domain(tab) {
            Ok(domain) => Some(domain),
            Err(err) => {
                debug!(url = ?tab.url, "no active domain: {err}");
                None
            }
        });
        self.session_start = self.active_domain.as_ref().map(|_| now);
    }

    /// Moves the running session's whole elapsed seconds into `buffer` and
    /// restarts the session at `now`. Returns the seconds recorded, including
    /// any held back by an earlier failed write.
    pub fn flush<S: DurableStore>(
        &mut self,
        now: DateTime<Utc>,
        buffer: &mut LocalBuffer<S>,
    ) -> u64 {
        let mut recorded = self.retry_unrecorded(buffer);
        let (Some(domain), Some(start)) = (self.active_domain.as_deref(), self.session_start)
        else {
            return recorded;
        };

        let elapsed = (now - start).num_seconds();
        if elapsed > 0 {
            let elapsed = elapsed as u64;
            match buffer.add(domain, elapsed) {
                Ok(()) => recorded += elapsed,
                Err(err) => {
                    error!(domain, elapsed, "failed to record dwell time: {err:#}");
                    let held = self.unrecorded.entry(domain.to_string()).or_insert(0);
                    *held = held.saturating_add(elapsed);
                }
            }
        }
        self.session_start = Some(now);
        recorded
    }

    fn retry_unrecorded<S: DurableStore>(&mut self, buffer: &mut LocalBuffer<S>) -> u64 {
        let mut recorded = 0;
        self.unrecorded
            .retain(|domain, seconds| match buffer.add(domain, *seconds) {
                Ok(()) => {
                    recorded += *seconds;
                    false
                }
                Err(_) => true,
            });
        recorded
    }
}
