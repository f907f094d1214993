//! Messages from the browser shell, one JSON object per line.
//!
//! ```text
//! {"type":"tab_activated","tab":{"url":"https://github.com/"}}
//! {"type":"tab_updated","tab":{"url":"https://github.com/x","active":true},"url_changed":true}
//! {"type":"window_focus_lost"}
//! {"type":"window_focus_gained","tab":{"url":"https://example.com/"}}
//! {"type":"force_sync"}
//! ```

use serde::Deserialize;
use std::future::Future;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tracing::warn;

use crate::tracker::{Tab, TabEvent};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    TabActivated {
        #[serde(default)]
        tab: Option<Tab>,
    },
    TabUpdated {
        tab: Tab,
        #[serde(default = "default_url_changed")]
        url_changed: bool,
    },
    WindowFocusLost,
    WindowFocusGained {
        #[serde(default)]
        tab: Option<Tab>,
    },
    ForceSync,
}

fn default_url_changed() -> bool {
    true
}

impl InboundMessage {
    /// The tracker event this message maps to. `None` for messages that do
    /// not move attribution (sync requests, updates that did not change the
    /// URL).
    pub fn into_tab_event(self) -> Option<TabEvent> {
        match self {
            InboundMessage::TabActivated { tab } => Some(TabEvent::TabActivated(tab)),
            InboundMessage::TabUpdated { tab, url_changed } => {
                url_changed.then_some(TabEvent::TabUrlChanged(tab))
            }
            InboundMessage::WindowFocusLost => Some(TabEvent::WindowFocusLost),
            InboundMessage::WindowFocusGained { tab } => Some(TabEvent::WindowFocusGained(tab)),
            InboundMessage::ForceSync => None,
        }
    }
}

pub trait TabEventSource: Send {
    /// Next message, or `None` once the source is exhausted.
    fn next_message(&mut self) -> impl Future<Output = Option<InboundMessage>> + Send;
}

pub struct LineEventSource<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin + Send> LineEventSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }
}

impl<R: AsyncRead + Unpin + Send> TabEventSource for LineEventSource<R> {
    async fn next_message(&mut self) -> Option<InboundMessage> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(err) => {
                    warn!("event input failed: {err}");
                    return None;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(msg) => return Some(msg),
                Err(err) => warn!(line, "skipping unreadable event: {err}"),
            }
        }
    }
}
