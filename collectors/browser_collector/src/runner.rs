use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::info;

use crate::{
    buffer::DurableStore,
    events::{InboundMessage, TabEventSource},
    sync::{log_outcome, NetworkClient, SyncEngine},
    tracker::TabEvent,
};

fn spawn_sync<S: DurableStore, C: NetworkClient>(
    engine: &Arc<SyncEngine<S, C>>,
    trigger: &'static str,
) {
    let engine = engine.clone();
    tokio::spawn(async move {
        let result = engine.sync().await;
        log_outcome(trigger, &result);
    });
}

/// Feeds events into the tracker one at a time and syncs every
/// `sync_every`, on `force_sync`, and once more before returning.
///
/// Returns when the source is exhausted or on `shutdown`.
pub async fn run<S, C, E>(
    engine: Arc<SyncEngine<S, C>>,
    mut source: E,
    sync_every: Duration,
    shutdown: impl std::future::Future<Output = ()>,
) -> anyhow::Result<()>
where
    S: DurableStore,
    C: NetworkClient,
    E: TabEventSource,
{
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + sync_every, sync_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(
        user_id = engine.user_id(),
        sync_every_seconds = sync_every.as_secs(),
        "collector started"
    );

    loop {
        tokio::select! {
            msg = source.next_message() => match msg {
                Some(InboundMessage::ForceSync) => spawn_sync(&engine, "on_demand"),
                Some(msg) => {
                    if let Some(event) = msg.into_tab_event() {
                        engine.handle_event(event).await;
                    }
                }
                None => {
                    info!("event source closed");
                    break;
                }
            },
            _ = ticker.tick() => spawn_sync(&engine, "timer"),
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
        }
    }

    // The browser is gone either way; stop the clock before the last sync.
    engine.handle_event(TabEvent::WindowFocusLost).await;
    let result = engine.sync_queued().await;
    log_outcome("shutdown", &result);
    Ok(())
}
