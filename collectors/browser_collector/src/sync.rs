//! Upload of buffered dwell time to the usage server.
//!
//! Delivery is at-least-once: the buffer only shrinks after the server has
//! confirmed the increment, so a failed or timed-out POST is retried with the
//! same (or larger) totals on the next trigger.

use anyhow::Context;
use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use usage_protocol::{
    encode_payload, is_lossless, report_path, ErrorBody, Report, TrackAck, TrackRequest, TRACK_PATH,
};

use crate::{
    buffer::{DurableStore, LocalBuffer},
    clock::Clock,
    tracker::{DwellTracker, TabEvent},
};

pub trait NetworkClient: Send + Sync + 'static {
    /// Resolves once the server has confirmed the increment.
    fn post_track(&self, request: &TrackRequest) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn get_report(&self, user_id: &str) -> impl Future<Output = anyhow::Result<Report>> + Send;
}

pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

async fn error_for_status(res: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let detail = res
        .json::<ErrorBody>()
        .await
        .map(|b| b.error)
        .unwrap_or_default();
    anyhow::bail!("http_{}: {}", status.as_u16(), detail)
}

impl NetworkClient for HttpClient {
    async fn post_track(&self, request: &TrackRequest) -> anyhow::Result<()> {
        let url = format!("{}{}", self.base_url, TRACK_PATH);
        let res = self.client.post(&url).json(request).send().await?;
        let ack: TrackAck = error_for_status(res).await?.json().await?;
        if !ack.success {
            anyhow::bail!("not_ok");
        }
        Ok(())
    }

    async fn get_report(&self, user_id: &str) -> anyhow::Result<Report> {
        let url = format!("{}{}", self.base_url, report_path(user_id));
        let res = self.client.get(&url).send().await?;
        Ok(error_for_status(res).await?.json().await?)
    }
}

/// Tracker and buffer, mutated together under one lock so that no two
/// transitions ever interleave.
pub struct Tracking<S> {
    pub tracker: DwellTracker,
    pub buffer: LocalBuffer<S>,
}

impl<S: DurableStore> Tracking<S> {
    pub fn new(buffer: LocalBuffer<S>) -> Self {
        Self {
            tracker: DwellTracker::new(),
            buffer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Nothing buffered; no request was made.
    Empty,
    /// Another sync was already in flight.
    Coalesced,
    Synced { domains: usize, seconds: u64 },
}

pub struct SyncEngine<S, C> {
    tracking: Mutex<Tracking<S>>,
    sync_gate: Mutex<()>,
    client: C,
    clock: Arc<dyn Clock>,
    user_id: String,
}

impl<S: DurableStore, C: NetworkClient> SyncEngine<S, C> {
    pub fn new(tracking: Tracking<S>, client: C, clock: Arc<dyn Clock>, user_id: &str) -> Self {
        Self {
            tracking: Mutex::new(tracking),
            sync_gate: Mutex::new(()),
            client,
            clock,
            user_id: user_id.to_string(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn handle_event(&self, event: TabEvent) {
        let mut guard = self.tracking.lock().await;
        let Tracking { tracker, buffer } = &mut *guard;
        let before = tracker.active_domain().map(str::to_string);
        tracker.handle(&event, self.clock.now(), buffer);
        if tracker.active_domain() != before.as_deref() {
            debug!(
                from = before.as_deref().unwrap_or("-"),
                to = tracker.active_domain().unwrap_or("-"),
                "active domain changed"
            );
        }
    }

    /// Buffered seconds per domain, including the running session.
    pub async fn pending(&self) -> anyhow::Result<BTreeMap<String, u64>> {
        let mut guard = self.tracking.lock().await;
        let Tracking { tracker, buffer } = &mut *guard;
        tracker.flush(self.clock.now(), buffer);
        buffer.snapshot()
    }

    /// Syncs unless a sync is already running, in which case this trigger is
    /// folded into the running one.
    pub async fn sync(&self) -> anyhow::Result<SyncOutcome> {
        let Ok(_gate) = self.sync_gate.try_lock() else {
            debug!("sync already in flight; coalesced");
            return Ok(SyncOutcome::Coalesced);
        };
        self.sync_locked().await
    }

    /// Waits for any running sync to finish, then syncs.
    pub async fn sync_queued(&self) -> anyhow::Result<SyncOutcome> {
        let _gate = self.sync_gate.lock().await;
        self.sync_locked().await
    }

    async fn sync_locked(&self) -> anyhow::Result<SyncOutcome> {
        let snapshot = {
            let mut guard = self.tracking.lock().await;
            let Tracking { tracker, buffer } = &mut *guard;
            tracker.flush(self.clock.now(), buffer);
            buffer.snapshot()?
        };
        if snapshot.is_empty() {
            return Ok(SyncOutcome::Empty);
        }

        for domain in snapshot.keys().filter(|d| !is_lossless(d)) {
            warn!(domain = %domain, "domain contains '_' and will not decode back exactly");
        }
        let request = TrackRequest {
            user_id: self.user_id.clone(),
            data: encode_payload(&snapshot),
        };
        // The tracking lock is not held here: events keep accruing while the
        // request is outstanding.
        self.client
            .post_track(&request)
            .await
            .context("sync failed; buffer kept for retry")?;

        let mut guard = self.tracking.lock().await;
        let Tracking { tracker, buffer } = &mut *guard;
        if let Err(err) = buffer.settle(&snapshot) {
            // The server already has these seconds; keeping them would count
            // them twice on the next sync.
            error!("failed to settle synced buffer: {err:#}");
            return Err(err.context("settle synced buffer"));
        }
        // Restart the running session's baseline at the confirmation time.
        tracker.flush(self.clock.now(), buffer);

        Ok(SyncOutcome::Synced {
            domains: snapshot.len(),
            seconds: snapshot.values().sum(),
        })
    }
}

/// Logs a sync result; failures are never fatal to the collector.
pub fn log_outcome(trigger: &str, result: &anyhow::Result<SyncOutcome>) {
    match result {
        Ok(SyncOutcome::Synced { domains, seconds }) => {
            info!(trigger, domains, seconds, "synced usage")
        }
        Ok(SyncOutcome::Empty) => debug!(trigger, "nothing to sync"),
        Ok(SyncOutcome::Coalesced) => debug!(trigger, "sync coalesced"),
        Err(err) => warn!(trigger, "{err:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{buffer::MemoryStore, clock::testing::ManualClock, tracker::Tab};
    use chrono::{TimeZone, Utc};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FakeClient {
        requests: StdMutex<Vec<TrackRequest>>,
        fail: StdMutex<bool>,
        // When set, post_track signals `entered` and waits for `release`.
        hold: Option<(Arc<Notify>, Arc<Notify>)>,
    }

    impl FakeClient {
        fn failing() -> Self {
            Self {
                fail: StdMutex::new(true),
                ..Self::default()
            }
        }

        fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        fn requests(&self) -> Vec<TrackRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    impl NetworkClient for FakeClient {
        async fn post_track(&self, request: &TrackRequest) -> anyhow::Result<()> {
            if let Some((entered, release)) = &self.hold {
                entered.notify_one();
                release.notified().await;
            }
            self.requests.lock().unwrap().push(request.clone());
            if *self.fail.lock().unwrap() {
                anyhow::bail!("connection refused");
            }
            Ok(())
        }

        async fn get_report(&self, _user_id: &str) -> anyhow::Result<Report> {
            Ok(Report::default())
        }
    }

    fn engine(client: FakeClient) -> (Arc<SyncEngine<MemoryStore, FakeClient>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let tracking = Tracking::new(LocalBuffer::new(MemoryStore::default()));
        let engine = SyncEngine::new(tracking, client, clock.clone(), "user123");
        (Arc::new(engine), clock)
    }

    fn open(url: &str) -> TabEvent {
        TabEvent::TabActivated(Some(Tab::active(url)))
    }

    #[tokio::test]
    async fn empty_buffer_makes_no_request() {
        let (engine, _) = engine(FakeClient::default());
        assert_eq!(engine.sync().await.unwrap(), SyncOutcome::Empty);
        assert!(engine.client().requests().is_empty());
    }

    #[tokio::test]
    async fn sync_captures_running_session_and_encodes_keys() {
        let (engine, clock) = engine(FakeClient::default());
        engine.handle_event(open("https://github.com")).await;
        clock.advance_secs(45);

        let outcome = engine.sync().await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                domains: 1,
                seconds: 45
            }
        );
        let requests = engine.client().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].user_id, "user123");
        assert_eq!(
            requests[0].data,
            BTreeMap::from([("github_com".to_string(), 45)])
        );
        assert!(engine.pending().await.unwrap().is_empty());

        // The session keeps running from the sync point.
        clock.advance_secs(10);
        assert_eq!(engine.pending().await.unwrap()["github.com"], 10);
    }

    #[tokio::test]
    async fn failed_sync_keeps_buffer_and_retry_sends_once() {
        let (engine, clock) = engine(FakeClient::failing());
        engine.handle_event(open("https://youtube.com")).await;
        clock.advance_secs(30);
        engine.handle_event(TabEvent::WindowFocusLost).await;
        let before = engine.pending().await.unwrap();

        assert!(engine.sync().await.is_err());
        assert_eq!(engine.pending().await.unwrap(), before);

        engine.client().set_failing(false);
        engine.sync().await.unwrap();
        let requests = engine.client().requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].data["youtube_com"], 30);
        assert!(engine.pending().await.unwrap().is_empty());
        assert_eq!(engine.sync().await.unwrap(), SyncOutcome::Empty);
    }

    #[tokio::test]
    async fn concurrent_trigger_is_coalesced_and_new_time_survives() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let client = FakeClient {
            hold: Some((entered.clone(), release.clone())),
            ..FakeClient::default()
        };
        let (engine, clock) = engine(client);
        engine.handle_event(open("https://github.com")).await;
        clock.advance_secs(20);

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync().await }
        });
        entered.notified().await;

        assert_eq!(engine.sync().await.unwrap(), SyncOutcome::Coalesced);

        // Tracking continues while the request is outstanding.
        clock.advance_secs(7);
        engine.handle_event(open("https://example.com")).await;
        clock.advance_secs(3);
        engine.handle_event(TabEvent::WindowFocusLost).await;

        release.notify_one();
        let outcome = first.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                domains: 1,
                seconds: 20
            }
        );
        assert_eq!(engine.client().requests().len(), 1);
        assert_eq!(
            engine.pending().await.unwrap(),
            BTreeMap::from([
                ("example.com".to_string(), 3),
                ("github.com".to_string(), 7),
            ])
        );
    }

    #[tokio::test]
    async fn queued_sync_waits_for_running_one() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let client = FakeClient {
            hold: Some((entered.clone(), release.clone())),
            ..FakeClient::default()
        };
        let (engine, clock) = engine(client);
        engine.handle_event(open("https://github.com")).await;
        clock.advance_secs(5);

        let first = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync().await }
        });
        entered.notified().await;

        clock.advance_secs(4);
        let second = tokio::spawn({
            let engine = engine.clone();
            async move { engine.sync_queued().await }
        });

        release.notify_one();
        first.await.unwrap().unwrap();
        entered.notified().await;
        release.notify_one();
        let outcome = second.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Synced {
                domains: 1,
                seconds: 4
            }
        );
        let total: u64 = engine
            .client()
            .requests()
            .iter()
            .map(|r| r.data["github_com"])
            .sum();
        assert_eq!(total, 9);
    }

    async fn serve(app: axum::Router) -> HttpClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        HttpClient::new(&format!("http://{addr}/"), Duration::from_secs(5)).unwrap()
    }

    fn track_replying(status: u16, body: serde_json::Value) -> axum::Router {
        let status = axum::http::StatusCode::from_u16(status).unwrap();
        axum::Router::new().route(
            TRACK_PATH,
            axum::routing::post(move || {
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            }),
        )
    }

    fn sample_request() -> TrackRequest {
        TrackRequest {
            user_id: "user123".to_string(),
            data: BTreeMap::from([("github_com".to_string(), 5)]),
        }
    }

    #[tokio::test]
    async fn http_client_confirms_success_whatever_the_record_holds() {
        let client = serve(track_replying(
            200,
            serde_json::json!({
                "success": true,
                "data": { "userId": "user123", "data": { "github_com": 12.5 } }
            }),
        ))
        .await;
        client.post_track(&sample_request()).await.unwrap();
    }

    #[tokio::test]
    async fn http_client_treats_server_error_as_failure() {
        let client = serve(track_replying(
            500,
            serde_json::json!({ "error": "Internal server error" }),
        ))
        .await;
        let err = client.post_track(&sample_request()).await.unwrap_err();
        assert_eq!(err.to_string(), "http_500: Internal server error");
    }

    #[tokio::test]
    async fn http_client_treats_unsuccessful_body_as_failure() {
        let client = serve(track_replying(200, serde_json::json!({ "success": false }))).await;
        let err = client.post_track(&sample_request()).await.unwrap_err();
        assert_eq!(err.to_string(), "not_ok");
    }

    #[tokio::test]
    async fn http_client_fetches_report_for_user() {
        let app = axum::Router::new().route(
            &report_path("user123"),
            axum::routing::get(|| async {
                axum::Json(Report {
                    productive: 120,
                    details: BTreeMap::from([("github.com".to_string(), 120)]),
                    ..Report::default()
                })
            }),
        );
        let client = serve(app).await;
        let report = client.get_report("user123").await.unwrap();
        assert_eq!(report.productive, 120);
        assert_eq!(report.details["github.com"], 120);
    }

    #[tokio::test]
    async fn failed_http_sync_keeps_buffer() {
        let client = serve(track_replying(
            500,
            serde_json::json!({ "error": "Internal server error" }),
        ))
        .await;
        let clock = Arc::new(ManualClock::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap()));
        let mut buffer = LocalBuffer::new(MemoryStore::default());
        buffer.add("github.com", 40).unwrap();
        let engine = SyncEngine::new(Tracking::new(buffer), client, clock, "user123");

        let err = engine.sync().await.unwrap_err();
        assert!(format!("{err:#}").contains("http_500"));
        assert_eq!(engine.pending().await.unwrap()["github.com"], 40);
    }
}
