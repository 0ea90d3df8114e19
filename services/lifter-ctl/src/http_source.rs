//! Endpoint feed client.
//!
//! The feed exposes two JSON resources:
//!
//! - `GET {base}/v1/endpoints`: full current state, one item per service,
//!   plus the id of the last event it reflects
//! - `GET {base}/v1/endpoints/events?after_event_id=N&limit=L`: incremental
//!   changes after a cursor
//!
//! The subscription tails the event log from the cursor of a baseline
//! snapshot, and redelivers a fresh snapshot every `redeliver_interval` the
//! way an informer resync does.
//!
//! Items are decoded one at a time. An item that does not decode is passed
//! on with an unknown kind, so the normalizer drops and counts it while the
//! cursor still moves past it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lifter_reconcile::{BackoffPolicy, EventSource, RawNotification, SourceError};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    items: Vec<Value>,
    #[serde(default)]
    last_event_id: i64,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    items: Vec<Value>,
    next_after_event_id: i64,
}

/// Decode one feed item, degrading to an unknown-kind notification.
fn decode_item(item: Value) -> RawNotification {
    let service_key = item
        .get("service_key")
        .and_then(Value::as_str)
        .map(str::to_string);

    match serde_json::from_value::<RawNotification>(item) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                error = %e,
                service_key = service_key.as_deref().unwrap_or(""),
                "undecodable feed item"
            );
            RawNotification {
                service_key,
                ..Default::default()
            }
        }
    }
}

/// Feed polling settings.
#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    /// Feed base URL.
    pub base_url: String,

    /// Poll interval when caught up.
    pub poll_interval: Duration,

    /// Max events per poll.
    pub fetch_limit: i64,

    /// Interval between full snapshot redeliveries.
    pub redeliver_interval: Duration,

    /// Backoff applied to consecutive feed errors.
    pub backoff: BackoffPolicy,

    /// Subscription channel capacity.
    pub buffer: usize,
}

impl HttpSourceConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            poll_interval: Duration::from_secs(1),
            fetch_limit: 200,
            redeliver_interval: Duration::from_secs(30),
            backoff: BackoffPolicy {
                base: Duration::from_millis(250),
                max: Duration::from_secs(30),
                jitter: 0.25,
            },
            buffer: 1024,
        }
    }
}

/// Event source backed by the HTTP endpoint feed.
pub struct HttpEventSource {
    client: reqwest::Client,
    config: HttpSourceConfig,
    subscribed: AtomicBool,
}

impl HttpEventSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("lifter-ctl/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SourceError::Unreachable(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            subscribed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn snapshot(&self) -> Result<Vec<RawNotification>, SourceError> {
        let snapshot = fetch_snapshot(&self.client, &self.config.base_url).await?;
        Ok(snapshot.items.into_iter().map(decode_item).collect())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RawNotification>, SourceError> {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return Err(SourceError::Closed);
        }

        let baseline = match fetch_snapshot(&self.client, &self.config.base_url).await {
            Ok(baseline) => baseline,
            Err(e) => {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel(self.config.buffer.max(1));
        let poller = FeedPoller {
            client: self.client.clone(),
            config: self.config.clone(),
            cursor: baseline.last_event_id,
            tx,
        };
        tokio::spawn(poller.run());

        info!(
            base_url = %self.config.base_url,
            cursor = baseline.last_event_id,
            "subscribed to endpoint feed"
        );
        Ok(rx)
    }
}

struct FeedPoller {
    client: reqwest::Client,
    config: HttpSourceConfig,
    cursor: i64,
    tx: mpsc::Sender<RawNotification>,
}

impl FeedPoller {
    /// Poll until the receiving side goes away.
    async fn run(mut self) {
        let mut failures: u32 = 0;
        let mut next_redelivery = Instant::now() + self.config.redeliver_interval;

        loop {
            let delay = match self.poll_once(&mut next_redelivery).await {
                Ok(true) => {
                    failures = 0;
                    continue;
                }
                Ok(false) => {
                    failures = 0;
                    self.config.poll_interval
                }
                Err(PollError::Closed) => break,
                Err(PollError::Feed(e)) => {
                    let delay = self.config.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    warn!(
                        error = %e,
                        cursor = self.cursor,
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to poll endpoint feed; retrying"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = self.tx.closed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        debug!(cursor = self.cursor, "endpoint feed poller stopped");
    }

    /// One poll. Returns true when more events are immediately available.
    async fn poll_once(&mut self, next_redelivery: &mut Instant) -> Result<bool, PollError> {
        if Instant::now() >= *next_redelivery {
            let snapshot = fetch_snapshot(&self.client, &self.config.base_url).await?;
            debug!(items = snapshot.items.len(), "redelivering endpoint snapshot");
            for item in snapshot.items {
                self.send(decode_item(item)).await?;
            }
            self.cursor = self.cursor.max(snapshot.last_event_id);
            *next_redelivery = Instant::now() + self.config.redeliver_interval;
        }

        let resp = fetch_events(
            &self.client,
            &self.config.base_url,
            self.cursor,
            self.config.fetch_limit,
        )
        .await?;

        if resp.items.is_empty() {
            self.cursor = resp.next_after_event_id.max(self.cursor);
            return Ok(false);
        }

        let full_page = resp.items.len() as i64 >= self.config.fetch_limit;
        for item in resp.items {
            if let Some(event_id) = item.get("event_id").and_then(Value::as_i64) {
                self.cursor = event_id.max(self.cursor);
            }
            self.send(decode_item(item)).await?;
        }
        self.cursor = resp.next_after_event_id.max(self.cursor);

        Ok(full_page)
    }

    async fn send(&self, item: RawNotification) -> Result<(), PollError> {
        self.tx.send(item).await.map_err(|_| PollError::Closed)
    }
}

enum PollError {
    /// The subscriber dropped its receiver.
    Closed,
    Feed(SourceError),
}

impl From<SourceError> for PollError {
    fn from(err: SourceError) -> Self {
        Self::Feed(err)
    }
}

async fn fetch_snapshot(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<SnapshotResponse, SourceError> {
    let base = base_url.trim_end_matches('/');
    let resp = client
        .get(format!("{base}/v1/endpoints"))
        .send()
        .await
        .map_err(|e| SourceError::Unreachable(e.to_string()))?;

    decode(resp, "snapshot").await
}

async fn fetch_events(
    client: &reqwest::Client,
    base_url: &str,
    after_event_id: i64,
    limit: i64,
) -> Result<EventsResponse, SourceError> {
    let base = base_url.trim_end_matches('/');
    let resp = client
        .get(format!("{base}/v1/endpoints/events"))
        .query(&[("after_event_id", after_event_id), ("limit", limit)])
        .send()
        .await
        .map_err(|e| SourceError::Unreachable(e.to_string()))?;

    decode(resp, "events query").await
}

async fn decode<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
    what: &str,
) -> Result<T, SourceError> {
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(SourceError::Unreachable(format!(
            "{what} failed (status={status}): {body}"
        )));
    }

    resp.json::<T>()
        .await
        .map_err(|e| SourceError::InvalidResponse(format!("{what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifter_reconcile::NotificationKind;
    use serde_json::json;

    #[test]
    fn test_event_item_decodes_alongside_event_id() {
        let json = r#"{
            "items": [
                {"event_id": 7, "kind": "update", "service_key": "10.96.0.1",
                 "backends": ["10.0.0.1"], "epoch": 42}
            ],
            "next_after_event_id": 7
        }"#;
        let resp: EventsResponse = serde_json::from_str(json).unwrap();
        let raw = decode_item(resp.items[0].clone());
        assert_eq!(raw.kind, NotificationKind::Update);
        assert_eq!(raw.epoch, Some(42));
        assert_eq!(raw.backends, vec!["10.0.0.1"]);
    }

    #[test]
    fn test_bad_item_does_not_spoil_the_page() {
        let json = r#"{
            "items": [
                {"event_id": 1, "kind": "resync", "service_key": "10.96.0.1"},
                {"event_id": 2, "kind": "update", "service_key": "10.96.0.2",
                 "backends": "10.0.0.1"},
                {"event_id": 3, "kind": "update", "service_key": "10.96.0.3",
                 "backends": ["10.0.0.3"]}
            ],
            "next_after_event_id": 3
        }"#;
        let resp: EventsResponse = serde_json::from_str(json).unwrap();
        let kinds: Vec<_> = resp.items.into_iter().map(|i| decode_item(i).kind).collect();
        assert_eq!(
            kinds,
            vec![
                NotificationKind::Unknown,
                NotificationKind::Unknown,
                NotificationKind::Update
            ]
        );
    }

    #[test]
    fn test_undecodable_item_keeps_its_key() {
        let raw = decode_item(json!({"kind": "add", "service_key": "10.96.0.5", "epoch": "x"}));
        assert_eq!(raw.kind, NotificationKind::Unknown);
        assert_eq!(raw.service_key.as_deref(), Some("10.96.0.5"));

        assert_eq!(decode_item(json!(17)).service_key, None);
    }

    #[test]
    fn test_snapshot_cursor_defaults_to_zero() {
        let resp: SnapshotResponse = serde_json::from_str(r#"{"items": []}"#).unwrap();
        assert_eq!(resp.last_event_id, 0);
    }
}
