//! Membership event source interface.
//!
//! The source behaves like a level-triggered watch: every delivery asserts
//! the full current backend set of one service, deliveries may repeat, and
//! the whole state is redelivered periodically. Nothing here depends on the
//! source delivering a change exactly once.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SourceError;

/// Kind of membership change as reported by the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Add,
    Update,
    Delete,
    /// Missing or unrecognized kind. Rejected by the normalizer.
    #[default]
    #[serde(other)]
    Unknown,
}

/// A notification exactly as the source delivered it, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawNotification {
    #[serde(default)]
    pub kind: NotificationKind,

    /// Service key in dotted-quad form.
    #[serde(default)]
    pub service_key: Option<String>,

    /// Observed backend addresses in dotted-quad form.
    #[serde(default)]
    pub backends: Vec<String>,

    /// Source ordering token (watch resource version), if the source has one.
    #[serde(default)]
    pub epoch: Option<u64>,

    /// Human-readable service name, used only for logging.
    #[serde(default)]
    pub service_name: Option<String>,
}

impl RawNotification {
    pub fn new(kind: NotificationKind, service_key: &str, backends: &[&str]) -> Self {
        Self {
            kind,
            service_key: Some(service_key.to_string()),
            backends: backends.iter().map(|b| b.to_string()).collect(),
            epoch: None,
            service_name: None,
        }
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }
}

/// External source of membership changes.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Full current state, one notification per service.
    async fn snapshot(&self) -> Result<Vec<RawNotification>, SourceError>;

    /// Start receiving changes. The channel closes when the source ends.
    async fn subscribe(&self) -> Result<mpsc::Receiver<RawNotification>, SourceError>;
}

// =============================================================================
// Channel-backed source
// =============================================================================

/// In-process source fed through an mpsc sender.
///
/// Used by tests and by embedders that already have their own watch loop.
pub struct ChannelEventSource {
    tx: mpsc::Sender<RawNotification>,
    rx: Mutex<Option<mpsc::Receiver<RawNotification>>>,
    snapshot: Mutex<Vec<RawNotification>>,
    unreachable: Mutex<bool>,
}

impl ChannelEventSource {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            snapshot: Mutex::new(Vec::new()),
            unreachable: Mutex::new(false),
        }
    }

    /// Sender used to push notifications into the subscription.
    pub fn sender(&self) -> mpsc::Sender<RawNotification> {
        self.tx.clone()
    }

    /// Replace the state returned by `snapshot`.
    pub fn set_snapshot(&self, items: Vec<RawNotification>) {
        *self.snapshot.lock().unwrap_or_else(|e| e.into_inner()) = items;
    }

    /// Make `snapshot` fail as unreachable.
    pub fn set_unreachable(&self, unreachable: bool) {
        *self.unreachable.lock().unwrap_or_else(|e| e.into_inner()) = unreachable;
    }
}

#[async_trait]
impl EventSource for ChannelEventSource {
    async fn snapshot(&self) -> Result<Vec<RawNotification>, SourceError> {
        if *self.unreachable.lock().unwrap_or_else(|e| e.into_inner()) {
            return Err(SourceError::Unreachable("channel source marked unreachable".into()));
        }
        Ok(self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<RawNotification>, SourceError> {
        self.rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SourceError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_notification_json() {
        let json = r#"{"kind":"delete","service_key":"10.96.0.1","epoch":9}"#;
        let raw: RawNotification = serde_json::from_str(json).unwrap();
        assert_eq!(raw.kind, NotificationKind::Delete);
        assert!(raw.backends.is_empty());
        assert_eq!(raw.epoch, Some(9));
    }

    #[test]
    fn test_unrecognized_kind_still_decodes() {
        let raw: RawNotification =
            serde_json::from_str(r#"{"kind":"resync","service_key":"10.96.0.1"}"#).unwrap();
        assert_eq!(raw.kind, NotificationKind::Unknown);

        let raw: RawNotification = serde_json::from_str(r#"{"service_key":"10.96.0.1"}"#).unwrap();
        assert_eq!(raw.kind, NotificationKind::Unknown);
    }

    #[tokio::test]
    async fn test_channel_source_subscribes_once() {
        let source = ChannelEventSource::new(4);
        let mut rx = source.subscribe().await.unwrap();
        assert!(matches!(source.subscribe().await, Err(SourceError::Closed)));

        source
            .sender()
            .send(RawNotification::new(NotificationKind::Add, "10.96.0.1", &["10.0.0.1"]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().backends, vec!["10.0.0.1"]);
    }
}
