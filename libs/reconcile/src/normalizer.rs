//! Event normalizer: raw notifications to canonical membership events.
//!
//! - `Delete` always means "empty backend set" regardless of payload
//! - Unparseable input is dropped as a whole, never partially applied
//! - Consecutive identical deliveries for a key are collapsed
//!
//! No versions are assigned here; the shadow store owns versioning.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use lifter_addr::{BackendAddress, BackendSet, ServiceKey};
use tracing::debug;

use crate::error::MalformedEvent;
use crate::metrics::Metrics;
use crate::source::{NotificationKind, RawNotification};

/// Canonical desired-state assertion for one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
    pub key: ServiceKey,
    pub backends: BackendSet,
    /// Source ordering token, if any.
    pub epoch: Option<u64>,
}

impl MembershipEvent {
    pub fn new(key: ServiceKey, backends: BackendSet) -> Self {
        Self {
            key,
            backends,
            epoch: None,
        }
    }

    #[must_use]
    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = Some(epoch);
        self
    }
}

/// Validate and canonicalize one raw notification.
pub fn parse_notification(raw: &RawNotification) -> Result<MembershipEvent, MalformedEvent> {
    let key_str = raw
        .service_key
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .ok_or(MalformedEvent::MissingKey)?;
    let key = ServiceKey::parse(key_str).map_err(MalformedEvent::BadKey)?;

    let backends = match raw.kind {
        NotificationKind::Unknown => return Err(MalformedEvent::UnknownKind { key }),
        NotificationKind::Delete => BackendSet::new(),
        NotificationKind::Add | NotificationKind::Update => raw
            .backends
            .iter()
            .map(|b| BackendAddress::parse(b))
            .collect::<Result<BackendSet, _>>()
            .map_err(|source| MalformedEvent::BadBackend { key, source })?,
    };

    Ok(MembershipEvent {
        key,
        backends,
        epoch: raw.epoch,
    })
}

/// Stateful normalizer that also suppresses redundant deliveries.
///
/// Owned by the single task that consumes the subscription.
pub struct Normalizer {
    /// Last forwarded set and the highest epoch forwarded for each key.
    last_forwarded: HashMap<ServiceKey, (BackendSet, Option<u64>)>,
    metrics: Arc<Metrics>,
}

impl Normalizer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            last_forwarded: HashMap::new(),
            metrics,
        }
    }

    /// Seed the dedup memory with state already known to be forwarded.
    pub fn prime(&mut self, event: &MembershipEvent) {
        self.remember(event);
    }

    /// Parse without touching dedup memory. Malformed input is counted and
    /// logged, then dropped.
    pub fn parse(&self, raw: &RawNotification) -> Option<MembershipEvent> {
        match parse_notification(raw) {
            Ok(event) => Some(event),
            Err(e) => {
                self.metrics.record_malformed();
                debug!(
                    error = %e,
                    service_name = raw.service_name.as_deref().unwrap_or(""),
                    kind = ?raw.kind,
                    "dropping malformed notification"
                );
                None
            }
        }
    }

    /// Normalize a delivery. Returns `None` for malformed or redundant input.
    pub fn normalize(&mut self, raw: RawNotification) -> Option<MembershipEvent> {
        let event = self.parse(&raw)?;

        if self.is_redundant(&event) {
            self.metrics.record_duplicate();
            debug!(
                service_key = %event.key,
                backends = %event.backends,
                epoch = ?event.epoch,
                "dropping redundant delivery"
            );
            return None;
        }

        self.remember(&event);
        self.metrics.record_forwarded();
        Some(event)
    }

    /// Drop dedup memory for keys the shadow store no longer tracks.
    /// Returns how many keys were forgotten.
    pub fn forget_absent(&mut self, tracked: &HashSet<ServiceKey>) -> usize {
        let before = self.last_forwarded.len();
        self.last_forwarded.retain(|key, _| tracked.contains(key));
        before - self.last_forwarded.len()
    }

    /// Number of keys with dedup memory.
    pub fn tracked_keys(&self) -> usize {
        self.last_forwarded.len()
    }

    fn is_redundant(&self, event: &MembershipEvent) -> bool {
        let Some((last_set, last_epoch)) = self.last_forwarded.get(&event.key) else {
            return false;
        };

        let newer_epoch = match (event.epoch, *last_epoch) {
            (Some(new), Some(last)) => new > last,
            (Some(_), None) => true,
            (None, _) => false,
        };

        *last_set == event.backends && !newer_epoch
    }

    fn remember(&mut self, event: &MembershipEvent) {
        let epoch = match self.last_forwarded.get(&event.key) {
            Some((_, prev)) => (*prev).max(event.epoch),
            None => event.epoch,
        };
        self.last_forwarded
            .insert(event.key, (event.backends.clone(), epoch));
    }
}
