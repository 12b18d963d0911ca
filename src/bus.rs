//! Publication bus
//!
//! Alerts and fused snapshots leave the partitions through one bus. Every
//! subscriber gets its own bounded queue so a slow consumer only ever loses
//! its own items; the publisher never waits. The bus also keeps two read
//! models for queries: a bounded alert log and the latest fused value per
//! (user, metric).

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::warn;

use crate::config::{OverflowPolicy, PulseConfig};
use crate::types::{Alert, FusedMetric, Metric, Severity};

/// One item on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Publication {
    Alert(Alert),
    Fused(FusedMetric),
}

#[derive(Debug)]
struct SubscriberQueue {
    id: u64,
    items: Mutex<VecDeque<Publication>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn push(&self, publication: Publication) {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    subscriber = self.id,
                    policy = ?self.policy,
                    dropped,
                    "subscriber queue full"
                );
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        items.pop_front();
                    }
                    OverflowPolicy::DropNewest => return,
                }
            }
            items.push_back(publication);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

/// Receiving end of one subscription
#[derive(Debug)]
pub struct Subscriber {
    queue: Arc<SubscriberQueue>,
}

impl Subscriber {
    /// Wait for the next item; `None` once the bus is closed and drained
    pub async fn recv(&self) -> Option<Publication> {
        loop {
            if let Some(item) = self.queue.items.lock().pop_front() {
                return Some(item);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&self) -> Option<Publication> {
        self.queue.items.lock().pop_front()
    }

    /// Drain everything currently queued
    pub fn drain(&self) -> Vec<Publication> {
        self.queue.items.lock().drain(..).collect()
    }

    /// Items lost to overflow so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Filter for [`AlertLog::query`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertQuery {
    pub user_id: Option<String>,
    pub pattern_id: Option<String>,
    pub min_severity: Option<Severity>,
    /// Only alerts whose `end_time` is at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl AlertQuery {
    fn matches(&self, alert: &Alert) -> bool {
        self.user_id.as_deref().map_or(true, |u| alert.user_id == u)
            && self.pattern_id.as_deref().map_or(true, |p| alert.pattern_id == p)
            && self.min_severity.map_or(true, |s| alert.severity >= s)
            && self.since.map_or(true, |t| alert.end_time >= t)
    }
}

/// Append-only alert history holding the most recent `capacity` alerts
#[derive(Debug)]
pub struct AlertLog {
    entries: RwLock<VecDeque<Alert>>,
    capacity: usize,
    total: AtomicU64,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    pub fn append(&self, alert: Alert) {
        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(alert);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// The newest `n` alerts, oldest first
    pub fn recent(&self, n: usize) -> Vec<Alert> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    /// Retained alerts matching `query`, oldest first
    pub fn query(&self, query: &AlertQuery) -> Vec<Alert> {
        let entries = self.entries.read();
        let mut matched: Vec<Alert> = entries
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Alerts appended since creation, including those no longer retained
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Latest fused snapshot per (user, metric)
#[derive(Debug, Default)]
pub struct FusedView {
    users: DashMap<String, BTreeMap<Metric, FusedMetric>>,
}

impl FusedView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, fused: FusedMetric) {
        self.users
            .entry(fused.user_id.clone())
            .or_default()
            .insert(fused.metric, fused);
    }

    pub fn get(&self, user_id: &str, metric: Metric) -> Option<FusedMetric> {
        self.users
            .get(user_id)
            .and_then(|metrics| metrics.get(&metric).cloned())
    }

    pub fn for_user(&self, user_id: &str) -> Vec<FusedMetric> {
        self.users
            .get(user_id)
            .map(|metrics| metrics.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshots not updated within `stale_after` of `now`, by user then metric
    pub fn stale(&self, now: DateTime<Utc>, stale_after: Duration) -> Vec<FusedMetric> {
        let mut stale: Vec<FusedMetric> = self
            .users
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .values()
                    .filter(|f| f.is_stale(now, stale_after))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        stale.sort_by(|a, b| a.user_id.cmp(&b.user_id).then(a.metric.cmp(&b.metric)));
        stale
    }

    pub fn remove_user(&self, user_id: &str) -> bool {
        self.users.remove(user_id).is_some()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

#[derive(Debug)]
struct BusInner {
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
    next_id: AtomicU64,
    capacity: usize,
    policy: OverflowPolicy,
    closed: AtomicBool,
    alerts: AlertLog,
    fused: FusedView,
}

/// Fan-out of alerts and fused snapshots
#[derive(Debug, Clone)]
pub struct PublicationBus {
    inner: Arc<BusInner>,
}

impl PublicationBus {
    pub fn new(subscriber_capacity: usize, policy: OverflowPolicy, alert_log_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                capacity: subscriber_capacity.max(1),
                policy,
                closed: AtomicBool::new(false),
                alerts: AlertLog::new(alert_log_capacity),
                fused: FusedView::new(),
            }),
        }
    }

    pub fn from_config(config: &PulseConfig) -> Self {
        Self::new(
            config.subscriber_queue_capacity,
            config.overflow_policy,
            config.alert_log_capacity,
        )
    }

    /// Register a new subscriber; it sees items published from now on
    pub fn subscribe(&self) -> Subscriber {
        let queue = Arc::new(SubscriberQueue {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: self.inner.capacity,
            policy: self.inner.policy,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(self.inner.closed.load(Ordering::Acquire)),
        });
        self.inner.subscribers.lock().push(Arc::downgrade(&queue));
        Subscriber { queue }
    }

    /// Record and fan out one item without blocking
    pub fn publish(&self, publication: Publication) {
        match &publication {
            Publication::Alert(alert) => self.inner.alerts.append(alert.clone()),
            Publication::Fused(fused) => self.inner.fused.update(fused.clone()),
        }

        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(publication.clone());
                true
            }
            None => false,
        });
    }

    pub fn publish_alert(&self, alert: Alert) {
        self.publish(Publication::Alert(alert));
    }

    pub fn publish_fused(&self, fused: FusedMetric) {
        self.publish(Publication::Fused(fused));
    }

    /// Wake every subscriber; `recv` returns `None` once its queue is drained
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for queue in self.inner.subscribers.lock().iter().filter_map(Weak::upgrade) {
            queue.close();
        }
    }

    pub fn alerts(&self) -> &AlertLog {
        &self.inner.alerts
    }

    pub fn fused(&self) -> &FusedView {
        &self.inner.fused
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl Default for PublicationBus {
    fn default() -> Self {
        Self::from_config(&PulseConfig::default())
    }
}
