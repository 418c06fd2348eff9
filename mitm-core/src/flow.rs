//! Flow records and their persistence contract.

use crate::admin::Metrics;
use crate::error::StoreError;
use crate::events::{EventSender, SessionEvent};
use crate::packet::{self, serde_packet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowColor {
    Red,
    Green,
    Blue,
    Yellow,
    Orange,
    Purple,
    Cyan,
    Grey,
}

pub const TAG_MANUAL_HIJACK: &str = "[manual-hijack]";
pub const TAG_MANUAL_MODIFIED: &str = "[manual-modified]";
pub const TAG_RESPONSE_DROPPED: &str = "[response-dropped]";
pub const TAG_DROPPED: &str = "[dropped]";

/// One stored request/response exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Assigned by the store
    pub id: u64,
    pub hash: String,
    /// Secondary key, perturbed when the content hash collides
    pub hidden_index: String,
    pub source: String,
    pub is_https: bool,
    pub url: String,
    pub method: String,
    pub status_code: u16,
    #[serde(with = "serde_packet")]
    pub request: Vec<u8>,
    #[serde(with = "serde_packet")]
    pub response: Vec<u8>,
    /// Original request when the stored one was modified
    #[serde(with = "serde_packet")]
    pub bare_request: Vec<u8>,
    #[serde(with = "serde_packet")]
    pub bare_response: Vec<u8>,
    pub remote_addr: Option<String>,
    pub tags: Vec<String>,
    pub color: Option<FlowColor>,
    pub is_websocket: bool,
    pub websocket_hash: String,
    pub request_modified: bool,
    pub response_modified: bool,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl FlowRecord {
    pub fn new(url: &str, is_https: bool) -> Self {
        Self {
            id: 0,
            hash: String::new(),
            hidden_index: String::new(),
            source: "mitm".to_string(),
            is_https,
            url: url.to_string(),
            method: String::new(),
            status_code: 0,
            request: Vec::new(),
            response: Vec::new(),
            bare_request: Vec::new(),
            bare_response: Vec::new(),
            remote_addr: None,
            tags: Vec::new(),
            color: None,
            is_websocket: false,
            websocket_hash: String::new(),
            request_modified: false,
            response_modified: false,
            created_at: Utc::now(),
            duration_ms: 0,
        }
    }

    /// Content identity used for deduplication. Identical exchanges collide
    /// until `hidden_index` tells them apart.
    pub fn calc_hash(&self) -> String {
        let mut material = Vec::with_capacity(self.request.len() + self.url.len() + 64);
        material.push(u8::from(self.is_https));
        material.push(0);
        material.extend_from_slice(self.url.as_bytes());
        material.push(0);
        material.extend_from_slice(&self.request);
        material.push(0);
        material.extend_from_slice(self.hidden_index.as_bytes());
        packet::sha256_hex(&material)
    }

    pub fn add_tags(&mut self, tags: &[String]) {
        for tag in tags {
            if !tag.is_empty() && !self.tags.contains(tag) {
                self.tags.push(tag.clone());
            }
        }
    }

    pub fn mark(&mut self, tag: &str, color: FlowColor) {
        self.add_tags(&[tag.to_string()]);
        self.color = Some(color);
    }

    /// Keeps only the header section of packets larger than `limit`.
    pub fn truncate_to(&mut self, limit: usize) {
        for data in [
            &mut self.request,
            &mut self.response,
            &mut self.bare_request,
            &mut self.bare_response,
        ] {
            if data.len() > limit {
                let header_len = packet::split_header_body(data).0.len();
                data.truncate(header_len);
            }
        }
    }
}

/// One stored websocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketFrameRecord {
    pub websocket_hash: String,
    pub frame_index: u64,
    pub from_server: bool,
    #[serde(with = "serde_packet")]
    pub data: Vec<u8>,
    pub tags: Vec<String>,
    pub color: Option<FlowColor>,
}

/// Storage backend for flow records.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Inserts a flow; `Conflict` when its hash is already stored.
    async fn insert_flow(&self, flow: &FlowRecord) -> Result<u64, StoreError>;

    async fn insert_websocket_frame(&self, frame: &WebsocketFrameRecord) -> Result<(), StoreError>;

    async fn get(&self, id: u64) -> Option<FlowRecord>;

    async fn count(&self) -> usize;

    async fn find_by_url(&self, needle: &str) -> Vec<FlowRecord>;
}

#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    by_hash: DashMap<String, u64>,
    flows: DashMap<u64, FlowRecord>,
    frames: DashMap<(String, u64), WebsocketFrameRecord>,
    next_id: AtomicU64,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames_for(&self, websocket_hash: &str) -> Vec<WebsocketFrameRecord> {
        let mut frames: Vec<_> = self
            .frames
            .iter()
            .filter(|entry| entry.key().0 == websocket_hash)
            .map(|entry| entry.value().clone())
            .collect();
        frames.sort_by_key(|f| f.frame_index);
        frames
    }

    pub fn all(&self) -> Vec<FlowRecord> {
        let mut flows: Vec<_> = self.flows.iter().map(|e| e.value().clone()).collect();
        flows.sort_by_key(|f| f.id);
        flows
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn insert_flow(&self, flow: &FlowRecord) -> Result<u64, StoreError> {
        match self.by_hash.entry(flow.hash.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(flow.hash.clone())),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                slot.insert(id);
                let mut stored = flow.clone();
                stored.id = id;
                self.flows.insert(id, stored);
                Ok(id)
            }
        }
    }

    async fn insert_websocket_frame(&self, frame: &WebsocketFrameRecord) -> Result<(), StoreError> {
        let key = (frame.websocket_hash.clone(), frame.frame_index);
        match self.frames.entry(key) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "{}#{}",
                frame.websocket_hash, frame.frame_index
            ))),
            Entry::Vacant(slot) => {
                slot.insert(frame.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: u64) -> Option<FlowRecord> {
        self.flows.get(&id).map(|f| f.value().clone())
    }

    async fn count(&self) -> usize {
        self.flows.len()
    }

    async fn find_by_url(&self, needle: &str) -> Vec<FlowRecord> {
        let mut flows: Vec<_> = self
            .flows
            .iter()
            .filter(|f| f.value().url.contains(needle))
            .map(|f| f.value().clone())
            .collect();
        flows.sort_by_key(|f| f.id);
        flows
    }
}

/// Persists flows without ever failing the traffic path.
pub struct FlowRecorder {
    store: Arc<dyn FlowStore>,
    attempts: u32,
    jitter: Duration,
    packet_limit: usize,
    events: EventSender,
    metrics: Option<Arc<Metrics>>,
}

impl FlowRecorder {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self {
            store,
            attempts: 3,
            jitter: Duration::from_millis(300),
            packet_limit: crate::config::DEFAULT_PACKET_LIMIT,
            events: EventSender::disabled(),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, attempts: u32, jitter: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.jitter = jitter;
        self
    }

    pub fn with_packet_limit(mut self, limit: usize) -> Self {
        self.packet_limit = limit;
        self
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    fn jitter_delay(&self) -> Duration {
        let max = self.jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Stores `flow`. Hash conflicts are retried with jitter and a fresh
    /// secondary key; any other store error drops the record at once.
    ///
    /// On exhaustion the flow is dropped with a warning and the last error
    /// returned; callers on the traffic path ignore it.
    pub async fn save(&self, mut flow: FlowRecord) -> Result<u64, StoreError> {
        flow.truncate_to(self.packet_limit);
        let mut last_error = StoreError::Backend("no attempt made".to_string());

        for attempt in 1..=self.attempts {
            flow.hash = flow.calc_hash();
            match self.store.insert_flow(&flow).await {
                Ok(id) => {
                    debug!(id, url = %flow.url, attempt, "Flow saved");
                    if let Some(metrics) = &self.metrics {
                        metrics.flows_saved.fetch_add(1, Ordering::Relaxed);
                    }
                    self.events.emit(SessionEvent::FlowSaved {
                        flow_id: id,
                        hash: flow.hash.clone(),
                        url: flow.url.clone(),
                    });
                    return Ok(id);
                }
                Err(e @ StoreError::Conflict(_)) => {
                    debug!(url = %flow.url, attempt, "Flow hash conflict: {}", e);
                    last_error = e;
                    if attempt < self.attempts {
                        tokio::time::sleep(self.jitter_delay()).await;
                        flow.hidden_index = uuid::Uuid::new_v4().to_string();
                    }
                }
                Err(e) => {
                    last_error = e;
                    break;
                }
            }
        }

        warn!(url = %flow.url, attempts = self.attempts, "Dropping flow record: {}", last_error);
        if let Some(metrics) = &self.metrics {
            metrics.flows_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(last_error)
    }

    pub async fn save_websocket_frame(&self, frame: WebsocketFrameRecord) {
        if let Err(e) = self.store.insert_websocket_frame(&frame).await {
            warn!(
                websocket = %frame.websocket_hash,
                index = frame.frame_index,
                "Dropping websocket frame record: {}",
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    /// Fails the first `failures` inserts, with a conflict unless `broken`
    struct FlakyStore {
        inner: MemoryFlowStore,
        failures: AtomicU32,
        broken: bool,
        seen_hidden: parking_lot::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FlowStore for FlakyStore {
        async fn insert_flow(&self, flow: &FlowRecord) -> Result<u64, StoreError> {
            self.seen_hidden.lock().push(flow.hidden_index.clone());
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                if self.broken {
                    return Err(StoreError::Backend("disk full".to_string()));
                }
                return Err(StoreError::Conflict(flow.hash.clone()));
            }
            self.inner.insert_flow(flow).await
        }

        async fn insert_websocket_frame(&self, frame: &WebsocketFrameRecord) -> Result<(), StoreError> {
            self.inner.insert_websocket_frame(frame).await
        }

        async fn get(&self, id: u64) -> Option<FlowRecord> {
            self.inner.get(id).await
        }

        async fn count(&self) -> usize {
            self.inner.count().await
        }

        async fn find_by_url(&self, needle: &str) -> Vec<FlowRecord> {
            self.inner.find_by_url(needle).await
        }
    }

    fn flaky(failures: u32) -> Arc<FlakyStore> {
        failing(failures, false)
    }

    fn failing(failures: u32, broken: bool) -> Arc<FlakyStore> {
        Arc::new(FlakyStore {
            inner: MemoryFlowStore::new(),
            failures: AtomicU32::new(failures),
            broken,
            seen_hidden: parking_lot::Mutex::new(Vec::new()),
        })
    }

    fn sample() -> FlowRecord {
        let mut flow = FlowRecord::new("http://a.com/x", false);
        flow.method = "GET".to_string();
        flow.request = b"GET /x HTTP/1.1\r\nHost: a.com\r\n\r\n".to_vec();
        flow
    }

    #[tokio::test]
    async fn test_duplicate_hash_conflicts() {
        let store = MemoryFlowStore::new();
        let mut flow = sample();
        flow.hash = flow.calc_hash();
        assert!(store.insert_flow(&flow).await.is_ok());
        assert!(matches!(store.insert_flow(&flow).await, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_retry_perturbs_secondary_key() {
        let store = flaky(2);
        let recorder = FlowRecorder::new(store.clone()).with_retry(3, Duration::from_millis(5));

        let id = recorder.save(sample()).await.unwrap();
        assert_eq!(store.count().await, 1);
        assert!(store.get(id).await.is_some());

        let seen = store.seen_hidden.lock().clone();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], "");
        assert_ne!(seen[1], seen[2]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_drop_the_record() {
        let store = flaky(10);
        let metrics = Arc::new(Metrics::default());
        let recorder = FlowRecorder::new(store.clone())
            .with_retry(3, Duration::ZERO)
            .with_metrics(metrics.clone());

        assert!(recorder.save(sample()).await.is_err());
        assert_eq!(store.count().await, 0);
        assert_eq!(metrics.flows_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_backend_error_is_not_retried() {
        let store = failing(10, true);
        let metrics = Arc::new(Metrics::default());
        let recorder = FlowRecorder::new(store.clone())
            .with_retry(3, Duration::ZERO)
            .with_metrics(metrics.clone());

        assert!(matches!(recorder.save(sample()).await, Err(StoreError::Backend(_))));
        assert_eq!(store.seen_hidden.lock().len(), 1);
        assert_eq!(metrics.flows_dropped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_hash_ignores_capture_time() {
        let first = sample();
        let mut later = sample();
        later.created_at = first.created_at + chrono::Duration::seconds(5);
        later.response = b"HTTP/1.1 500 Internal Server Error\r\n\r\n".to_vec();
        assert_eq!(first.calc_hash(), later.calc_hash());

        later.hidden_index = "other".to_string();
        assert_ne!(first.calc_hash(), later.calc_hash());
        let mut https = sample();
        https.is_https = true;
        assert_ne!(first.calc_hash(), https.calc_hash());
    }

    #[tokio::test]
    async fn test_identical_exchanges_are_both_stored() {
        let store = Arc::new(MemoryFlowStore::new());
        let recorder = FlowRecorder::new(store.clone()).with_retry(3, Duration::from_millis(1));
        let a = recorder.save(sample()).await.unwrap();
        let b = recorder.save(sample()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(store.count().await, 2);
        assert_ne!(store.get(a).await.unwrap().hash, store.get(b).await.unwrap().hash);
    }

    #[tokio::test]
    async fn test_oversized_packets_keep_header_only() {
        let store = Arc::new(MemoryFlowStore::new());
        let recorder = FlowRecorder::new(store.clone()).with_packet_limit(40);
        let mut flow = sample();
        flow.response = b"HTTP/1.1 200 OK\r\nA: b\r\n\r\n0123456789012345678901234567890123456789".to_vec();

        let id = recorder.save(flow).await.unwrap();
        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.response, b"HTTP/1.1 200 OK\r\nA: b\r\n\r\n".to_vec());
        assert_eq!(stored.request, sample().request);
    }

    #[tokio::test]
    async fn test_flow_saved_event() {
        let (events, mut rx) = EventSender::channel(4);
        let recorder = FlowRecorder::new(Arc::new(MemoryFlowStore::new())).with_events(events);
        let id = recorder.save(sample()).await.unwrap();
        match rx.recv().await {
            Some(SessionEvent::FlowSaved { flow_id, url, .. }) => {
                assert_eq!(flow_id, id);
                assert_eq!(url, "http://a.com/x");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_tags_are_unique() {
        let mut flow = sample();
        flow.mark(TAG_DROPPED, FlowColor::Purple);
        flow.mark(TAG_DROPPED, FlowColor::Purple);
        assert_eq!(flow.tags, vec![TAG_DROPPED.to_string()]);
        assert_eq!(flow.color, Some(FlowColor::Purple));
    }
}
