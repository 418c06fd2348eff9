//! Manual hijack task registry.
//!
//! Every paused request, response or websocket frame owns one [`HijackTask`].
//! Controllers address tasks by id; each task has a private bounded channel
//! and exactly one consumer, the pipeline task holding the traffic. Dropping
//! a `HijackTask` unregisters it and announces the deletion, so a cancelled
//! exchange never leaks a slot or leaves a stale entry with controllers.

use crate::events::{EventSender, HijackListAction, SessionEvent};
use crate::packet::serde_packet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Room for a recover notice plus the real decision.
const CONTROL_BUFFER: usize = 2;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HijackStatus {
    #[default]
    HijackingRequest,
    WaitingForResponse,
    HijackingResponse,
    HijackingWebsocket,
}

/// View state of a task as shown to controllers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HijackInfo {
    pub task_id: String,
    pub status: HijackStatus,
    pub is_https: bool,
    pub url: String,
    pub method: String,
    pub remote_addr: Option<String>,
    #[serde(with = "serde_packet")]
    pub request: Vec<u8>,
    #[serde(with = "serde_packet")]
    pub response: Vec<u8>,
    pub is_websocket: bool,
    #[serde(with = "serde_packet")]
    pub payload: Vec<u8>,
    pub websocket_encode: Vec<String>,
    pub tags: Vec<String>,
    pub hijack_response: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "packet", rename_all = "snake_case")]
pub enum ControlAction {
    /// Continue with the original bytes
    Forward,
    Drop,
    /// Continue with these bytes instead
    SendPacket(#[serde(with = "serde_packet")] Vec<u8>),
    /// Pause the response of this exchange as well
    HijackResponse,
    CancelHijackResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub task_id: String,
    pub action: ControlAction,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ControlMessage {
    pub fn new(task_id: impl Into<String>, action: ControlAction) -> Self {
        Self {
            task_id: task_id.into(),
            action,
            tags: Vec::new(),
        }
    }
}

/// What the consumer should do with the paused unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Forward,
    Drop,
    Modified(Vec<u8>),
}

struct TaskSlot {
    seq: u64,
    info: HijackInfo,
    sender: mpsc::Sender<ControlMessage>,
}

#[derive(Default)]
struct RegistryState {
    can_register: bool,
    tasks: HashMap<String, TaskSlot>,
}

#[derive(Default)]
pub struct HijackTaskRegistry {
    state: Mutex<RegistryState>,
    seq: AtomicU64,
}

impl HijackTaskRegistry {
    pub fn new(enabled: bool) -> Arc<Self> {
        let registry = Arc::new(Self::default());
        registry.state.lock().can_register = enabled;
        registry
    }

    pub fn can_register(&self) -> bool {
        self.state.lock().can_register
    }

    /// Switches manual mode. Disabling forwards and then purges every
    /// pending task, which closes their channels and releases the paused
    /// traffic.
    pub fn set_can_register(&self, enabled: bool) -> usize {
        self.state.lock().can_register = enabled;
        if enabled {
            return 0;
        }
        self.broadcast(ControlMessage::new("", ControlAction::Forward));
        let purged: Vec<TaskSlot> = self.state.lock().tasks.drain().map(|(_, slot)| slot).collect();
        if !purged.is_empty() {
            info!("Manual hijack disabled, released {} pending tasks", purged.len());
        }
        purged.len()
    }

    /// Registers a task, or `None` when manual mode is off.
    pub fn register(self: &Arc<Self>, mut info: HijackInfo) -> Option<HijackTask> {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(CONTROL_BUFFER);
        info.task_id = id.clone();
        {
            let mut state = self.state.lock();
            if !state.can_register {
                return None;
            }
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            state.tasks.insert(id.clone(), TaskSlot { seq, info, sender });
        }
        debug!(task_id = %id, "Hijack task registered");
        Some(HijackTask {
            id,
            receiver,
            registry: Arc::downgrade(self),
            events: EventSender::disabled(),
        })
    }

    /// Removes a task. Returns whether it was still registered.
    pub fn unregister(&self, task_id: &str) -> bool {
        self.take(task_id).is_some()
    }

    fn take(&self, task_id: &str) -> Option<HijackInfo> {
        let removed = self.state.lock().tasks.remove(task_id)?;
        debug!(task_id, "Hijack task unregistered");
        Some(removed.info)
    }

    /// Delivers a control message to its task. Unknown ids are ignored.
    pub fn unicast(&self, msg: ControlMessage) -> bool {
        let sender = {
            let state = self.state.lock();
            match state.tasks.get(&msg.task_id) {
                Some(slot) => slot.sender.clone(),
                None => {
                    debug!(task_id = %msg.task_id, "Control message for unknown task ignored");
                    return false;
                }
            }
        };
        deliver(&sender, msg)
    }

    /// Sends a copy of `msg` to every pending task.
    pub fn broadcast(&self, msg: ControlMessage) -> usize {
        let targets: Vec<(String, mpsc::Sender<ControlMessage>)> = {
            let state = self.state.lock();
            state
                .tasks
                .iter()
                .map(|(id, slot)| (id.clone(), slot.sender.clone()))
                .collect()
        };
        targets
            .into_iter()
            .filter(|(id, sender)| {
                let mut copy = msg.clone();
                copy.task_id = id.clone();
                deliver(sender, copy)
            })
            .count()
    }

    pub fn update_info(&self, task_id: &str, update: impl FnOnce(&mut HijackInfo)) -> Option<HijackInfo> {
        let mut state = self.state.lock();
        let slot = state.tasks.get_mut(task_id)?;
        update(&mut slot.info);
        Some(slot.info.clone())
    }

    pub fn get_info(&self, task_id: &str) -> Option<HijackInfo> {
        self.state.lock().tasks.get(task_id).map(|s| s.info.clone())
    }

    /// Pending tasks in registration order.
    pub fn list(&self) -> Vec<HijackInfo> {
        let state = self.state.lock();
        let mut slots: Vec<&TaskSlot> = state.tasks.values().collect();
        slots.sort_by_key(|s| s.seq);
        slots.into_iter().map(|s| s.info.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn deliver(sender: &mpsc::Sender<ControlMessage>, msg: ControlMessage) -> bool {
    match sender.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            warn!(task_id = %msg.task_id, "Control buffer full, message dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(msg)) => {
            debug!(task_id = %msg.task_id, "Task already resolved");
            false
        }
    }
}

/// Consumer side of a registered task.
pub struct HijackTask {
    id: String,
    receiver: mpsc::Receiver<ControlMessage>,
    registry: Weak<HijackTaskRegistry>,
    events: EventSender,
}

impl std::fmt::Debug for HijackTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HijackTask").field("id", &self.id).finish()
    }
}

impl HijackTask {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Announces the task's deletion on this stream when it is dropped.
    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    /// Waits for the next control message.
    ///
    /// `None` means cancelled, purged or unregistered; the caller forwards
    /// the unit unchanged.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<ControlMessage> {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(task_id = %self.id, "Hijack wait cancelled");
                None
            }
            msg = self.receiver.recv() => msg,
        }
    }

    pub fn update_info(&self, update: impl FnOnce(&mut HijackInfo)) -> Option<HijackInfo> {
        self.registry.upgrade()?.update_info(&self.id, update)
    }

    pub fn info(&self) -> Option<HijackInfo> {
        self.registry.upgrade()?.get_info(&self.id)
    }

    /// Whether the registry still knows this task.
    pub fn is_registered(&self) -> bool {
        self.registry
            .upgrade()
            .map_or(false, |registry| registry.get_info(&self.id).is_some())
    }
}

impl Drop for HijackTask {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // Purged tasks are covered by the reload that follows the purge
        if let Some(info) = registry.take(&self.id) {
            self.events.emit(SessionEvent::HijackList {
                action: HijackListAction::Delete,
                tasks: vec![info],
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_requires_manual_mode() {
        let registry = HijackTaskRegistry::new(false);
        assert!(registry.register(HijackInfo::default()).is_none());
        registry.set_can_register(true);
        let task = registry.register(HijackInfo::default()).unwrap();
        assert_eq!(registry.get_info(task.id()).unwrap().task_id, task.id());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let registry = HijackTaskRegistry::new(true);
        let task = registry.register(HijackInfo::default()).unwrap();
        let id = task.id().to_string();
        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        drop(task);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_unregisters() {
        let registry = HijackTaskRegistry::new(true);
        let task = registry.register(HijackInfo::default()).unwrap();
        assert_eq!(registry.len(), 1);
        drop(task);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_drop_announces_delete_once() {
        let registry = HijackTaskRegistry::new(true);
        let (events, mut rx) = EventSender::channel(8);
        let task = registry
            .register(HijackInfo {
                url: "http://a.com/x".to_string(),
                ..Default::default()
            })
            .unwrap()
            .with_events(events);
        let id = task.id().to_string();
        drop(task);

        match rx.try_recv().unwrap() {
            SessionEvent::HijackList {
                action: HijackListAction::Delete,
                tasks,
            } => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].task_id, id);
                assert_eq!(tasks[0].url, "http://a.com/x");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_purged_task_drop_is_silent() {
        let registry = HijackTaskRegistry::new(true);
        let (events, mut rx) = EventSender::channel(8);
        let task = registry.register(HijackInfo::default()).unwrap().with_events(events);
        registry.set_can_register(false);
        drop(task);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_its_task() {
        let registry = HijackTaskRegistry::new(true);
        let mut a = registry.register(HijackInfo::default()).unwrap();
        let mut b = registry.register(HijackInfo::default()).unwrap();
        let cancel = CancellationToken::new();

        assert!(registry.unicast(ControlMessage::new(a.id(), ControlAction::Drop)));
        let msg = a.next(&cancel).await.unwrap();
        assert_eq!(msg.action, ControlAction::Drop);

        let waited = tokio::time::timeout(Duration::from_millis(50), b.next(&cancel)).await;
        assert!(waited.is_err(), "task b must still be pending");
        assert!(registry.get_info(b.id()).is_some());
    }

    #[tokio::test]
    async fn test_stale_message_is_ignored() {
        let registry = HijackTaskRegistry::new(true);
        let task = registry.register(HijackInfo::default()).unwrap();
        let id = task.id().to_string();
        drop(task);
        assert!(!registry.unicast(ControlMessage::new(id, ControlAction::Forward)));
    }

    #[tokio::test]
    async fn test_full_buffer_does_not_block() {
        let registry = HijackTaskRegistry::new(true);
        let task = registry.register(HijackInfo::default()).unwrap();
        for _ in 0..CONTROL_BUFFER {
            assert!(registry.unicast(ControlMessage::new(task.id(), ControlAction::Forward)));
        }
        assert!(!registry.unicast(ControlMessage::new(task.id(), ControlAction::Forward)));
    }

    #[tokio::test]
    async fn test_disable_closes_channels() {
        let registry = HijackTaskRegistry::new(true);
        let mut a = registry.register(HijackInfo::default()).unwrap();
        let mut b = registry.register(HijackInfo::default()).unwrap();
        let cancel = CancellationToken::new();

        assert_eq!(registry.set_can_register(false), 2);
        assert!(registry.is_empty());
        for task in [&mut a, &mut b] {
            let id = task.id().to_string();
            let msg = task.next(&cancel).await.unwrap();
            assert_eq!(msg, ControlMessage::new(id, ControlAction::Forward));
            assert!(task.next(&cancel).await.is_none());
        }
        assert!(!a.is_registered());
    }

    #[tokio::test]
    async fn test_cancel_releases_wait() {
        let registry = HijackTaskRegistry::new(true);
        let mut task = registry.register(HijackInfo::default()).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let msg = tokio::time::timeout(Duration::from_secs(1), task.next(&cancel)).await.unwrap();
        assert!(msg.is_none());
        drop(task);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_list_is_in_registration_order() {
        let registry = HijackTaskRegistry::new(true);
        let tasks: Vec<_> = (0..5)
            .map(|i| {
                registry
                    .register(HijackInfo {
                        url: format!("http://a/{}", i),
                        ..Default::default()
                    })
                    .unwrap()
            })
            .collect();
        let urls: Vec<_> = registry.list().into_iter().map(|i| i.url).collect();
        assert_eq!(urls, (0..5).map(|i| format!("http://a/{}", i)).collect::<Vec<_>>());
        drop(tasks);
    }

    #[tokio::test]
    async fn test_broadcast_rewrites_task_id() {
        let registry = HijackTaskRegistry::new(true);
        let mut a = registry.register(HijackInfo::default()).unwrap();
        let mut b = registry.register(HijackInfo::default()).unwrap();
        let cancel = CancellationToken::new();
        assert_eq!(registry.broadcast(ControlMessage::new("", ControlAction::Forward)), 2);
        assert_eq!(a.next(&cancel).await.unwrap().task_id, a.id());
        assert_eq!(b.next(&cancel).await.unwrap().task_id, b.id());
    }

    #[test]
    fn test_control_message_json() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"task_id":"t1","action":{"kind":"send_packet","packet":"GET / HTTP/1.1\r\n\r\n"}}"#,
        )
        .unwrap();
        assert_eq!(msg.action, ControlAction::SendPacket(b"GET / HTTP/1.1\r\n\r\n".to_vec()));
        let forward: ControlMessage = serde_json::from_str(r#"{"task_id":"t1","action":{"kind":"forward"}}"#).unwrap();
        assert_eq!(forward.action, ControlAction::Forward);
    }
}
