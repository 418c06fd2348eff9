//! Outbound session events.

use crate::filter::FilterData;
use crate::hijack::HijackInfo;
use crate::hooks::HookInfo;
use crate::replacer::ReplaceRule;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HijackListAction {
    Add,
    Update,
    Delete,
    Reload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    SlowRule,
    PluginLoadFailure,
    HookFailure,
    TlsFailure,
    ConfigError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Started {
        listen_addr: String,
    },
    FilterSnapshot {
        filter: FilterData,
        hijack_filter: FilterData,
    },
    ReplacerSnapshot {
        rules: Vec<ReplaceRule>,
    },
    HijackList {
        action: HijackListAction,
        tasks: Vec<HijackInfo>,
    },
    ManualHijackStatus {
        enabled: bool,
    },
    Notification {
        kind: NotificationKind,
        content: String,
    },
    PluginLoading {
        loading: bool,
    },
    CurrentHooks {
        hooks: Vec<HookInfo>,
    },
    FlowSaved {
        flow_id: u64,
        hash: String,
        url: String,
    },
    /// Terminal event; nothing follows it
    Exit {
        reason: Option<String>,
    },
}

impl SessionEvent {
    pub fn notification(kind: NotificationKind, content: impl Into<String>) -> Self {
        SessionEvent::Notification {
            kind,
            content: content.into(),
        }
    }
}

/// Non-blocking handle to the outbound event stream.
///
/// A slow or gone consumer never stalls the traffic path: events that do not
/// fit are logged and dropped.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<SessionEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sender that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SessionEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!("Event stream full, dropping {:?}", event_name(&event));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Event stream closed");
            }
        }
    }

    pub fn notify(&self, kind: NotificationKind, content: impl Into<String>) {
        self.emit(SessionEvent::notification(kind, content));
    }

    /// Waits for room; only used for terminal events.
    pub async fn emit_reliable(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}

fn event_name(event: &SessionEvent) -> &'static str {
    match event {
        SessionEvent::Started { .. } => "started",
        SessionEvent::FilterSnapshot { .. } => "filter_snapshot",
        SessionEvent::ReplacerSnapshot { .. } => "replacer_snapshot",
        SessionEvent::HijackList { .. } => "hijack_list",
        SessionEvent::ManualHijackStatus { .. } => "manual_hijack_status",
        SessionEvent::Notification { .. } => "notification",
        SessionEvent::PluginLoading { .. } => "plugin_loading",
        SessionEvent::CurrentHooks { .. } => "current_hooks",
        SessionEvent::FlowSaved { .. } => "flow_saved",
        SessionEvent::Exit { .. } => "exit",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (events, mut rx) = EventSender::channel(1);
        events.notify(NotificationKind::Info, "first");
        events.notify(NotificationKind::Info, "second");

        match rx.recv().await {
            Some(SessionEvent::Notification { content, .. }) => assert_eq!(content, "first"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(SessionEvent::notification(NotificationKind::SlowRule, "x")).unwrap();
        assert_eq!(json["type"], "notification");
        assert_eq!(json["kind"], "slow_rule");
    }
}
