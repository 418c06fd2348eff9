//! MITM Core Library
//!
//! TLS-intercepting proxy engine: scope filtering, rule-based rewriting,
//! plugin hooks, manual hijack of in-flight traffic and flow recording.

pub mod admin;
pub mod ca;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod flow;
pub mod hijack;
pub mod hooks;
pub mod packet;
pub mod pipeline;
pub mod replacer;
pub mod session;
pub mod store;
pub mod transport;
pub mod unit;

pub use admin::Metrics;
pub use ca::CertificateAuthority;
pub use config::{EngineSettings, SessionConfig, TlsMode};
pub use error::{MitmError, PacketError, StoreError};
pub use events::{EventSender, NotificationKind, SessionEvent};
pub use filter::{FilterData, FilterManager};
pub use flow::{FlowRecord, FlowRecorder, FlowStore, MemoryFlowStore};
pub use hijack::{ControlAction, ControlMessage, HijackTaskRegistry};
pub use hooks::{HookDispatcher, Plugin, PluginCatalog, PluginLoader};
pub use pipeline::InterceptEngine;
pub use replacer::{ContentReplacer, ReplaceRule};
pub use session::{run_session, SessionCommand, SessionDeps, SessionRegistry};
pub use store::{FileKvStore, KvStore, MemoryKvStore};
pub use transport::{ProxyServer, UpstreamConnector};

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, MitmError>;
