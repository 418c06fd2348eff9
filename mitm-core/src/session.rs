//! One interception session: a config/command stream in, an event stream out.

use crate::admin::{start_admin_server, AdminState, Metrics};
use crate::ca::CertificateAuthority;
use crate::config::{SessionConfig, TlsMode};
use crate::error::MitmError;
use crate::events::{EventSender, NotificationKind, SessionEvent};
use crate::filter::{FilterData, FilterManager};
use crate::flow::{FlowRecorder, FlowStore, MemoryFlowStore};
use crate::hijack::{ControlMessage, HijackTaskRegistry};
use crate::hooks::{HookDispatcher, PluginCatalog, PluginLoader};
use crate::pipeline::InterceptEngine;
use crate::replacer::{self, ContentReplacer, ReplaceRule};
use crate::store::{FileKvStore, KvStore, MemoryKvStore, FILTER_DATA_KEY, HIJACK_FILTER_DATA_KEY};
use crate::transport::server::{resolve_listen_addr, ProxyServer};
use crate::transport::{DownstreamRouter, GmTlsConnector, ProxyRoute, UpstreamConnector};
use crate::Result;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Inbound session messages. The first one must be `Start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionCommand {
    Start(SessionConfig),
    UpdateFilter {
        filter: FilterData,
    },
    ResetFilter,
    UpdateHijackFilter {
        filter: FilterData,
    },
    SetReplacers {
        rules: Vec<ReplaceRule>,
    },
    /// `true` switches manual hijack off
    SetAutoForward {
        auto_forward: bool,
    },
    ManualHijackControl(ControlMessage),
    RecoverManualHijack,
    SetDownstreamProxy {
        proxy: String,
        #[serde(default)]
        routes: Vec<ProxyRoute>,
    },
    UpdateFilterWebsocket {
        filter_websocket: bool,
    },
    LoadPlugins {
        names: Vec<String>,
        #[serde(default)]
        params: HashMap<String, String>,
    },
    RemoveHooks {
        names: Vec<String>,
    },
    GetCurrentHooks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub listen_addr: String,
    pub started_at: DateTime<Utc>,
}

/// Live sessions, for cross-session introspection.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionSummary>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a session until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, listen_addr: &str) -> SessionGuard {
        let summary = SessionSummary {
            id: uuid::Uuid::new_v4().to_string(),
            listen_addr: listen_addr.to_string(),
            started_at: Utc::now(),
        };
        let id = summary.id.clone();
        self.sessions.insert(id.clone(), summary);
        SessionGuard {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn list(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<_> = self.sessions.iter().map(|s| s.value().clone()).collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

pub struct SessionGuard {
    id: String,
    registry: Weak<SessionRegistry>,
}

impl SessionGuard {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.sessions.remove(&self.id);
        }
    }
}

/// Collaborators supplied by the embedding program.
pub struct SessionDeps {
    /// Defaults to files under `data_dir`, or memory when unset
    pub kv_store: Option<Arc<dyn KvStore>>,
    pub flow_store: Arc<dyn FlowStore>,
    pub plugins: Arc<dyn PluginLoader>,
    pub sessions: Arc<SessionRegistry>,
    pub gm: Option<Arc<dyn GmTlsConnector>>,
    /// Defaults to the CA under `data_dir`, or an ephemeral one
    pub ca: Option<CertificateAuthority>,
}

impl Default for SessionDeps {
    fn default() -> Self {
        Self {
            kv_store: None,
            flow_store: Arc::new(MemoryFlowStore::new()),
            plugins: Arc::new(PluginCatalog::new()),
            sessions: SessionRegistry::new(),
            gm: None,
            ca: None,
        }
    }
}

struct Session {
    config: SessionConfig,
    engine: Arc<InterceptEngine>,
    router: Arc<DownstreamRouter>,
    plugins: Arc<dyn PluginLoader>,
    events: EventSender,
}

/// Runs a session until the command stream ends.
///
/// Configuration problems end the session before it listens, with a single
/// `ConfigError` notification followed by `Exit`.
pub async fn run_session(
    mut commands: mpsc::Receiver<SessionCommand>,
    events: EventSender,
    deps: SessionDeps,
) -> Result<()> {
    let config = match commands.recv().await {
        Some(SessionCommand::Start(config)) => config,
        Some(other) => {
            let err = MitmError::Configuration(format!(
                "first session message must be start, got {}",
                command_name(&other)
            ));
            return fail(&events, err).await;
        }
        None => return Ok(()),
    };
    if let Err(e) = check_config(&config, &deps) {
        return fail(&events, e).await;
    }

    let sessions = deps.sessions.clone();
    let (session, addr, server) = match Session::build(config, events.clone(), deps).await {
        Ok(built) => built,
        Err(e) => return fail(&events, e).await,
    };
    let listen_addr = addr.to_string();
    let _guard = sessions.register(&listen_addr);
    let cancel = session.engine.cancel_token().clone();

    session.emit_snapshots();
    events.emit(SessionEvent::ManualHijackStatus {
        enabled: session.engine.registry().can_register(),
    });

    let shutdown = cancel.clone();
    let mut proxy = tokio::spawn(server.run(async move { shutdown.cancelled().await }));
    info!("Session listening on {}", listen_addr);
    events.emit(SessionEvent::Started {
        listen_addr: listen_addr.clone(),
    });

    if let Some(port) = session.config.admin_port {
        let state = AdminState {
            metrics: session.engine.metrics().clone(),
            registry: session.engine.registry().clone(),
            sessions: sessions.clone(),
        };
        let admin_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = start_admin_server(port, state) => {
                    if let Err(e) = result {
                        error!("Admin server failed: {}", e);
                    }
                }
                _ = admin_cancel.cancelled() => {}
            }
        });
    }

    if !session.config.plugins.is_empty() {
        session.load_plugins(session.config.plugins.clone(), session.config.plugin_params.clone());
    }

    let mut exit_reason = None;
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(command) => session.handle(command),
                None => {
                    info!("Command stream closed, stopping session");
                    break;
                }
            },
            result = &mut proxy => {
                let reason = match result {
                    Ok(Ok(())) => "listener stopped".to_string(),
                    Ok(Err(e)) => e.to_string(),
                    Err(e) => format!("listener task failed: {}", e),
                };
                error!("Proxy exited: {}", reason);
                exit_reason = Some(reason);
                break;
            }
        }
    }

    cancel.cancel();
    session.engine.registry().set_can_register(false);
    if !proxy.is_finished() {
        if tokio::time::timeout(Duration::from_secs(5), &mut proxy).await.is_err() {
            warn!("Listener did not stop in time");
            proxy.abort();
        }
    }
    events
        .emit_reliable(SessionEvent::Exit {
            reason: exit_reason.clone(),
        })
        .await;
    match exit_reason {
        Some(reason) => Err(MitmError::Network(reason)),
        None => Ok(()),
    }
}

async fn fail(events: &EventSender, err: MitmError) -> Result<()> {
    error!("Session failed to start: {}", err);
    events
        .emit_reliable(SessionEvent::notification(NotificationKind::ConfigError, err.to_string()))
        .await;
    events
        .emit_reliable(SessionEvent::Exit {
            reason: Some(err.to_string()),
        })
        .await;
    Err(err)
}

fn check_config(config: &SessionConfig, deps: &SessionDeps) -> Result<()> {
    config.validate()?;
    if let TlsMode::Gm { only: true, .. } = config.tls.mode {
        if deps.gm.is_none() {
            return Err(MitmError::Configuration(
                "GM-only TLS mode requires a GM connector".to_string(),
            ));
        }
    }
    Ok(())
}

fn command_name(command: &SessionCommand) -> &'static str {
    match command {
        SessionCommand::Start(_) => "start",
        SessionCommand::UpdateFilter { .. } => "update_filter",
        SessionCommand::ResetFilter => "reset_filter",
        SessionCommand::UpdateHijackFilter { .. } => "update_hijack_filter",
        SessionCommand::SetReplacers { .. } => "set_replacers",
        SessionCommand::SetAutoForward { .. } => "set_auto_forward",
        SessionCommand::ManualHijackControl(_) => "manual_hijack_control",
        SessionCommand::RecoverManualHijack => "recover_manual_hijack",
        SessionCommand::SetDownstreamProxy { .. } => "set_downstream_proxy",
        SessionCommand::UpdateFilterWebsocket { .. } => "update_filter_websocket",
        SessionCommand::LoadPlugins { .. } => "load_plugins",
        SessionCommand::RemoveHooks { .. } => "remove_hooks",
        SessionCommand::GetCurrentHooks => "get_current_hooks",
    }
}

impl Session {
    async fn build(
        config: SessionConfig,
        events: EventSender,
        deps: SessionDeps,
    ) -> Result<(Self, SocketAddr, ProxyServer)> {
        let metrics = Arc::new(Metrics::default());
        let kv: Arc<dyn KvStore> = match (deps.kv_store, &config.data_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileKvStore::new(&dir.join("state"))?),
            (None, None) => Arc::new(MemoryKvStore::new()),
        };
        let engine_settings = &config.engine;

        let filter = FilterManager::load(kv.clone(), FILTER_DATA_KEY, FilterData::default_rules);
        let hijack_filter = FilterManager::load(kv.clone(), HIJACK_FILTER_DATA_KEY, FilterData::default);
        let replacer = ContentReplacer::new(replacer::load_rules(kv.as_ref()))
            .with_store(kv.clone())
            .with_events(events.clone())
            .with_metrics(metrics.clone())
            .with_slow_threshold(engine_settings.slow_rule_threshold());
        let hooks = HookDispatcher::new(engine_settings.hook_concurrency, engine_settings.hook_timeout())
            .with_events(events.clone())
            .with_metrics(metrics.clone());
        let recorder = FlowRecorder::new(deps.flow_store)
            .with_retry(
                engine_settings.flow_save_attempts,
                Duration::from_millis(engine_settings.flow_retry_jitter_ms),
            )
            .with_packet_limit(config.packet_limit)
            .with_events(events.clone())
            .with_metrics(metrics.clone());

        let engine = InterceptEngine::new(
            Arc::new(filter),
            Arc::new(hijack_filter),
            Arc::new(replacer),
            HijackTaskRegistry::new(config.enable_manual_hijack),
            Arc::new(hooks),
            Arc::new(recorder),
        )
        .with_events(events.clone())
        .with_metrics(metrics)
        .with_cancel(CancellationToken::new());
        engine.set_filter_websocket(config.filter_websocket);
        let engine = Arc::new(engine);

        let router = Arc::new(DownstreamRouter::new(&config.downstream_proxy, &config.proxy_routes)?);
        let mut connector = UpstreamConnector::new(&config, router.clone())?;
        if let Some(gm) = deps.gm {
            connector = connector.with_gm(gm);
        }
        let ca = match (deps.ca, &config.data_dir) {
            (Some(ca), _) => ca,
            (None, Some(dir)) => CertificateAuthority::new(dir)?,
            (None, None) => CertificateAuthority::ephemeral()?,
        };
        let addr = resolve_listen_addr(&config.listen_addr()).await?;
        let server = ProxyServer::new(addr, ca, connector, engine.clone(), config.packet_limit);

        Ok((
            Self {
                config,
                engine,
                router,
                plugins: deps.plugins,
                events,
            },
            addr,
            server,
        ))
    }

    fn emit_snapshots(&self) {
        self.emit_filter_snapshot();
        self.events.emit(SessionEvent::ReplacerSnapshot {
            rules: self.engine.replacer().rules(),
        });
    }

    fn emit_filter_snapshot(&self) {
        self.events.emit(SessionEvent::FilterSnapshot {
            filter: self.engine.filter().data(),
            hijack_filter: self.engine.hijack_filter().data(),
        });
    }

    fn emit_hooks(&self) {
        self.events.emit(SessionEvent::CurrentHooks {
            hooks: self.engine.hooks().hooks(),
        });
    }

    fn load_plugins(&self, names: Vec<String>, params: HashMap<String, String>) {
        let hooks = self.engine.hooks().clone();
        let loader = self.plugins.clone();
        let events = self.events.clone();
        let timeout = self.config.engine.plugin_load_timeout();
        tokio::spawn(async move {
            hooks.load_plugins(loader, &names, &params, timeout).await;
            events.emit(SessionEvent::CurrentHooks { hooks: hooks.hooks() });
        });
    }

    fn handle(&self, command: SessionCommand) {
        debug!(command = command_name(&command), "Session command");
        match command {
            SessionCommand::Start(_) => warn!("Session already started, ignoring start"),
            SessionCommand::UpdateFilter { filter } => {
                self.engine.filter().update(filter);
                self.emit_filter_snapshot();
            }
            SessionCommand::ResetFilter => {
                self.engine.filter().recover();
                self.emit_filter_snapshot();
            }
            SessionCommand::UpdateHijackFilter { filter } => {
                self.engine.hijack_filter().update(filter);
                self.emit_filter_snapshot();
            }
            SessionCommand::SetReplacers { rules } => {
                self.engine.replacer().set_rules(rules);
                self.events.emit(SessionEvent::ReplacerSnapshot {
                    rules: self.engine.replacer().rules(),
                });
            }
            SessionCommand::SetAutoForward { auto_forward } => {
                self.engine.set_manual_hijack(!auto_forward);
            }
            SessionCommand::ManualHijackControl(msg) => {
                let task_id = msg.task_id.clone();
                if !self.engine.registry().unicast(msg) {
                    debug!(%task_id, "Control message for unknown task ignored");
                }
            }
            SessionCommand::RecoverManualHijack => self.engine.recover_hijack_list(),
            SessionCommand::SetDownstreamProxy { proxy, routes } => {
                if let Err(e) = self.router.set(&proxy, &routes) {
                    warn!("Rejected downstream proxy update: {}", e);
                    self.events.notify(NotificationKind::ConfigError, e.to_string());
                }
            }
            SessionCommand::UpdateFilterWebsocket { filter_websocket } => {
                self.engine.set_filter_websocket(filter_websocket);
            }
            SessionCommand::LoadPlugins { names, params } => self.load_plugins(names, params),
            SessionCommand::RemoveHooks { names } => {
                let removed = self.engine.hooks().remove(&names);
                info!("Removed {} plugins", removed);
                self.emit_hooks();
            }
            SessionCommand::GetCurrentHooks => self.emit_hooks(),
        }
    }
}
