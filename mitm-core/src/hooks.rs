//! Plugin hook dispatch.
//!
//! Hooks are grouped by class into traits. A [`Plugin`] bundles whichever
//! classes it implements under one name. Every invocation runs on its own
//! task behind a shared semaphore with a timeout, so a slow, failing or
//! panicking hook costs only its own contribution.

use crate::admin::Metrics;
use crate::events::{EventSender, NotificationKind, SessionEvent};
use crate::flow::FlowRecord;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wildmatch::WildMatch;

#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub is_https: bool,
    pub url: String,
    pub remote_addr: Option<String>,
}

/// What a hook wants done with the packet it was shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookVerdict {
    Keep,
    Replace(Vec<u8>),
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveFlowVerdict {
    Keep,
    Replace(FlowRecord),
    /// Do not store this flow
    Drop,
}

/// Final bytes of an exchange, handed to mirror hooks.
#[derive(Debug, Clone)]
pub struct MirrorFlow {
    pub request: Bytes,
    pub response: Bytes,
    pub is_websocket: bool,
}

#[async_trait]
pub trait RequestHook: Send + Sync {
    /// Observe or rewrite the request before anything else sees it.
    async fn before_request(&self, _ctx: &HookContext, _request: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn hijack_request(&self, _ctx: &HookContext, _request: &[u8]) -> anyhow::Result<HookVerdict> {
        Ok(HookVerdict::Keep)
    }
}

#[async_trait]
pub trait MockHook: Send + Sync {
    /// A synthetic response short-circuits the upstream round trip.
    async fn mock_request(&self, ctx: &HookContext, request: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
}

#[async_trait]
pub trait ResponseHook: Send + Sync {
    async fn hijack_response(&self, _ctx: &HookContext, _response: &[u8]) -> anyhow::Result<HookVerdict> {
        Ok(HookVerdict::Keep)
    }

    async fn hijack_response_ex(
        &self,
        _ctx: &HookContext,
        _request: &[u8],
        _response: &[u8],
    ) -> anyhow::Result<HookVerdict> {
        Ok(HookVerdict::Keep)
    }

    async fn after_request(
        &self,
        _ctx: &HookContext,
        _request: &[u8],
        _response: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

#[async_trait]
pub trait MirrorHook: Send + Sync {
    async fn mirror(&self, ctx: &HookContext, flow: &MirrorFlow) -> anyhow::Result<()>;
}

#[async_trait]
pub trait SaveFlowHook: Send + Sync {
    async fn hijack_save_flow(&self, ctx: &HookContext, flow: &FlowRecord) -> anyhow::Result<SaveFlowVerdict>;
}

/// A named bundle of hook implementations.
#[derive(Clone, Default)]
pub struct Plugin {
    pub name: String,
    pub request: Option<Arc<dyn RequestHook>>,
    pub mock: Option<Arc<dyn MockHook>>,
    pub response: Option<Arc<dyn ResponseHook>>,
    pub mirror: Option<Arc<dyn MirrorHook>>,
    pub save_flow: Option<Arc<dyn SaveFlowHook>>,
}

impl Plugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_request(mut self, hook: impl RequestHook + 'static) -> Self {
        self.request = Some(Arc::new(hook));
        self
    }

    pub fn with_mock(mut self, hook: impl MockHook + 'static) -> Self {
        self.mock = Some(Arc::new(hook));
        self
    }

    pub fn with_response(mut self, hook: impl ResponseHook + 'static) -> Self {
        self.response = Some(Arc::new(hook));
        self
    }

    pub fn with_mirror(mut self, hook: impl MirrorHook + 'static) -> Self {
        self.mirror = Some(Arc::new(hook));
        self
    }

    pub fn with_save_flow(mut self, hook: impl SaveFlowHook + 'static) -> Self {
        self.save_flow = Some(Arc::new(hook));
        self
    }

    fn classes(&self) -> Vec<String> {
        let mut classes = Vec::new();
        if self.request.is_some() {
            classes.push("before_request".to_string());
            classes.push("hijack_request".to_string());
        }
        if self.mock.is_some() {
            classes.push("mock_request".to_string());
        }
        if self.response.is_some() {
            classes.push("hijack_response".to_string());
            classes.push("hijack_response_ex".to_string());
            classes.push("after_request".to_string());
        }
        if self.mirror.is_some() {
            classes.push("mirror".to_string());
        }
        if self.save_flow.is_some() {
            classes.push("hijack_save_flow".to_string());
        }
        classes
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name)
            .field("classes", &self.classes())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInfo {
    pub plugin: String,
    pub hooks: Vec<String>,
}

/// Resolves plugin names into loaded plugins.
#[async_trait]
pub trait PluginLoader: Send + Sync {
    async fn load(&self, name: &str, params: &HashMap<String, String>) -> anyhow::Result<Plugin>;
}

type PluginFactory = Arc<dyn Fn(&HashMap<String, String>) -> anyhow::Result<Plugin> + Send + Sync>;

/// Registry of natively implemented plugins.
#[derive(Clone, Default)]
pub struct PluginCatalog {
    factories: HashMap<String, PluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&HashMap<String, String>) -> anyhow::Result<Plugin> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl PluginLoader for PluginCatalog {
    async fn load(&self, name: &str, params: &HashMap<String, String>) -> anyhow::Result<Plugin> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("unknown plugin {}", name))?;
        let mut plugin = factory(params)?;
        plugin.name = name.to_string();
        Ok(plugin)
    }
}

/// Answers requests whose URL matches a wildcard pattern with a canned response.
#[derive(Debug, Clone)]
pub struct MockResponder {
    routes: Vec<(WildMatch, Vec<u8>)>,
}

impl MockResponder {
    pub fn new() -> Self {
        Self { routes: Vec::new() }
    }

    pub fn route(mut self, url_pattern: &str, response: impl Into<Vec<u8>>) -> Self {
        self.routes.push((WildMatch::new(url_pattern), response.into()));
        self
    }
}

impl Default for MockResponder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MockHook for MockResponder {
    async fn mock_request(&self, ctx: &HookContext, _request: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self
            .routes
            .iter()
            .find(|(pattern, _)| pattern.matches(&ctx.url))
            .map(|(_, response)| response.clone()))
    }
}

/// Ordered, bounded, timeout-guarded hook invocation.
pub struct HookDispatcher {
    plugins: RwLock<Arc<Vec<Plugin>>>,
    semaphore: Arc<Semaphore>,
    call_timeout: Duration,
    events: EventSender,
    metrics: Option<Arc<Metrics>>,
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self::new(20, Duration::from_secs(30))
    }
}

impl HookDispatcher {
    pub fn new(concurrency: usize, call_timeout: Duration) -> Self {
        Self {
            plugins: RwLock::new(Arc::new(Vec::new())),
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            call_timeout,
            events: EventSender::disabled(),
            metrics: None,
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn snapshot(&self) -> Arc<Vec<Plugin>> {
        self.plugins.read().clone()
    }

    /// Adds a plugin, replacing one with the same name in place.
    pub fn register(&self, plugin: Plugin) {
        let mut guard = self.plugins.write();
        let mut plugins = guard.as_ref().clone();
        match plugins.iter_mut().find(|p| p.name == plugin.name) {
            Some(existing) => *existing = plugin,
            None => plugins.push(plugin),
        }
        *guard = Arc::new(plugins);
    }

    pub fn remove(&self, names: &[String]) -> usize {
        let mut guard = self.plugins.write();
        let before = guard.len();
        let plugins: Vec<Plugin> = guard
            .iter()
            .filter(|p| !names.contains(&p.name))
            .cloned()
            .collect();
        let removed = before - plugins.len();
        *guard = Arc::new(plugins);
        removed
    }

    pub fn hooks(&self) -> Vec<HookInfo> {
        self.snapshot()
            .iter()
            .map(|p| HookInfo {
                plugin: p.name.clone(),
                hooks: p.classes(),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    /// Free invocation slots.
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Loads plugins concurrently and registers the ones that succeed, in
    /// the order they were requested.
    pub async fn load_plugins(
        &self,
        loader: Arc<dyn PluginLoader>,
        names: &[String],
        params: &HashMap<String, String>,
        load_timeout: Duration,
    ) -> (usize, usize) {
        if names.is_empty() {
            return (0, 0);
        }
        self.events.emit(SessionEvent::PluginLoading { loading: true });

        let loads = names.iter().map(|name| {
            let loader = loader.clone();
            async move {
                let result = tokio::time::timeout(load_timeout, loader.load(name, params)).await;
                (name.clone(), result)
            }
        });
        let results = futures::future::join_all(loads).await;

        let mut loaded = 0;
        let mut failed = 0;
        for (name, result) in results {
            match result {
                Ok(Ok(plugin)) => {
                    info!(plugin = %name, "Plugin loaded");
                    self.register(plugin);
                    loaded += 1;
                }
                Ok(Err(e)) => {
                    failed += 1;
                    warn!(plugin = %name, "Plugin failed to load: {:#}", e);
                    self.events.notify(
                        NotificationKind::PluginLoadFailure,
                        format!("plugin {} failed to load: {}", name, e),
                    );
                }
                Err(_) => {
                    failed += 1;
                    warn!(plugin = %name, "Plugin load timed out");
                    self.events.notify(
                        NotificationKind::PluginLoadFailure,
                        format!("plugin {} timed out after {:?}", name, load_timeout),
                    );
                }
            }
        }

        self.events.notify(
            NotificationKind::Info,
            format!("loaded {} plugins, {} failed", loaded, failed),
        );
        self.events.emit(SessionEvent::PluginLoading { loading: false });
        (loaded, failed)
    }

    fn record_failure(&self, plugin: &str, hook: &str, reason: String) {
        if let Some(metrics) = &self.metrics {
            metrics.hook_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.events.notify(
            NotificationKind::HookFailure,
            format!("{}.{}: {}", plugin, hook, reason),
        );
    }

    /// Runs one hook call on its own task.
    ///
    /// Waits for a semaphore slot, then for the call, racing both against
    /// `cancel`. Errors, panics, timeouts and cancellation all yield `None`.
    async fn invoke<T, Fut>(
        &self,
        plugin: &str,
        hook: &'static str,
        cancel: &CancellationToken,
        call: Fut,
    ) -> Option<T>
    where
        T: Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok()?,
        };
        let call_timeout = self.call_timeout;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            tokio::time::timeout(call_timeout, call).await
        });
        let abort = handle.abort_handle();

        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                abort.abort();
                debug!(plugin, hook, "Hook call cancelled");
                return None;
            }
            joined = handle => joined,
        };

        match joined {
            Ok(Ok(Ok(value))) => Some(value),
            Ok(Ok(Err(e))) => {
                warn!(plugin, hook, "Hook failed: {:#}", e);
                self.record_failure(plugin, hook, e.to_string());
                None
            }
            Ok(Err(_)) => {
                warn!(plugin, hook, timeout = ?call_timeout, "Hook timed out");
                if let Some(metrics) = &self.metrics {
                    metrics.hook_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                self.record_failure(plugin, hook, "timed out".to_string());
                None
            }
            Err(e) if e.is_panic() => {
                warn!(plugin, hook, "Hook panicked");
                self.record_failure(plugin, hook, "panicked".to_string());
                None
            }
            Err(_) => None,
        }
    }

    /// Every plugin may rewrite the request in turn.
    pub async fn before_request(&self, ctx: &HookContext, request: Vec<u8>, cancel: &CancellationToken) -> Vec<u8> {
        let mut current = request;
        for plugin in self.snapshot().iter() {
            let Some(hook) = plugin.request.clone() else { continue };
            let ctx = ctx.clone();
            let data = current.clone();
            let call = async move { hook.before_request(&ctx, &data).await };
            if let Some(Some(rewritten)) = self.invoke(&plugin.name, "before_request", cancel, call).await {
                current = rewritten;
            }
        }
        current
    }

    /// First synthetic response wins.
    pub async fn mock_request(&self, ctx: &HookContext, request: &[u8], cancel: &CancellationToken) -> Option<Vec<u8>> {
        for plugin in self.snapshot().iter() {
            let Some(hook) = plugin.mock.clone() else { continue };
            let hook_ctx = ctx.clone();
            let data = request.to_vec();
            let call = async move { hook.mock_request(&hook_ctx, &data).await };
            if let Some(Some(response)) = self.invoke(&plugin.name, "mock_request", cancel, call).await {
                debug!(plugin = %plugin.name, url = %ctx.url, "Request mocked");
                return Some(response);
            }
        }
        None
    }

    pub async fn hijack_request(&self, ctx: &HookContext, request: &[u8], cancel: &CancellationToken) -> HookVerdict {
        let mut current = request.to_vec();
        let mut changed = false;
        for plugin in self.snapshot().iter() {
            let Some(hook) = plugin.request.clone() else { continue };
            let hook_ctx = ctx.clone();
            let data = current.clone();
            let call = async move { hook.hijack_request(&hook_ctx, &data).await };
            match self.invoke(&plugin.name, "hijack_request", cancel, call).await {
                Some(HookVerdict::Drop) => {
                    info!(plugin = %plugin.name, url = %ctx.url, "Request dropped by hook");
                    return HookVerdict::Drop;
                }
                Some(HookVerdict::Replace(data)) => {
                    current = data;
                    changed = true;
                }
                _ => {}
            }
        }
        if changed {
            HookVerdict::Replace(current)
        } else {
            HookVerdict::Keep
        }
    }

    /// Legacy hooks first, then the extended ones, each seeing the current bytes.
    pub async fn hijack_response(
        &self,
        ctx: &HookContext,
        request: &[u8],
        response: &[u8],
        cancel: &CancellationToken,
    ) -> HookVerdict {
        let plugins = self.snapshot();
        let mut current = response.to_vec();
        let mut changed = false;

        for plugin in plugins.iter() {
            let Some(hook) = plugin.response.clone() else { continue };
            let hook_ctx = ctx.clone();
            let data = current.clone();
            let call = async move { hook.hijack_response(&hook_ctx, &data).await };
            match self.invoke(&plugin.name, "hijack_response", cancel, call).await {
                Some(HookVerdict::Drop) => return HookVerdict::Drop,
                Some(HookVerdict::Replace(data)) => {
                    current = data;
                    changed = true;
                }
                _ => {}
            }
        }

        let request = request.to_vec();
        for plugin in plugins.iter() {
            let Some(hook) = plugin.response.clone() else { continue };
            let hook_ctx = ctx.clone();
            let req = request.clone();
            let data = current.clone();
            let call = async move { hook.hijack_response_ex(&hook_ctx, &req, &data).await };
            match self.invoke(&plugin.name, "hijack_response_ex", cancel, call).await {
                Some(HookVerdict::Drop) => return HookVerdict::Drop,
                Some(HookVerdict::Replace(data)) => {
                    current = data;
                    changed = true;
                }
                _ => {}
            }
        }

        if changed {
            HookVerdict::Replace(current)
        } else {
            HookVerdict::Keep
        }
    }

    pub async fn after_request(
        &self,
        ctx: &HookContext,
        request: &[u8],
        response: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Vec<u8> {
        let mut current = response;
        let request = request.to_vec();
        for plugin in self.snapshot().iter() {
            let Some(hook) = plugin.response.clone() else { continue };
            let ctx = ctx.clone();
            let req = request.clone();
            let data = current.clone();
            let call = async move { hook.after_request(&ctx, &req, &data).await };
            if let Some(Some(rewritten)) = self.invoke(&plugin.name, "after_request", cancel, call).await {
                current = rewritten;
            }
        }
        current
    }

    /// Fire-and-forget; never waits for the hooks.
    pub fn mirror(self: &Arc<Self>, ctx: HookContext, flow: MirrorFlow, cancel: CancellationToken) {
        let plugins = self.snapshot();
        if plugins.iter().all(|p| p.mirror.is_none()) {
            return;
        }
        let dispatcher = self.clone();
        tokio::spawn(async move {
            for plugin in plugins.iter() {
                let Some(hook) = plugin.mirror.clone() else { continue };
                let ctx = ctx.clone();
                let flow = flow.clone();
                let call = async move { hook.mirror(&ctx, &flow).await };
                dispatcher.invoke(&plugin.name, "mirror", &cancel, call).await;
            }
        });
    }

    /// `None` means a hook asked for the flow not to be stored.
    pub async fn hijack_save_flow(
        &self,
        ctx: &HookContext,
        flow: FlowRecord,
        cancel: &CancellationToken,
    ) -> Option<FlowRecord> {
        let mut current = flow;
        for plugin in self.snapshot().iter() {
            let Some(hook) = plugin.save_flow.clone() else { continue };
            let ctx = ctx.clone();
            let snapshot = current.clone();
            let call = async move { hook.hijack_save_flow(&ctx, &snapshot).await };
            match self.invoke(&plugin.name, "hijack_save_flow", cancel, call).await {
                Some(SaveFlowVerdict::Drop) => {
                    debug!(plugin = %plugin.name, url = %current.url, "Flow storage skipped by hook");
                    return None;
                }
                Some(SaveFlowVerdict::Replace(flow)) => current = flow,
                _ => {}
            }
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Upper;

    #[async_trait]
    impl RequestHook for Upper {
        async fn before_request(&self, _ctx: &HookContext, request: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            Ok(Some(request.to_ascii_uppercase()))
        }
    }

    struct Failing;

    #[async_trait]
    impl RequestHook for Failing {
        async fn before_request(&self, _ctx: &HookContext, _request: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
            anyhow::bail!("boom")
        }

        async fn hijack_request(&self, _ctx: &HookContext, _request: &[u8]) -> anyhow::Result<HookVerdict> {
            panic!("hook panicked")
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl RequestHook for Slow {
        async fn hijack_request(&self, _ctx: &HookContext, _request: &[u8]) -> anyhow::Result<HookVerdict> {
            tokio::time::sleep(self.0).await;
            Ok(HookVerdict::Drop)
        }
    }

    struct Suffix(&'static str);

    #[async_trait]
    impl ResponseHook for Suffix {
        async fn hijack_response(&self, _ctx: &HookContext, response: &[u8]) -> anyhow::Result<HookVerdict> {
            let mut data = response.to_vec();
            data.extend_from_slice(self.0.as_bytes());
            Ok(HookVerdict::Replace(data))
        }

        async fn hijack_response_ex(
            &self,
            _ctx: &HookContext,
            _request: &[u8],
            response: &[u8],
        ) -> anyhow::Result<HookVerdict> {
            let mut data = response.to_vec();
            data.extend_from_slice(b"+ex");
            Ok(HookVerdict::Replace(data))
        }
    }

    struct Counter(Arc<AtomicUsize>);

    #[async_trait]
    impl MirrorHook for Counter {
        async fn mirror(&self, _ctx: &HookContext, _flow: &MirrorFlow) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct SkipStorage;

    #[async_trait]
    impl SaveFlowHook for SkipStorage {
        async fn hijack_save_flow(&self, _ctx: &HookContext, _flow: &FlowRecord) -> anyhow::Result<SaveFlowVerdict> {
            Ok(SaveFlowVerdict::Drop)
        }
    }

    fn ctx() -> HookContext {
        HookContext {
            is_https: true,
            url: "https://example.com/a".to_string(),
            remote_addr: None,
        }
    }

    #[tokio::test]
    async fn test_failing_hook_is_a_noop() {
        let metrics = Arc::new(Metrics::default());
        let dispatcher = HookDispatcher::default().with_metrics(metrics.clone());
        dispatcher.register(Plugin::new("failing").with_request(Failing));
        dispatcher.register(Plugin::new("upper").with_request(Upper));
        let cancel = CancellationToken::new();

        let out = dispatcher.before_request(&ctx(), b"get /".to_vec(), &cancel).await;
        assert_eq!(out, b"GET /".to_vec());

        let verdict = dispatcher.hijack_request(&ctx(), b"get /", &cancel).await;
        assert_eq!(verdict, HookVerdict::Keep);
        assert_eq!(metrics.hook_failures.load(Ordering::Relaxed), 2);
        assert_eq!(dispatcher.available_permits(), 20);
    }

    #[tokio::test]
    async fn test_timeout_is_a_noop() {
        let dispatcher = HookDispatcher::new(2, Duration::from_millis(30));
        dispatcher.register(Plugin::new("slow").with_request(Slow(Duration::from_secs(5))));
        let verdict = dispatcher
            .hijack_request(&ctx(), b"GET /", &CancellationToken::new())
            .await;
        assert_eq!(verdict, HookVerdict::Keep);
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let dispatcher = Arc::new(HookDispatcher::new(1, Duration::from_secs(30)));
        dispatcher.register(Plugin::new("slow").with_request(Slow(Duration::from_secs(30))));
        let cancel = CancellationToken::new();

        let running = {
            let dispatcher = dispatcher.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatcher.hijack_request(&ctx(), b"GET /", &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.available_permits(), 0);

        cancel.cancel();
        assert_eq!(running.await.unwrap(), HookVerdict::Keep);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(dispatcher.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_ex_sees_legacy_output() {
        let dispatcher = HookDispatcher::default();
        dispatcher.register(Plugin::new("suffix").with_response(Suffix("+legacy")));
        let verdict = dispatcher
            .hijack_response(&ctx(), b"req", b"rsp", &CancellationToken::new())
            .await;
        assert_eq!(verdict, HookVerdict::Replace(b"rsp+legacy+ex".to_vec()));
    }

    #[tokio::test]
    async fn test_mock_short_circuits() {
        let dispatcher = HookDispatcher::default();
        dispatcher.register(
            Plugin::new("mock").with_mock(MockResponder::new().route("https://example.com/*", "HTTP/1.1 200 OK\r\n\r\nmocked")),
        );
        let cancel = CancellationToken::new();
        let mocked = dispatcher.mock_request(&ctx(), b"GET /a", &cancel).await;
        assert_eq!(mocked.as_deref(), Some(&b"HTTP/1.1 200 OK\r\n\r\nmocked"[..]));

        let other = HookContext {
            url: "https://other.com/".to_string(),
            ..ctx()
        };
        assert!(dispatcher.mock_request(&other, b"GET /", &cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_mirror_does_not_block() {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(HookDispatcher::default());
        dispatcher.register(Plugin::new("mirror").with_mirror(Counter(count.clone())));
        dispatcher.mirror(
            ctx(),
            MirrorFlow {
                request: Bytes::from_static(b"req"),
                response: Bytes::from_static(b"rsp"),
                is_websocket: false,
            },
            CancellationToken::new(),
        );
        for _ in 0..50 {
            if count.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_save_flow_drop_and_registry_ops() {
        let dispatcher = HookDispatcher::default();
        dispatcher.register(Plugin::new("skip").with_save_flow(SkipStorage));
        dispatcher.register(Plugin::new("upper").with_request(Upper));
        let flow = FlowRecord::new("https://example.com/a", true);
        assert!(dispatcher
            .hijack_save_flow(&ctx(), flow.clone(), &CancellationToken::new())
            .await
            .is_none());

        let hooks = dispatcher.hooks();
        assert_eq!(hooks.len(), 2);
        assert_eq!(hooks[0].hooks, vec!["hijack_save_flow"]);
        assert_eq!(dispatcher.remove(&["skip".to_string()]), 1);
        assert!(dispatcher
            .hijack_save_flow(&ctx(), flow, &CancellationToken::new())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_catalog_loading_reports_failures() {
        let mut catalog = PluginCatalog::new();
        catalog.register("upper", |_| Ok(Plugin::new("ignored").with_request(Upper)));
        catalog.register("broken", |_| anyhow::bail!("syntax error"));
        let (events, mut rx) = EventSender::channel(16);
        let dispatcher = HookDispatcher::default().with_events(events);

        let names = vec!["upper".to_string(), "broken".to_string(), "missing".to_string()];
        let (loaded, failed) = dispatcher
            .load_plugins(Arc::new(catalog), &names, &HashMap::new(), Duration::from_secs(1))
            .await;
        assert_eq!((loaded, failed), (1, 2));
        assert_eq!(dispatcher.hooks()[0].plugin, "upper");

        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::Notification { kind: NotificationKind::PluginLoadFailure, .. } = event {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }
}
