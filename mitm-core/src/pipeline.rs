//! Per-exchange interception pipeline.
//!
//! Request path: filter, plugin hooks (before, mock, hijack), replacer rules,
//! conditional hijack switch, manual hijack. Response path: MIME filter,
//! plugin hijack hooks, replacer rules, manual hijack, after-request hooks.
//! Completed exchanges are mirrored and recorded off the traffic path.

use crate::admin::Metrics;
use crate::events::{EventSender, HijackListAction, SessionEvent};
use crate::filter::FilterManager;
use crate::flow::{
    FlowColor, FlowRecord, FlowRecorder, WebsocketFrameRecord, TAG_DROPPED, TAG_MANUAL_HIJACK,
    TAG_MANUAL_MODIFIED, TAG_RESPONSE_DROPPED,
};
use crate::hijack::{ControlAction, HijackInfo, HijackStatus, HijackTask, HijackTaskRegistry};
use crate::hooks::{HookContext, HookDispatcher, HookVerdict, MirrorFlow};
use crate::packet;
use crate::replacer::ContentReplacer;
use crate::unit::{Exchange, Modifier};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What the transport does with a request after the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Send these bytes upstream
    Forward(Vec<u8>),
    /// Answer the client with this response, skip upstream
    Respond(Vec<u8>),
    /// Do not forward
    Drop,
}

/// Identity of a websocket connection for frame processing.
#[derive(Debug, Clone)]
pub struct WebsocketSession {
    pub url: String,
    pub is_https: bool,
    pub websocket_hash: String,
    pub remote_addr: Option<String>,
}

#[derive(Debug, Default)]
struct FrameCounter {
    last_index: u64,
    streams: usize,
}

/// Keeps a websocket's frame counter alive while one of its directions is
/// being forwarded.
pub struct WebsocketStreamGuard {
    engine: Arc<InterceptEngine>,
    websocket_hash: String,
}

impl Drop for WebsocketStreamGuard {
    fn drop(&mut self) {
        self.engine.close_websocket_stream(&self.websocket_hash);
    }
}

pub struct InterceptEngine {
    filter: Arc<FilterManager>,
    hijack_filter: Arc<FilterManager>,
    replacer: Arc<ContentReplacer>,
    registry: Arc<HijackTaskRegistry>,
    hooks: Arc<HookDispatcher>,
    recorder: Arc<FlowRecorder>,
    events: EventSender,
    metrics: Arc<Metrics>,
    cancel: CancellationToken,
    filter_websocket: AtomicBool,
    frame_counters: DashMap<String, FrameCounter>,
}

impl InterceptEngine {
    pub fn new(
        filter: Arc<FilterManager>,
        hijack_filter: Arc<FilterManager>,
        replacer: Arc<ContentReplacer>,
        registry: Arc<HijackTaskRegistry>,
        hooks: Arc<HookDispatcher>,
        recorder: Arc<FlowRecorder>,
    ) -> Self {
        Self {
            filter,
            hijack_filter,
            replacer,
            registry,
            hooks,
            recorder,
            events: EventSender::disabled(),
            metrics: Arc::new(Metrics::default()),
            cancel: CancellationToken::new(),
            filter_websocket: AtomicBool::new(false),
            frame_counters: DashMap::new(),
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Session-wide token; cancelling it releases every suspended exchange.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn filter(&self) -> &Arc<FilterManager> {
        &self.filter
    }

    pub fn hijack_filter(&self) -> &Arc<FilterManager> {
        &self.hijack_filter
    }

    pub fn replacer(&self) -> &Arc<ContentReplacer> {
        &self.replacer
    }

    pub fn registry(&self) -> &Arc<HijackTaskRegistry> {
        &self.registry
    }

    pub fn hooks(&self) -> &Arc<HookDispatcher> {
        &self.hooks
    }

    pub fn recorder(&self) -> &Arc<FlowRecorder> {
        &self.recorder
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn set_filter_websocket(&self, enabled: bool) {
        self.filter_websocket.store(enabled, Ordering::Relaxed);
    }

    pub fn filter_websocket(&self) -> bool {
        self.filter_websocket.load(Ordering::Relaxed)
    }

    /// Switches manual hijack mode and announces the new state.
    pub fn set_manual_hijack(&self, enabled: bool) {
        let purged = self.registry.set_can_register(enabled);
        if purged > 0 {
            self.emit_list(HijackListAction::Reload, self.registry.list());
        }
        self.events.emit(SessionEvent::ManualHijackStatus { enabled });
    }

    /// Re-announces every pending task.
    pub fn recover_hijack_list(&self) {
        self.emit_list(HijackListAction::Reload, self.registry.list());
    }

    fn emit_list(&self, action: HijackListAction, tasks: Vec<HijackInfo>) {
        self.events.emit(SessionEvent::HijackList { action, tasks });
    }

    /// Registers a task whose drop announces its deletion.
    fn register_task(&self, info: HijackInfo) -> Option<HijackTask> {
        let task = self.registry.register(info)?.with_events(self.events.clone());
        self.metrics.hijack_tasks_registered.fetch_add(1, Ordering::Relaxed);
        Some(task)
    }

    fn emit_task(&self, action: HijackListAction, task: &HijackTask) {
        let info = task.info().unwrap_or_else(|| HijackInfo {
            task_id: task.id().to_string(),
            ..Default::default()
        });
        self.emit_list(action, vec![info]);
    }

    fn hook_context(exchange: &Exchange) -> HookContext {
        HookContext {
            is_https: exchange.is_https(),
            url: exchange.url().to_string(),
            remote_addr: exchange.request.remote_addr.map(|a| a.to_string()),
        }
    }

    pub async fn handle_request(&self, exchange: &mut Exchange, cancel: &CancellationToken) -> RequestOutcome {
        self.metrics.total_requests.fetch_add(1, Ordering::Relaxed);
        let url = exchange.url().to_string();
        let method = exchange.method();
        let host = packet::url_host(&url);
        let ext = packet::url_extension(&url);

        if exchange.flags.websocket && self.filter_websocket() {
            exchange.flags.request_filtered = true;
            return RequestOutcome::Forward(exchange.outgoing_request());
        }
        if !self.filter.is_passed(&method, &host, &url, &ext) {
            debug!(%url, %method, "Request out of filter scope");
            exchange.flags.request_filtered = true;
            return RequestOutcome::Forward(exchange.outgoing_request());
        }

        if !self.hooks.is_empty() {
            let ctx = Self::hook_context(exchange);
            let rewritten = self
                .hooks
                .before_request(&ctx, exchange.current_request().to_vec(), cancel)
                .await;
            exchange.set_request(rewritten, Modifier::Plugin);

            if let Some(response) = self.hooks.mock_request(&ctx, exchange.current_request(), cancel).await {
                exchange.flags.mocked = true;
                return RequestOutcome::Respond(response);
            }

            match self.hooks.hijack_request(&ctx, exchange.current_request(), cancel).await {
                HookVerdict::Drop => {
                    exchange.flags.request_dropped = true;
                    self.metrics.requests_dropped.fetch_add(1, Ordering::Relaxed);
                    return RequestOutcome::Drop;
                }
                HookVerdict::Replace(data) => {
                    exchange.set_request(data, Modifier::Plugin);
                }
                HookVerdict::Keep => {}
            }
        }

        if self.replacer.have_hijacking_rules() {
            let outcome = self
                .replacer
                .hook(true, false, &url, exchange.current_request(), exchange.is_https());
            exchange.matched_rules.extend(outcome.matched);
            if outcome.drop {
                info!(%url, "Request dropped by replacer rule");
                exchange.flags.request_dropped = true;
                self.metrics.requests_dropped.fetch_add(1, Ordering::Relaxed);
                return RequestOutcome::Drop;
            }
            exchange.set_request(outcome.data, Modifier::Rule);
        }

        if !self.registry.can_register()
            && !self.hijack_filter.is_empty()
            && self.hijack_filter.is_passed(&method, &host, &url, &ext)
        {
            info!(%url, "Conditional hijack matched, enabling manual mode");
            self.set_manual_hijack(true);
        }

        self.hijack_request_manually(exchange, &method, cancel).await
    }

    async fn hijack_request_manually(
        &self,
        exchange: &mut Exchange,
        method: &str,
        cancel: &CancellationToken,
    ) -> RequestOutcome {
        let info = HijackInfo {
            status: HijackStatus::HijackingRequest,
            is_https: exchange.is_https(),
            url: exchange.url().to_string(),
            method: method.to_string(),
            remote_addr: exchange.request.remote_addr.map(|a| a.to_string()),
            request: exchange.current_request().to_vec(),
            is_websocket: exchange.flags.websocket,
            ..Default::default()
        };
        let Some(mut task) = self.register_task(info) else {
            return RequestOutcome::Forward(exchange.outgoing_request());
        };
        exchange.flags.request_viewed = true;
        self.emit_task(HijackListAction::Add, &task);

        loop {
            let Some(msg) = task.next(cancel).await else {
                debug!(task_id = %task.id(), "Hijack released without decision, forwarding");
                break;
            };
            merge_tags(&mut exchange.tags, &msg.tags);
            match msg.action {
                ControlAction::HijackResponse | ControlAction::CancelHijackResponse => {
                    let hijack = msg.action == ControlAction::HijackResponse;
                    exchange.flags.hijack_response = hijack;
                    task.update_info(|i| i.hijack_response = hijack);
                    self.emit_task(HijackListAction::Update, &task);
                }
                ControlAction::Forward => break,
                ControlAction::SendPacket(data) => {
                    exchange.set_request(data, Modifier::User);
                    break;
                }
                ControlAction::Drop => {
                    info!(task_id = %task.id(), url = %exchange.url(), "Request dropped by controller");
                    exchange.flags.request_dropped = true;
                    self.metrics.requests_dropped.fetch_add(1, Ordering::Relaxed);
                    drop(task);
                    self.record_dropped_request(exchange);
                    return RequestOutcome::Drop;
                }
            }
        }

        if exchange.flags.hijack_response && task.is_registered() {
            let request = exchange.current_request().to_vec();
            task.update_info(|i| {
                i.status = HijackStatus::WaitingForResponse;
                i.request = request;
            });
            self.emit_task(HijackListAction::Update, &task);
            exchange.task = Some(task);
        }
        RequestOutcome::Forward(exchange.outgoing_request())
    }

    /// Runs the response path. `None` means the response must not reach the client.
    pub async fn handle_response(
        &self,
        exchange: &mut Exchange,
        raw: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Option<Vec<u8>> {
        exchange.attach_response(raw);
        if exchange.flags.request_filtered {
            return Some(exchange.outgoing_response());
        }

        let content_type = packet::header_value(&exchange.plain_response, "content-type").unwrap_or_default();
        if !content_type.is_empty() && !self.filter.is_mime_passed(&content_type) {
            debug!(url = %exchange.url(), %content_type, "Response out of MIME scope");
            exchange.flags.response_filtered = true;
            self.release_task(exchange);
            return Some(exchange.outgoing_response());
        }

        let ctx = Self::hook_context(exchange);
        if !self.hooks.is_empty() {
            match self
                .hooks
                .hijack_response(&ctx, exchange.current_request(), exchange.current_response(), cancel)
                .await
            {
                HookVerdict::Drop => return self.drop_response(exchange),
                HookVerdict::Replace(data) => {
                    exchange.set_response(data, Modifier::Plugin);
                }
                HookVerdict::Keep => {}
            }
        }

        if self.replacer.have_hijacking_rules() {
            let outcome = self.replacer.hook(
                false,
                true,
                exchange.url(),
                exchange.current_response(),
                exchange.is_https(),
            );
            exchange.matched_rules.extend(outcome.matched);
            if outcome.drop {
                info!(url = %exchange.url(), "Response dropped by replacer rule");
                return self.drop_response(exchange);
            }
            exchange.set_response(outcome.data, Modifier::Rule);
        }

        if let Some(task) = exchange.task.take() {
            if exchange.flags.hijack_response && !self.hijack_response_manually(exchange, task, cancel).await {
                return self.drop_response(exchange);
            }
        }

        if !self.hooks.is_empty() {
            let rewritten = self
                .hooks
                .after_request(&ctx, exchange.current_request(), exchange.current_response().to_vec(), cancel)
                .await;
            exchange.set_response(rewritten, Modifier::Plugin);
        }

        Some(exchange.outgoing_response())
    }

    fn drop_response(&self, exchange: &mut Exchange) -> Option<Vec<u8>> {
        exchange.flags.response_dropped = true;
        self.metrics.responses_dropped.fetch_add(1, Ordering::Relaxed);
        self.release_task(exchange);
        None
    }

    /// Waits for a decision on the response. `false` means drop.
    async fn hijack_response_manually(
        &self,
        exchange: &mut Exchange,
        mut task: HijackTask,
        cancel: &CancellationToken,
    ) -> bool {
        if !task.is_registered() {
            return true;
        }
        let request = exchange.current_request().to_vec();
        let response = exchange.current_response().to_vec();
        task.update_info(|i| {
            i.status = HijackStatus::HijackingResponse;
            i.request = request;
            i.response = response;
        });
        exchange.flags.response_viewed = true;
        self.emit_task(HijackListAction::Update, &task);

        while let Some(msg) = task.next(cancel).await {
            merge_tags(&mut exchange.tags, &msg.tags);
            match msg.action {
                ControlAction::Forward => break,
                ControlAction::SendPacket(data) => {
                    exchange.set_response(data, Modifier::User);
                    break;
                }
                ControlAction::Drop => {
                    info!(task_id = %task.id(), url = %exchange.url(), "Response dropped by controller");
                    return false;
                }
                ControlAction::HijackResponse | ControlAction::CancelHijackResponse => {}
            }
        }
        true
    }

    /// Releases a task still attached to the exchange; dropping it announces
    /// the deletion.
    pub fn release_task(&self, exchange: &mut Exchange) {
        exchange.task.take();
    }

    fn build_flow(&self, exchange: &Exchange) -> FlowRecord {
        let mut flow = FlowRecord::new(exchange.url(), exchange.is_https());
        flow.method = exchange.method();
        flow.request = exchange.current_request().to_vec();
        flow.response = exchange.current_response().to_vec();
        if exchange.request_modified() {
            flow.bare_request = exchange.plain_request.clone();
            flow.request_modified = true;
        }
        if exchange.response_modified() {
            flow.bare_response = exchange.plain_response.clone();
            flow.response_modified = true;
        }
        flow.status_code = packet::parse_status_line(&flow.response)
            .map(|(code, _)| code)
            .unwrap_or_default();
        flow.remote_addr = exchange.request.remote_addr.map(|a| a.to_string());
        flow.is_websocket = exchange.flags.websocket;
        flow.add_tags(&exchange.tags);
        if exchange.flags.request_viewed || exchange.flags.response_viewed {
            flow.mark(TAG_MANUAL_HIJACK, FlowColor::Yellow);
        }
        if exchange.request_modified_by == Some(Modifier::User)
            || exchange.response_modified_by == Some(Modifier::User)
        {
            flow.mark(TAG_MANUAL_MODIFIED, FlowColor::Orange);
        }
        if exchange.flags.response_dropped {
            flow.mark(TAG_RESPONSE_DROPPED, FlowColor::Purple);
        }
        let elapsed = Utc::now() - exchange.request.timestamp;
        flow.duration_ms = elapsed.num_milliseconds().max(0) as u64;
        flow
    }

    fn record_dropped_request(&self, exchange: &Exchange) {
        let mut flow = self.build_flow(exchange);
        flow.response.clear();
        flow.mark(TAG_DROPPED, FlowColor::Purple);
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            let _ = recorder.save(flow).await;
        });
    }

    /// Mirrors and records a finished exchange without blocking the caller.
    pub fn finish(self: &Arc<Self>, exchange: Exchange, websocket_hash: Option<String>) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.record(exchange, websocket_hash).await;
        });
    }

    /// Mirrors and records a finished exchange.
    pub async fn record(&self, mut exchange: Exchange, websocket_hash: Option<String>) {
        self.release_task(&mut exchange);
        let ctx = Self::hook_context(&exchange);
        self.hooks.mirror(
            ctx.clone(),
            MirrorFlow {
                request: Bytes::from(exchange.outgoing_request()),
                response: Bytes::from(exchange.outgoing_response()),
                is_websocket: exchange.flags.websocket,
            },
            self.cancel.clone(),
        );

        if exchange.flags.request_filtered || exchange.flags.response_filtered || exchange.flags.request_dropped {
            return;
        }
        if exchange.flags.websocket && self.filter_websocket() {
            return;
        }

        let mut flow = self.build_flow(&exchange);
        if let Some(hash) = websocket_hash {
            flow.websocket_hash = hash;
        }
        let extracted = self.replacer.hook_color(
            exchange.current_request(),
            exchange.current_response(),
            &exchange.matched_rules,
            &mut flow,
        );
        for data in &extracted {
            debug!(rule = %data.rule_name, url = %flow.url, "Extracted {:?}", data.data);
        }

        let Some(flow) = self.hooks.hijack_save_flow(&ctx, flow, &self.cancel).await else {
            return;
        };
        let _ = self.recorder.save(flow).await;
    }

    /// Runs one websocket frame through manual hijack and records it.
    /// `None` means the frame is dropped.
    pub async fn handle_websocket_frame(
        &self,
        session: &WebsocketSession,
        payload: Vec<u8>,
        is_text: bool,
        from_server: bool,
        cancel: &CancellationToken,
    ) -> Option<Vec<u8>> {
        if self.filter_websocket() {
            return Some(payload);
        }
        self.metrics.websocket_frames.fetch_add(1, Ordering::Relaxed);
        let mut current = payload;

        let info = HijackInfo {
            status: HijackStatus::HijackingWebsocket,
            is_https: session.is_https,
            url: session.url.clone(),
            remote_addr: session.remote_addr.clone(),
            is_websocket: true,
            payload: current.clone(),
            websocket_encode: vec![if is_text { "utf8" } else { "binary" }.to_string()],
            tags: vec![if from_server { "server" } else { "client" }.to_string()],
            ..Default::default()
        };
        if let Some(mut task) = self.register_task(info) {
            self.emit_task(HijackListAction::Add, &task);
            while let Some(msg) = task.next(cancel).await {
                match msg.action {
                    ControlAction::Forward => break,
                    ControlAction::SendPacket(data) => {
                        current = data;
                        break;
                    }
                    ControlAction::Drop => return None,
                    ControlAction::HijackResponse | ControlAction::CancelHijackResponse => {}
                }
            }
        }

        let frame_index = {
            let mut counter = self.frame_counters.entry(session.websocket_hash.clone()).or_default();
            counter.last_index += 1;
            counter.last_index
        };
        let mut frame = WebsocketFrameRecord {
            websocket_hash: session.websocket_hash.clone(),
            frame_index,
            from_server,
            data: current.clone(),
            tags: Vec::new(),
            color: None,
        };
        self.replacer.hook_color_ws(&current, &mut frame);
        let recorder = self.recorder.clone();
        tokio::spawn(async move {
            recorder.save_websocket_frame(frame).await;
        });

        Some(current)
    }

    /// Marks one forwarding direction of a websocket as open. The frame
    /// counter is forgotten once every guard for the connection is dropped,
    /// however the stream ended.
    pub fn open_websocket_stream(self: &Arc<Self>, websocket_hash: &str) -> WebsocketStreamGuard {
        self.frame_counters
            .entry(websocket_hash.to_string())
            .or_default()
            .streams += 1;
        WebsocketStreamGuard {
            engine: self.clone(),
            websocket_hash: websocket_hash.to_string(),
        }
    }

    fn close_websocket_stream(&self, websocket_hash: &str) {
        let removed = self
            .frame_counters
            .remove_if_mut(websocket_hash, |_, counter| {
                counter.streams = counter.streams.saturating_sub(1);
                counter.streams == 0
            });
        if removed.is_some() {
            debug!(websocket_hash, "Websocket closed");
        }
    }

    /// Websocket connections with a live frame counter.
    pub fn open_websockets(&self) -> usize {
        self.frame_counters.len()
    }
}

fn merge_tags(tags: &mut Vec<String>, extra: &[String]) {
    for tag in extra {
        if !tag.is_empty() && !tags.contains(tag) {
            tags.push(tag.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterData, FilterDataItem, MatcherType};
    use crate::flow::{FlowStore, MemoryFlowStore};
    use crate::hijack::ControlMessage;
    use crate::replacer::{ReplaceRule, ReplaceScope};
    use crate::unit::InterceptedUnit;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<InterceptEngine>,
        store: Arc<MemoryFlowStore>,
    }

    fn fixture(filter: FilterData, rules: Vec<ReplaceRule>, manual: bool) -> Fixture {
        let store = Arc::new(MemoryFlowStore::new());
        let engine = InterceptEngine::new(
            Arc::new(FilterManager::new(filter)),
            Arc::new(FilterManager::new(FilterData::default())),
            Arc::new(ContentReplacer::new(rules)),
            HijackTaskRegistry::new(manual),
            Arc::new(HookDispatcher::default()),
            Arc::new(FlowRecorder::new(store.clone()).with_retry(1, Duration::from_millis(1))),
        );
        Fixture {
            engine: Arc::new(engine),
            store,
        }
    }

    fn exchange(raw: &str) -> Exchange {
        Exchange::new(InterceptedUnit::request(raw.as_bytes().to_vec(), false, None))
    }

    const OK: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 2\r\n\r\nhi";

    async fn run(engine: &InterceptEngine, mut ex: Exchange) -> (RequestOutcome, Exchange) {
        let cancel = CancellationToken::new();
        let outcome = engine.handle_request(&mut ex, &cancel).await;
        if matches!(outcome, RequestOutcome::Forward(_)) {
            engine.handle_response(&mut ex, OK.to_vec(), &cancel).await;
        }
        (outcome, ex)
    }

    async fn wait_for_tasks(engine: &InterceptEngine, count: usize) {
        for _ in 0..200 {
            if engine.registry().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} pending tasks, got {}", count, engine.registry().len());
    }

    #[tokio::test]
    async fn test_excluded_suffix_is_forwarded_and_not_stored() {
        let filter = FilterData {
            exclude_suffix: vec![FilterDataItem::new(MatcherType::Suffix, &[".js"])],
            ..Default::default()
        };
        let fx = fixture(filter, Vec::new(), true);
        let raw = "GET /static/app.js HTTP/1.1\r\nHost: example.com\r\n\r\n";

        let (outcome, ex) = run(&fx.engine, exchange(raw)).await;
        assert_eq!(outcome, RequestOutcome::Forward(raw.as_bytes().to_vec()));
        assert!(ex.flags.request_filtered);
        assert!(fx.engine.registry().is_empty());

        fx.engine.record(ex, None).await;
        assert_eq!(fx.store.count().await, 0);
    }

    #[tokio::test]
    async fn test_body_rule_keeps_other_fields() {
        let rule = ReplaceRule {
            rule: "password=secret".to_string(),
            result: "password=hidden".to_string(),
            scope: ReplaceScope::RequestBody,
            ..Default::default()
        };
        let fx = fixture(FilterData::default(), vec![rule], false);
        let raw = "POST /login HTTP/1.1\r\nHost: example.com\r\nContent-Length: 30\r\n\r\nusername=admin&password=secret";

        let (outcome, ex) = run(&fx.engine, exchange(raw)).await;
        let RequestOutcome::Forward(sent) = outcome else {
            panic!("request should be forwarded");
        };
        let sent = String::from_utf8(sent).unwrap();
        assert!(sent.ends_with("username=admin&password=hidden"));
        assert_eq!(ex.request_modified_by, Some(Modifier::Rule));

        fx.engine.record(ex, None).await;
        let flows = fx.store.all();
        assert_eq!(flows.len(), 1);
        assert!(flows[0].request_modified);
        assert_eq!(flows[0].bare_request, raw.as_bytes());
        assert_eq!(flows[0].status_code, 200);
    }

    #[tokio::test]
    async fn test_rule_drop_is_not_recorded() {
        let rule = ReplaceRule {
            rule: "tracker".to_string(),
            scope: ReplaceScope::RequestUrl,
            drop: true,
            ..Default::default()
        };
        let fx = fixture(FilterData::default(), vec![rule], false);
        let (outcome, ex) = run(&fx.engine, exchange("GET /tracker HTTP/1.1\r\nHost: a.com\r\n\r\n")).await;
        assert_eq!(outcome, RequestOutcome::Drop);
        fx.engine.record(ex, None).await;
        assert_eq!(fx.store.count().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_manual_tasks_are_independent() {
        let fx = fixture(FilterData::default(), Vec::new(), true);
        let first = {
            let engine = fx.engine.clone();
            tokio::spawn(async move {
                let mut ex = exchange("GET /one HTTP/1.1\r\nHost: a.com\r\n\r\n");
                let outcome = engine.handle_request(&mut ex, &CancellationToken::new()).await;
                (outcome, ex)
            })
        };
        wait_for_tasks(&fx.engine, 1).await;
        let second = {
            let engine = fx.engine.clone();
            tokio::spawn(async move {
                let mut ex = exchange("GET /two HTTP/1.1\r\nHost: a.com\r\n\r\n");
                let outcome = engine.handle_request(&mut ex, &CancellationToken::new()).await;
                (outcome, ex)
            })
        };
        wait_for_tasks(&fx.engine, 2).await;

        let tasks = fx.engine.registry().list();
        assert_eq!(tasks[0].url, "http://a.com/one");
        assert_eq!(tasks[1].url, "http://a.com/two");

        let edited = b"GET /edited HTTP/1.1\r\nHost: a.com\r\n\r\n".to_vec();
        assert!(fx.engine.registry().unicast(ControlMessage::new(
            tasks[1].task_id.clone(),
            ControlAction::SendPacket(edited.clone()),
        )));
        let (outcome, ex) = second.await.unwrap();
        assert_eq!(outcome, RequestOutcome::Forward(edited));
        assert_eq!(ex.request_modified_by, Some(Modifier::User));
        assert_eq!(fx.engine.registry().len(), 1);

        assert!(fx.engine.registry().unicast(ControlMessage::new(tasks[0].task_id.clone(), ControlAction::Drop)));
        let (outcome, ex) = first.await.unwrap();
        assert_eq!(outcome, RequestOutcome::Drop);
        assert!(ex.flags.request_dropped);
        assert!(fx.engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_disable_releases_waiting_request() {
        let fx = fixture(FilterData::default(), Vec::new(), true);
        let raw = "GET /wait HTTP/1.1\r\nHost: a.com\r\n\r\n";
        let handle = {
            let engine = fx.engine.clone();
            tokio::spawn(async move {
                let mut ex = exchange(raw);
                engine.handle_request(&mut ex, &CancellationToken::new()).await
            })
        };
        wait_for_tasks(&fx.engine, 1).await;
        fx.engine.set_manual_hijack(false);
        assert_eq!(handle.await.unwrap(), RequestOutcome::Forward(raw.as_bytes().to_vec()));
        assert!(fx.engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_task() {
        let fx = fixture(FilterData::default(), Vec::new(), true);
        let cancel = CancellationToken::new();
        let handle = {
            let engine = fx.engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut ex = exchange("GET /c HTTP/1.1\r\nHost: a.com\r\n\r\n");
                engine.handle_request(&mut ex, &cancel).await
            })
        };
        wait_for_tasks(&fx.engine, 1).await;
        cancel.cancel();
        assert!(matches!(handle.await.unwrap(), RequestOutcome::Forward(_)));
        assert!(fx.engine.registry().is_empty());
    }

    #[tokio::test]
    async fn test_response_hijack_and_tags() {
        let fx = fixture(FilterData::default(), Vec::new(), true);
        let engine = fx.engine.clone();
        let handle = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let mut ex = exchange("GET /r HTTP/1.1\r\nHost: a.com\r\n\r\n");
            engine.handle_request(&mut ex, &cancel).await;
            let rsp = engine.handle_response(&mut ex, OK.to_vec(), &cancel).await;
            (rsp, ex)
        });
        wait_for_tasks(&fx.engine, 1).await;
        let id = fx.engine.registry().list()[0].task_id.clone();
        let registry = fx.engine.registry().clone();
        assert!(registry.unicast(ControlMessage::new(id.clone(), ControlAction::HijackResponse)));
        assert!(registry.unicast(ControlMessage::new(id.clone(), ControlAction::Forward)));

        for _ in 0..200 {
            if registry.get_info(&id).map(|i| i.status) == Some(HijackStatus::HijackingResponse) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let replaced = b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n".to_vec();
        assert!(registry.unicast(ControlMessage::new(id, ControlAction::SendPacket(replaced.clone()))));

        let (rsp, ex) = handle.await.unwrap();
        assert_eq!(rsp, Some(replaced));
        fx.engine.record(ex, None).await;
        let flow = &fx.store.all()[0];
        assert_eq!(flow.status_code, 403);
        assert!(flow.tags.contains(&TAG_MANUAL_HIJACK.to_string()));
        assert!(flow.tags.contains(&TAG_MANUAL_MODIFIED.to_string()));
        assert_eq!(flow.color, Some(FlowColor::Orange));
    }

    #[tokio::test]
    async fn test_excluded_mime_is_not_stored() {
        let fx = fixture(FilterData::default_rules(), Vec::new(), false);
        let cancel = CancellationToken::new();
        let mut ex = exchange("GET /logo HTTP/1.1\r\nHost: a.com\r\n\r\n");
        assert!(matches!(fx.engine.handle_request(&mut ex, &cancel).await, RequestOutcome::Forward(_)));
        let png = b"HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: 1\r\n\r\nx".to_vec();
        assert_eq!(fx.engine.handle_response(&mut ex, png.clone(), &cancel).await, Some(png));
        assert!(ex.flags.response_filtered);
        fx.engine.record(ex, None).await;
        assert_eq!(fx.store.count().await, 0);
    }

    #[tokio::test]
    async fn test_websocket_frames_are_indexed_per_connection() {
        let fx = fixture(FilterData::default(), Vec::new(), false);
        let session = WebsocketSession {
            url: "ws://a.com/chat".to_string(),
            is_https: false,
            websocket_hash: "h1".to_string(),
            remote_addr: None,
        };
        let cancel = CancellationToken::new();
        for payload in ["a", "b"] {
            let out = fx
                .engine
                .handle_websocket_frame(&session, payload.as_bytes().to_vec(), true, false, &cancel)
                .await;
            assert_eq!(out, Some(payload.as_bytes().to_vec()));
        }
        for _ in 0..200 {
            if fx.store.frames_for("h1").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let frames = fx.store.frames_for("h1");
        assert_eq!(frames.iter().map(|f| f.frame_index).collect::<Vec<_>>(), vec![1, 2]);

        fx.engine.set_filter_websocket(true);
        let out = fx
            .engine
            .handle_websocket_frame(&session, b"c".to_vec(), true, true, &cancel)
            .await;
        assert_eq!(out, Some(b"c".to_vec()));
    }

    fn ws_session(hash: &str) -> WebsocketSession {
        WebsocketSession {
            url: "ws://a.com/chat".to_string(),
            is_https: false,
            websocket_hash: hash.to_string(),
            remote_addr: None,
        }
    }

    #[tokio::test]
    async fn test_frame_counter_released_without_close_frame() {
        let fx = fixture(FilterData::default(), Vec::new(), false);
        let cancel = CancellationToken::new();
        for n in 0..50 {
            let session = ws_session(&format!("conn-{}", n));
            let guard = fx.engine.open_websocket_stream(&session.websocket_hash);
            fx.engine
                .handle_websocket_frame(&session, b"hello".to_vec(), true, false, &cancel)
                .await;
            // Stream ends on reset or error, no Close frame seen
            drop(guard);
        }
        assert_eq!(fx.engine.open_websockets(), 0);
    }

    #[tokio::test]
    async fn test_frame_index_survives_one_direction_closing() {
        let fx = fixture(FilterData::default(), Vec::new(), false);
        let cancel = CancellationToken::new();
        let session = ws_session("duplex");
        let outbound = fx.engine.open_websocket_stream("duplex");
        let inbound = fx.engine.open_websocket_stream("duplex");

        fx.engine
            .handle_websocket_frame(&session, b"ping".to_vec(), true, false, &cancel)
            .await;
        drop(outbound);
        assert_eq!(fx.engine.open_websockets(), 1);
        fx.engine
            .handle_websocket_frame(&session, b"pong".to_vec(), true, true, &cancel)
            .await;
        drop(inbound);
        assert_eq!(fx.engine.open_websockets(), 0);

        for _ in 0..200 {
            if fx.store.frames_for("duplex").len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let mut indexes: Vec<_> = fx.store.frames_for("duplex").iter().map(|f| f.frame_index).collect();
        indexes.sort();
        assert_eq!(indexes, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_aborted_hijack_announces_delete() {
        let (events, mut rx) = EventSender::channel(64);
        let engine = Arc::new(
            InterceptEngine::new(
                Arc::new(FilterManager::new(FilterData::default())),
                Arc::new(FilterManager::new(FilterData::default())),
                Arc::new(ContentReplacer::new(Vec::new())),
                HijackTaskRegistry::new(true),
                Arc::new(HookDispatcher::default()),
                Arc::new(FlowRecorder::new(Arc::new(MemoryFlowStore::new()))),
            )
            .with_events(events),
        );
        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut ex = exchange("GET /gone HTTP/1.1\r\nHost: a.com\r\n\r\n");
                engine.handle_request(&mut ex, &CancellationToken::new()).await
            })
        };
        wait_for_tasks(&engine, 1).await;
        let id = engine.registry().list()[0].task_id.clone();

        // Client went away while the request was paused
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(engine.registry().is_empty());

        let mut actions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::HijackList { action, tasks } = event {
                assert_eq!(tasks[0].task_id, id);
                actions.push(action);
            }
        }
        assert_eq!(actions, vec![HijackListAction::Add, HijackListAction::Delete]);
    }

    #[tokio::test]
    async fn test_parked_response_task_announces_delete_when_exchange_dropped() {
        let (events, mut rx) = EventSender::channel(64);
        let engine = Arc::new(
            InterceptEngine::new(
                Arc::new(FilterManager::new(FilterData::default())),
                Arc::new(FilterManager::new(FilterData::default())),
                Arc::new(ContentReplacer::new(Vec::new())),
                HijackTaskRegistry::new(true),
                Arc::new(HookDispatcher::default()),
                Arc::new(FlowRecorder::new(Arc::new(MemoryFlowStore::new()))),
            )
            .with_events(events),
        );
        let handle = {
            let engine = engine.clone();
            tokio::spawn(async move {
                let mut ex = exchange("GET /slow HTTP/1.1\r\nHost: a.com\r\n\r\n");
                let outcome = engine.handle_request(&mut ex, &CancellationToken::new()).await;
                (outcome, ex)
            })
        };
        wait_for_tasks(&engine, 1).await;
        let id = engine.registry().list()[0].task_id.clone();
        assert!(engine
            .registry()
            .unicast(ControlMessage::new(id.clone(), ControlAction::HijackResponse)));
        assert!(engine.registry().unicast(ControlMessage::new(id.clone(), ControlAction::Forward)));

        let (outcome, ex) = handle.await.unwrap();
        assert!(matches!(outcome, RequestOutcome::Forward(_)));
        assert!(ex.task.is_some());
        assert_eq!(engine.registry().len(), 1);

        // Upstream never answered; the handler state is discarded
        drop(ex);
        assert!(engine.registry().is_empty());
        let last = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                SessionEvent::HijackList { action, .. } => Some(action),
                _ => None,
            })
            .last();
        assert_eq!(last, Some(HijackListAction::Delete));
    }
}
