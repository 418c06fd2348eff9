//! Rule-based rewriting of intercepted packets.
//!
//! Rules run in ascending `index` order. A rule addresses one region of the
//! packet (request URI, header section, body, or the raw packet) and only that
//! region is rewritten; the rest of the packet is reassembled unchanged.
//! Rules flagged `no_replace` never rewrite: they colour and tag stored flows
//! and extract data for display.

use crate::admin::Metrics;
use crate::events::{EventSender, NotificationKind};
use crate::flow::{FlowColor, FlowRecord, WebsocketFrameRecord};
use crate::packet;
use crate::store::{KvStore, REPLACER_RULES_KEY};
use parking_lot::RwLock;
use regex::bytes::Regex as BytesRegex;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Packet region a rule edits. `Request*` scopes only ever see requests; the
/// unqualified scopes see whichever directions the rule enables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceScope {
    RequestHeader,
    RequestBody,
    RequestUrl,
    RequestRaw,
    Header,
    Body,
    #[default]
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Url,
    Header,
    Body,
    Raw,
}

impl ReplaceScope {
    fn request_only(self) -> bool {
        !matches!(self, ReplaceScope::Header | ReplaceScope::Body | ReplaceScope::Raw)
    }

    fn region(self) -> Region {
        match self {
            ReplaceScope::RequestUrl => Region::Url,
            ReplaceScope::RequestHeader | ReplaceScope::Header => Region::Header,
            ReplaceScope::RequestBody | ReplaceScope::Body => Region::Body,
            ReplaceScope::RequestRaw | ReplaceScope::Raw => Region::Raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderPair {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaceRule {
    pub index: i64,
    pub name: String,
    /// Regex over packet bytes; falls back to a literal when it does not compile
    pub rule: String,
    /// Replacement text, `$1` style group references allowed
    pub result: String,
    pub scope: ReplaceScope,
    pub color: Option<FlowColor>,
    pub extra_tag: Vec<String>,
    pub enabled: bool,
    pub enable_for_request: bool,
    /// Ignored by `Request*` scopes
    pub enable_for_response: bool,
    pub drop: bool,
    pub no_replace: bool,
    /// Regex the request URL must match; empty applies everywhere
    pub effective_url: String,
    /// Set on matching requests
    pub extra_headers: Vec<HeaderPair>,
}

impl Default for ReplaceRule {
    fn default() -> Self {
        Self {
            index: 0,
            name: String::new(),
            rule: String::new(),
            result: String::new(),
            scope: ReplaceScope::default(),
            color: None,
            extra_tag: Vec::new(),
            enabled: true,
            enable_for_request: true,
            enable_for_response: true,
            drop: false,
            no_replace: false,
            effective_url: String::new(),
            extra_headers: Vec::new(),
        }
    }
}

impl ReplaceRule {
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("rule#{}", self.index)
        } else {
            self.name.clone()
        }
    }
}

/// Data pulled out of a stored flow by a mirror rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedData {
    pub rule_name: String,
    pub data: String,
    pub is_request: bool,
}

/// Result of one [`ContentReplacer::hook`] call
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceOutcome {
    /// Rules that matched, in evaluation order
    pub matched: Vec<ReplaceRule>,
    /// Rewritten packet; the input bytes when `drop` is set
    pub data: Vec<u8>,
    /// The packet must not be forwarded
    pub drop: bool,
}

#[derive(Debug)]
struct CompiledRule {
    rule: ReplaceRule,
    re: BytesRegex,
    url_gate: Option<Regex>,
}

impl CompiledRule {
    fn compile(rule: &ReplaceRule) -> Option<Self> {
        let re = match BytesRegex::new(&rule.rule) {
            Ok(re) => re,
            Err(e) => {
                debug!("Rule {} is not a regex ({}), using it literally", rule.display_name(), e);
                match BytesRegex::new(&regex::escape(&rule.rule)) {
                    Ok(re) => re,
                    Err(e) => {
                        warn!("Disabling rule {}: {}", rule.display_name(), e);
                        return None;
                    }
                }
            }
        };
        let url_gate = if rule.effective_url.trim().is_empty() {
            None
        } else {
            match Regex::new(rule.effective_url.trim()) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(
                        "Rule {} has an invalid effective url, applying everywhere: {}",
                        rule.display_name(),
                        e
                    );
                    None
                }
            }
        };
        Some(Self {
            rule: rule.clone(),
            re,
            url_gate,
        })
    }

    fn applies(&self, is_request: bool, is_response: bool, url: &str) -> bool {
        let rule = &self.rule;
        let direction = (is_request && rule.enable_for_request)
            || (is_response && rule.enable_for_response && !rule.scope.request_only());
        direction && self.url_gate.as_ref().map_or(true, |gate| gate.is_match(url))
    }

    /// Region of `data` this rule looks at, as a byte range.
    fn region(&self, data: &[u8], is_request: bool) -> Option<std::ops::Range<usize>> {
        match self.rule.scope.region() {
            Region::Url if is_request => packet::request_uri_range(data),
            Region::Url => None,
            Region::Header => {
                let (header, _) = packet::split_header_body(data);
                Some(0..header.len())
            }
            Region::Body => {
                let (header, _) = packet::split_header_body(data);
                Some(header.len()..data.len())
            }
            Region::Raw => Some(0..data.len()),
        }
    }

    /// Rewrites the addressed region, `None` when the rule does not match.
    fn apply(&self, data: &[u8], is_request: bool) -> Option<Vec<u8>> {
        let range = self.region(data, is_request)?;
        let target = &data[range.clone()];
        if !self.re.is_match(target) {
            return None;
        }
        let replaced = self.re.replace_all(target, self.rule.result.as_bytes());
        let mut out = Vec::with_capacity(data.len() + replaced.len());
        out.extend_from_slice(&data[..range.start]);
        out.extend_from_slice(&replaced);
        out.extend_from_slice(&data[range.end..]);

        if is_request {
            for header in &self.rule.extra_headers {
                if !header.name.trim().is_empty() {
                    out = packet::set_header(&out, header.name.trim(), &header.value);
                }
            }
        }
        Some(out)
    }

    fn extract(&self, data: &[u8], is_request: bool) -> Option<String> {
        let range = self.region(data, is_request)?;
        let caps = self.re.captures(&data[range])?;
        let hit = caps.get(1).or_else(|| caps.get(0))?;
        Some(String::from_utf8_lossy(hit.as_bytes()).into_owned())
    }
}

#[derive(Debug, Default)]
struct RuleSet {
    rules: Vec<ReplaceRule>,
    hijacking: Vec<CompiledRule>,
    mirror: Vec<CompiledRule>,
}

impl RuleSet {
    fn new(mut rules: Vec<ReplaceRule>) -> Self {
        rules.sort_by_key(|rule| rule.index);
        let mut hijacking = Vec::new();
        let mut mirror = Vec::new();
        for rule in rules.iter().filter(|r| r.enabled && !r.rule.is_empty()) {
            if let Some(compiled) = CompiledRule::compile(rule) {
                if rule.no_replace {
                    mirror.push(compiled);
                } else {
                    hijacking.push(compiled);
                }
            }
        }
        Self {
            rules,
            hijacking,
            mirror,
        }
    }
}

type AutoSave = Box<dyn Fn(&[ReplaceRule]) + Send + Sync>;

/// Ordered user rules that rewrite, drop, colour and tag traffic.
pub struct ContentReplacer {
    rules: RwLock<Arc<RuleSet>>,
    autosave: Option<AutoSave>,
    slow_threshold: Duration,
    events: EventSender,
    metrics: Option<Arc<Metrics>>,
}

impl Default for ContentReplacer {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ContentReplacer {
    pub fn new(rules: Vec<ReplaceRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(RuleSet::new(rules))),
            autosave: None,
            slow_threshold: Duration::from_millis(300),
            events: EventSender::disabled(),
            metrics: None,
        }
    }

    /// Called with the full rule list after every `set_rules`.
    pub fn with_autosave(mut self, save: impl Fn(&[ReplaceRule]) + Send + Sync + 'static) -> Self {
        self.autosave = Some(Box::new(save));
        self
    }

    /// Persists every rule change under [`REPLACER_RULES_KEY`].
    pub fn with_store(self, store: Arc<dyn KvStore>) -> Self {
        self.with_autosave(move |rules| match serde_json::to_string(rules) {
            Ok(blob) => {
                if let Err(e) = store.set(REPLACER_RULES_KEY, &blob) {
                    warn!("Failed to persist replacer rules: {}", e);
                }
            }
            Err(e) => warn!("Failed to encode replacer rules: {}", e),
        })
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    fn snapshot(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    pub fn set_rules(&self, rules: Vec<ReplaceRule>) {
        let set = Arc::new(RuleSet::new(rules));
        *self.rules.write() = set.clone();
        if let Some(save) = &self.autosave {
            save(&set.rules);
        }
    }

    /// All rules in evaluation order, disabled ones included.
    pub fn rules(&self) -> Vec<ReplaceRule> {
        self.snapshot().rules.clone()
    }

    /// Whether any rule can rewrite or drop traffic.
    pub fn have_hijacking_rules(&self) -> bool {
        !self.snapshot().hijacking.is_empty()
    }

    pub fn hook(
        &self,
        is_request: bool,
        is_response: bool,
        url: &str,
        data: &[u8],
        is_https: bool,
    ) -> ReplaceOutcome {
        let started = Instant::now();
        let set = self.snapshot();
        let mut current = data.to_vec();
        let mut matched = Vec::new();
        let mut drop = false;

        for compiled in &set.hijacking {
            if !compiled.applies(is_request, is_response, url) {
                continue;
            }
            let Some(rewritten) = compiled.apply(&current, is_request) else {
                continue;
            };
            matched.push(compiled.rule.clone());
            if compiled.rule.drop {
                debug!(rule = %compiled.rule.display_name(), url, is_https, "Replacer rule dropped packet");
                drop = true;
                break;
            }
            current = rewritten;
        }

        self.report_if_slow(started.elapsed(), url, data.len());

        if drop {
            return ReplaceOutcome {
                matched,
                data: data.to_vec(),
                drop: true,
            };
        }
        ReplaceOutcome {
            matched,
            data: current,
            drop: false,
        }
    }

    fn report_if_slow(&self, elapsed: Duration, url: &str, size: usize) {
        if elapsed <= self.slow_threshold {
            return;
        }
        warn!(
            url,
            size,
            elapsed_ms = elapsed.as_millis() as u64,
            "Slow replacer rules"
        );
        if let Some(metrics) = &self.metrics {
            metrics.slow_rules.fetch_add(1, Ordering::Relaxed);
        }
        self.events.notify(
            NotificationKind::SlowRule,
            format!(
                "replacer rules took {}ms on {} ({} bytes)",
                elapsed.as_millis(),
                url,
                size
            ),
        );
    }

    /// Colours and tags a flow that is about to be stored.
    ///
    /// The last matched rewriting rule contributes first, then every
    /// matching mirror rule in order. Returns what the mirror rules extracted.
    pub fn hook_color(
        &self,
        request: &[u8],
        response: &[u8],
        matched: &[ReplaceRule],
        flow: &mut FlowRecord,
    ) -> Vec<ExtractedData> {
        let set = self.snapshot();
        if let Some(last) = matched.last() {
            let mut tags = last.extra_tag.clone();
            tags.append(&mut flow.tags);
            flow.tags = tags;
            if let Some(color) = last.color {
                flow.color = Some(color);
            }
        }

        let mut extracted = Vec::new();
        for compiled in &set.mirror {
            let url = flow.url.clone();
            let mut hit = false;
            if compiled.applies(true, false, &url) {
                if let Some(data) = compiled.extract(request, true) {
                    extracted.push(ExtractedData {
                        rule_name: compiled.rule.display_name(),
                        data,
                        is_request: true,
                    });
                    hit = true;
                }
            }
            if !response.is_empty() && compiled.applies(false, true, &url) {
                if let Some(data) = compiled.extract(response, false) {
                    extracted.push(ExtractedData {
                        rule_name: compiled.rule.display_name(),
                        data,
                        is_request: false,
                    });
                    hit = true;
                }
            }
            if hit {
                flow.add_tags(&compiled.rule.extra_tag);
                if let Some(color) = compiled.rule.color {
                    flow.color = Some(color);
                }
            }
        }
        extracted
    }

    /// Colours and tags a stored websocket frame.
    pub fn hook_color_ws(&self, payload: &[u8], frame: &mut WebsocketFrameRecord) {
        let set = self.snapshot();
        for compiled in &set.mirror {
            if matches!(compiled.rule.scope.region(), Region::Url) {
                continue;
            }
            if compiled.re.is_match(payload) {
                for tag in &compiled.rule.extra_tag {
                    if !frame.tags.contains(tag) {
                        frame.tags.push(tag.clone());
                    }
                }
                if let Some(color) = compiled.rule.color {
                    frame.color = Some(color);
                }
            }
        }
    }
}

/// Reads persisted rules; a missing or corrupt blob yields no rules.
pub fn load_rules(store: &dyn KvStore) -> Vec<ReplaceRule> {
    match store.get(REPLACER_RULES_KEY) {
        Some(blob) => serde_json::from_str(&blob).unwrap_or_else(|e| {
            warn!("Stored replacer rules are corrupt, starting empty: {}", e);
            Vec::new()
        }),
        None => Vec::new(),
    }
}
