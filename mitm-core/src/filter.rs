//! Traffic scope filters.
//!
//! Exclude rules are checked first and any match rejects. A non-empty include
//! set must then be matched for the dimension to pass.

use crate::error::MitmError;
use crate::store::KvStore;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wildmatch::WildMatch;

/// How the patterns of a [`FilterDataItem`] are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherType {
    /// Case-sensitive substring
    #[default]
    Word,
    /// Whole-value wildcard match
    Glob,
    /// Unanchored regex search; an invalid pattern never matches
    Regex,
    /// Literal `ends_with`
    Suffix,
    /// Content type match, see [`mime_matches`]
    Mime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDataItem {
    #[serde(default)]
    pub matcher_type: MatcherType,
    #[serde(default)]
    pub group: Vec<String>,
}

impl FilterDataItem {
    pub fn new(matcher_type: MatcherType, group: &[&str]) -> Self {
        Self {
            matcher_type,
            group: group.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Filter rule collections. Exclusion always wins over inclusion; an empty
/// include collection allows everything that is not excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterData {
    pub include_hostnames: Vec<FilterDataItem>,
    pub exclude_hostnames: Vec<FilterDataItem>,
    pub include_uri: Vec<FilterDataItem>,
    pub exclude_uri: Vec<FilterDataItem>,
    pub include_suffix: Vec<FilterDataItem>,
    pub exclude_suffix: Vec<FilterDataItem>,
    pub exclude_methods: Vec<FilterDataItem>,
    pub exclude_mime: Vec<FilterDataItem>,
}

impl FilterData {
    /// Scope used for a fresh install and by `recover`.
    pub fn default_rules() -> Self {
        Self {
            exclude_hostnames: vec![FilterDataItem::new(
                MatcherType::Glob,
                &[
                    "google.com",
                    "*.google.com",
                    "*gstatic.com",
                    "*.googleapis.com",
                    "*.mozilla.org",
                    "*.mozilla.com",
                    "*.firefox.com",
                ],
            )],
            exclude_suffix: vec![FilterDataItem::new(
                MatcherType::Suffix,
                &[
                    ".css", ".jpg", ".jpeg", ".png", ".gif", ".ico", ".svg", ".webp", ".bmp",
                    ".woff", ".woff2", ".ttf", ".eot", ".mp3", ".mp4", ".avi", ".flv", ".wav",
                ],
            )],
            exclude_methods: vec![FilterDataItem::new(MatcherType::Glob, &["OPTIONS", "CONNECT"])],
            exclude_mime: vec![FilterDataItem::new(
                MatcherType::Mime,
                &[
                    "image/*",
                    "audio/*",
                    "video/*",
                    "font/*",
                    "*octet-stream*",
                    "application/ogg",
                    "application/pdf",
                    "application/msword",
                    "application/x-ppt",
                    "application/x-ico",
                    "*zip",
                ],
            )],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        [
            &self.include_hostnames,
            &self.exclude_hostnames,
            &self.include_uri,
            &self.exclude_uri,
            &self.include_suffix,
            &self.exclude_suffix,
            &self.exclude_methods,
            &self.exclude_mime,
        ]
        .iter()
        .all(|items| items.iter().all(|item| item.group.iter().all(|p| p.trim().is_empty())))
    }
}

/// Content type matching.
///
/// Parameters after `;` are dropped and comparison is case-insensitive. A
/// pattern containing `*` is a glob over the whole content type or either of
/// its halves. A plain pattern matches the type or the subtype of a
/// `type/subtype` value exactly, and is a prefix match for values without `/`.
pub fn mime_matches(pattern: &str, content_type: &str) -> bool {
    let pattern = pattern.trim().to_ascii_lowercase();
    if pattern.is_empty() {
        return false;
    }
    let value = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if value.is_empty() {
        return false;
    }

    if pattern.contains('*') {
        let glob = WildMatch::new(&pattern);
        if glob.matches(&value) {
            return true;
        }
        return match value.split_once('/') {
            Some((major, minor)) => glob.matches(major) || glob.matches(minor),
            None => false,
        };
    }

    match value.split_once('/') {
        Some((major, minor)) => value == pattern || major == pattern || minor == pattern,
        None => value.starts_with(&pattern),
    }
}

#[derive(Debug)]
enum Matcher {
    Word(String),
    Glob(WildMatch),
    Regex(Option<Regex>),
    Suffix(String),
    Mime(String),
}

impl Matcher {
    fn compile(kind: MatcherType, pattern: &str) -> Self {
        match kind {
            MatcherType::Word => Matcher::Word(pattern.to_string()),
            MatcherType::Glob => Matcher::Glob(WildMatch::new(pattern)),
            MatcherType::Regex => match Regex::new(pattern) {
                Ok(re) => Matcher::Regex(Some(re)),
                Err(e) => {
                    warn!("Ignoring invalid filter regex {:?}: {}", pattern, e);
                    Matcher::Regex(None)
                }
            },
            MatcherType::Suffix => Matcher::Suffix(pattern.to_string()),
            MatcherType::Mime => Matcher::Mime(pattern.to_string()),
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Word(word) => value.contains(word.as_str()),
            Matcher::Glob(glob) => glob.matches(value),
            Matcher::Regex(Some(re)) => re.is_match(value),
            Matcher::Regex(None) => false,
            Matcher::Suffix(suffix) => value.ends_with(suffix.as_str()),
            Matcher::Mime(pattern) => mime_matches(pattern, value),
        }
    }
}

#[derive(Debug, Default)]
struct MatcherSet(Vec<Matcher>);

impl MatcherSet {
    fn compile(items: &[FilterDataItem]) -> Self {
        let matchers = items
            .iter()
            .flat_map(|item| {
                item.group
                    .iter()
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(move |p| Matcher::compile(item.matcher_type, p))
            })
            .collect();
        Self(matchers)
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn any(&self, values: &[&str]) -> bool {
        self.0
            .iter()
            .any(|m| values.iter().any(|v| !v.is_empty() && m.matches(v)))
    }
}

#[derive(Debug, Default)]
struct CompiledFilter {
    data: FilterData,
    include_hostnames: MatcherSet,
    exclude_hostnames: MatcherSet,
    include_uri: MatcherSet,
    exclude_uri: MatcherSet,
    include_suffix: MatcherSet,
    exclude_suffix: MatcherSet,
    exclude_methods: MatcherSet,
    exclude_mime: MatcherSet,
}

impl CompiledFilter {
    fn new(data: FilterData) -> Self {
        Self {
            include_hostnames: MatcherSet::compile(&data.include_hostnames),
            exclude_hostnames: MatcherSet::compile(&data.exclude_hostnames),
            include_uri: MatcherSet::compile(&data.include_uri),
            exclude_uri: MatcherSet::compile(&data.exclude_uri),
            include_suffix: MatcherSet::compile(&data.include_suffix),
            exclude_suffix: MatcherSet::compile(&data.exclude_suffix),
            exclude_methods: MatcherSet::compile(&data.exclude_methods),
            exclude_mime: MatcherSet::compile(&data.exclude_mime),
            data,
        }
    }

    /// Exclusion first, then inclusion when the include set is non-empty.
    fn dimension(include: &MatcherSet, exclude: &MatcherSet, values: &[&str]) -> bool {
        if exclude.any(values) {
            return false;
        }
        include.is_empty() || include.any(values)
    }
}

/// Evaluates whether traffic is in scope for interception and storage.
///
/// Rule sets are read-mostly: evaluations clone an `Arc` snapshot, updates
/// swap the snapshot under a short write lock.
pub struct FilterManager {
    compiled: RwLock<Arc<CompiledFilter>>,
    store: Option<Arc<dyn KvStore>>,
    key: String,
    defaults: fn() -> FilterData,
}

impl FilterManager {
    /// In-memory manager; `recover` resets to [`FilterData::default_rules`].
    pub fn new(data: FilterData) -> Self {
        Self {
            compiled: RwLock::new(Arc::new(CompiledFilter::new(data))),
            store: None,
            key: String::new(),
            defaults: FilterData::default_rules,
        }
    }

    /// Loads persisted rules from `store`, falling back to `defaults` when the
    /// blob is missing or unreadable.
    pub fn load(store: Arc<dyn KvStore>, key: &str, defaults: fn() -> FilterData) -> Self {
        let data = match store.get(key) {
            Some(blob) => match serde_json::from_str::<FilterData>(&blob) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Stored filter {} is corrupt, using defaults: {}", key, e);
                    defaults()
                }
            },
            None => {
                debug!("No stored filter under {}, using defaults", key);
                defaults()
            }
        };
        Self {
            compiled: RwLock::new(Arc::new(CompiledFilter::new(data))),
            store: Some(store),
            key: key.to_string(),
            defaults,
        }
    }

    fn snapshot(&self) -> Arc<CompiledFilter> {
        self.compiled.read().clone()
    }

    pub fn data(&self) -> FilterData {
        self.snapshot().data.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().data.is_empty()
    }

    /// Replaces the rule set; visible to the next evaluation.
    pub fn update(&self, mut data: FilterData) {
        for item in &mut data.exclude_methods {
            for method in &mut item.group {
                *method = method.trim().to_ascii_uppercase();
            }
        }
        let compiled = Arc::new(CompiledFilter::new(data));
        *self.compiled.write() = compiled;
        if let Err(e) = self.save() {
            warn!("Failed to persist filter {}: {}", self.key, e);
        }
    }

    /// Resets to the default rules and persists them.
    pub fn recover(&self) {
        info!("Recovering filter {} to defaults", self.key);
        self.update((self.defaults)());
    }

    pub fn save(&self) -> Result<(), MitmError> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let blob = serde_json::to_string(&self.snapshot().data)?;
        store.set(&self.key, &blob)?;
        Ok(())
    }

    /// Whether a request is in scope. `host` may carry a port; host rules
    /// are tried against both forms.
    pub fn is_passed(&self, method: &str, host: &str, url: &str, ext: &str) -> bool {
        let filter = self.snapshot();

        let method = method.to_ascii_uppercase();
        if filter.exclude_methods.any(&[&method]) {
            return false;
        }

        let bare_host = strip_port(host);
        if !CompiledFilter::dimension(
            &filter.include_hostnames,
            &filter.exclude_hostnames,
            &[host, bare_host],
        ) {
            return false;
        }

        if !CompiledFilter::dimension(&filter.include_uri, &filter.exclude_uri, &[url]) {
            return false;
        }

        let path = crate::packet::url_path(url);
        let ext = normalize_ext(ext);
        CompiledFilter::dimension(
            &filter.include_suffix,
            &filter.exclude_suffix,
            &[&ext, &path],
        )
    }

    pub fn is_mime_passed(&self, content_type: &str) -> bool {
        !self.snapshot().exclude_mime.any(&[content_type])
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return host
            .find(']')
            .map(|end| &host[..=end])
            .unwrap_or(host);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

fn normalize_ext(ext: &str) -> String {
    let ext = ext.trim();
    if ext.is_empty() || ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{}", ext)
    }
}
