//! Model naming, provider attribution and a small LRU metadata cache.
//!
//! Every component that keys state by model (the price table, rate-limit windows,
//! ledger aggregates) goes through [`normalize_model`] first so that `"GPT 4o"`,
//! `"gpt_4o"` and `"gpt-4o"` all land on the same key.

use crate::cost::Pricing;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Shorthands and version spellings resolved after basic normalization.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("gpt4o", "gpt-4o"),
    ("gpt-4o-latest", "gpt-4o"),
    ("chatgpt-4o-latest", "gpt-4o"),
    ("4o-mini", "gpt-4o-mini"),
    ("gpt4o-mini", "gpt-4o-mini"),
    ("gpt-4.1-latest", "gpt-4.1"),
    ("claude-3.5-sonnet", "claude-3-5-sonnet"),
    ("claude-3.5-haiku", "claude-3-5-haiku"),
    ("claude-sonnet-4.0", "claude-sonnet-4"),
    ("claude-4-sonnet", "claude-sonnet-4"),
    ("claude-opus-4.0", "claude-opus-4"),
    ("claude-4-opus", "claude-opus-4"),
    ("sonnet", "claude-sonnet-4"),
    ("opus", "claude-opus-4"),
    ("haiku", "claude-3-5-haiku"),
    ("gemini-pro", "gemini-1.5-pro"),
    ("gemini-flash", "gemini-2.0-flash"),
    ("grok", "grok-2"),
    ("dalle-3", "dall-e-3"),
    ("dall-e3", "dall-e-3"),
    ("dalle-2", "dall-e-2"),
];

/// Normalize a user supplied model name into the canonical lookup key.
///
/// Lower-cases, turns whitespace and underscores into hyphens, collapses repeated
/// hyphens, drops trailing `-YYYYMMDD` / `-YYYY-MM-DD` snapshot suffixes and finally
/// resolves the alias table. The result is a fixed point: normalizing a key again
/// returns it unchanged.
///
/// ```rust
/// use llmpanel::models::normalize_model;
///
/// assert_eq!(normalize_model("GPT 4o"), "gpt-4o");
/// assert_eq!(normalize_model("claude_3.5_sonnet"), "claude-3-5-sonnet");
/// assert_eq!(normalize_model("claude-3-5-sonnet-20241022"), "claude-3-5-sonnet");
/// assert_eq!(normalize_model("gpt-4o-2024-08-06"), "gpt-4o");
/// ```
pub fn normalize_model(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    for c in name.trim().chars() {
        let c = if c.is_whitespace() || c == '_' { '-' } else { c };
        if c == '-' && key.ends_with('-') {
            continue;
        }
        key.extend(c.to_lowercase());
    }
    let mut key = key.trim_matches('-').to_string();
    while let Some(len) = snapshot_stem_len(&key) {
        key.truncate(len);
    }

    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == key)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(key)
}

/// Length of `key` without its trailing date suffix, if it has one.
fn snapshot_stem_len(key: &str) -> Option<usize> {
    fn digits(s: &str) -> bool {
        !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
    }
    let parts: Vec<&str> = key.rsplitn(4, '-').collect();
    match parts.as_slice() {
        [day, month, year, stem]
            if !stem.is_empty()
                && year.len() == 4
                && month.len() == 2
                && day.len() == 2
                && digits(year)
                && digits(month)
                && digits(day) =>
        {
            Some(stem.len())
        }
        [date, stem, ..] if !stem.is_empty() && date.len() == 8 && digits(date) => {
            Some(key.len() - date.len() - 1)
        }
        _ => None,
    }
}

/// Best-effort provider attribution for a normalized model key.
pub fn provider_for(model_key: &str) -> Option<&'static str> {
    if model_key.starts_with("gpt-")
        || model_key.starts_with("o1")
        || model_key.starts_with("o3")
        || model_key.starts_with("dall-e")
    {
        Some("openai")
    } else if model_key.starts_with("claude-") {
        Some("anthropic")
    } else if model_key.starts_with("gemini-") {
        Some("google")
    } else if model_key.starts_with("grok-") {
        Some("xai")
    } else {
        None
    }
}

/// Metadata resolved once per model name and reused for subsequent calls.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInfo {
    /// Canonical key produced by [`normalize_model`].
    pub key: String,
    /// Provider label recorded on ledger transactions.
    pub provider: String,
    /// Price table entry, `None` for unpriced models.
    pub pricing: Option<Pricing>,
}

struct LruInner {
    entries: HashMap<String, ModelInfo>,
    order: VecDeque<String>,
}

/// Bounded least-recently-used cache of [`ModelInfo`] keyed by the raw model name.
pub struct ModelCache {
    capacity: usize,
    inner: Mutex<LruInner>,
}

impl ModelCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(LruInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Return the cached entry for `name`, resolving and inserting it on a miss.
    ///
    /// The least recently used entry is evicted when the cache is full.
    pub fn resolve<F>(&self, name: &str, resolve: F) -> ModelInfo
    where
        F: FnOnce(&str) -> ModelInfo,
    {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(info) = inner.entries.get(name).cloned() {
            if let Some(pos) = inner.order.iter().position(|k| k == name) {
                inner.order.remove(pos);
            }
            inner.order.push_back(name.to_string());
            return info;
        }

        let info = resolve(&normalize_model(name));
        if inner.entries.len() >= self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                log::debug!("ModelCache: evicting '{}'", oldest);
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(name.to_string(), info.clone());
        inner.order.push_back(name.to_string());
        info
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .contains_key(name)
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(32)
    }
}
