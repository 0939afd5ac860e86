//! Per-model sliding-window admission control.
//!
//! Each normalized model key owns a window (60 seconds by default) of accepted
//! `(timestamp, tokens)` entries and a `(requests_per_minute, tokens_per_minute)`
//! limit. A check prunes expired entries, then admits the call only if both the
//! request count and the token sum stay within the limit.
//!
//! Check-and-commit runs under a single mutex per model key, so two concurrent
//! callers can never both pass the same remaining capacity.
//!
//! # Persistence
//!
//! When built with [`RateLimiter::with_persistence`] the window state is loaded
//! from a JSON file (expired entries discarded) and written back by
//! [`RateLimiter::save`]. Saving **merges** the in-memory entries with whatever
//! another process has written to the same file since, so concurrently recorded
//! requests are never dropped by a last-writer-wins overwrite. Load, save and clear
//! hold an exclusive lock on a sibling `.lock` file for the whole read-merge-write.
//!
//! # Example
//!
//! ```rust
//! use llmpanel::rate_limiter::{RateLimit, RateLimiter};
//!
//! let limiter = RateLimiter::new().with_limit("gpt-4o", RateLimit::new(2, 10_000));
//!
//! assert!(limiter.check_allowance("gpt-4o", 100, 100, true).is_ok());
//! assert!(limiter.check_allowance("gpt-4o", 100, 100, true).is_ok());
//! let err = limiter.check_allowance("gpt-4o", 100, 100, true).unwrap_err();
//! assert!(err.retry_after.as_secs() <= 60);
//! ```

use crate::models::normalize_model;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Default sliding window length.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Request and token ceilings for one model within one window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub requests_per_minute: u32,
    pub tokens_per_minute: u64,
}

impl RateLimit {
    /// Applied to models that have no configured limit.
    pub const CONSERVATIVE: RateLimit = RateLimit {
        requests_per_minute: 10,
        tokens_per_minute: 10_000,
    };

    pub const fn new(requests_per_minute: u32, tokens_per_minute: u64) -> Self {
        Self {
            requests_per_minute,
            tokens_per_minute,
        }
    }
}

fn default_limits() -> HashMap<String, RateLimit> {
    let entries: &[(&str, RateLimit)] = &[
        ("gpt-4o", RateLimit::new(500, 30_000)),
        ("gpt-4o-mini", RateLimit::new(500, 200_000)),
        ("gpt-4.1", RateLimit::new(500, 30_000)),
        ("gpt-4.1-mini", RateLimit::new(500, 200_000)),
        ("gpt-4.1-nano", RateLimit::new(500, 200_000)),
        ("claude-opus-4", RateLimit::new(50, 20_000)),
        ("claude-sonnet-4", RateLimit::new(50, 40_000)),
        ("claude-3-5-sonnet", RateLimit::new(50, 40_000)),
        ("claude-3-5-haiku", RateLimit::new(50, 50_000)),
        ("gemini-1.5-pro", RateLimit::new(150, 1_000_000)),
        ("gemini-2.0-flash", RateLimit::new(2_000, 4_000_000)),
        ("grok-2", RateLimit::new(60, 100_000)),
        ("dall-e-3", RateLimit::new(5, 1_000_000)),
    ];
    entries
        .iter()
        .map(|(model, limit)| (model.to_string(), *limit))
        .collect()
}

/// One accepted request inside a model's window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindowEntry {
    pub timestamp: DateTime<Utc>,
    pub tokens: u64,
}

/// Which ceiling rejected a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitKind {
    Requests,
    Tokens,
    Both,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Requests => write!(f, "requests per minute"),
            LimitKind::Tokens => write!(f, "tokens per minute"),
            LimitKind::Both => write!(f, "requests and tokens per minute"),
        }
    }
}

/// A call was refused by the rate limiter.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("rate limit exceeded for '{model}' ({binding}); retry after {:.2}s", .retry_after.as_secs_f64())]
pub struct RateLimitExceeded {
    /// Normalized model key.
    pub model: String,
    pub binding: LimitKind,
    /// Time until enough capacity frees up for this request.
    pub retry_after: Duration,
    pub current_requests: u32,
    pub current_tokens: u64,
    pub limit: RateLimit,
}

/// Snapshot of a model's window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowUsage {
    pub requests: u32,
    pub tokens: u64,
    pub limit: RateLimit,
}

#[derive(Default)]
struct ModelWindow {
    entries: VecDeque<RateWindowEntry>,
}

impl ModelWindow {
    fn prune(&mut self, now: DateTime<Utc>, window: chrono::Duration) {
        while let Some(front) = self.entries.front() {
            if front.timestamp + window <= now {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn request_count(&self) -> u32 {
        self.entries.len() as u32
    }

    fn token_sum(&self) -> u64 {
        self.entries.iter().map(|e| e.tokens).sum()
    }

    fn insert(&mut self, entry: RateWindowEntry) {
        // Entries normally arrive in order; out-of-order stamps only come from merges.
        let pos = self
            .entries
            .iter()
            .rposition(|e| e.timestamp <= entry.timestamp)
            .map(|p| p + 1)
            .unwrap_or(0);
        self.entries.insert(pos, entry);
    }
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedState {
    saved_at: Option<DateTime<Utc>>,
    models: HashMap<String, Vec<RateWindowEntry>>,
}

/// Sliding-window rate limiter shared by every dispatcher in the process.
pub struct RateLimiter {
    window: Duration,
    default_limit: RateLimit,
    limits: RwLock<HashMap<String, RateLimit>>,
    windows: Mutex<HashMap<String, Arc<Mutex<ModelWindow>>>>,
    state_path: Option<PathBuf>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// In-memory limiter with the built-in limit table and a 60 second window.
    pub fn new() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            default_limit: RateLimit::CONSERVATIVE,
            limits: RwLock::new(default_limits()),
            windows: Mutex::new(HashMap::new()),
            state_path: None,
        }
    }

    /// Limiter backed by a JSON state file. Existing non-expired entries are loaded.
    pub fn with_persistence(path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut limiter = Self::new();
        limiter.state_path = Some(path.into());
        limiter.load()?;
        Ok(limiter)
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_default_limit(mut self, limit: RateLimit) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_limit(self, model: &str, limit: RateLimit) -> Self {
        self.set_limit(model, limit);
        self
    }

    pub fn set_limit(&self, model: &str, limit: RateLimit) {
        let mut limits = self.limits.write().unwrap_or_else(|e| e.into_inner());
        limits.insert(normalize_model(model), limit);
    }

    pub fn limit_for(&self, model: &str) -> RateLimit {
        let limits = self.limits.read().unwrap_or_else(|e| e.into_inner());
        limits
            .get(&normalize_model(model))
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    /// Check whether a call may proceed now.
    ///
    /// With `commit = true` an admitted call is recorded atomically with the check.
    /// With `commit = false` nothing is recorded.
    pub fn check_allowance(
        &self,
        model: &str,
        input_tokens: usize,
        estimated_output_tokens: usize,
        commit: bool,
    ) -> Result<(), RateLimitExceeded> {
        self.check_allowance_at(model, input_tokens, estimated_output_tokens, commit, Utc::now())
    }

    /// [`check_allowance`](Self::check_allowance) evaluated at an explicit instant.
    pub fn check_allowance_at(
        &self,
        model: &str,
        input_tokens: usize,
        estimated_output_tokens: usize,
        commit: bool,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitExceeded> {
        let tokens = (input_tokens + estimated_output_tokens) as u64;
        let key = normalize_model(model);
        let limit = self.limit_for(&key);
        let slot = self.window_for(&key);

        let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(now, self.chrono_window());
        self.evaluate(&key, &window, limit, 1, tokens, now)?;

        if commit {
            window.insert(RateWindowEntry {
                timestamp: now,
                tokens,
            });
            log::debug!(
                "RateLimiter: admitted '{}' ({} tokens, {}/{} requests in window)",
                key,
                tokens,
                window.request_count(),
                limit.requests_per_minute
            );
        }
        Ok(())
    }

    /// Dry-run check for `requests` calls totalling `tokens` tokens. Never records.
    pub fn check_capacity(
        &self,
        model: &str,
        requests: u32,
        tokens: u64,
    ) -> Result<(), RateLimitExceeded> {
        let now = Utc::now();
        let key = normalize_model(model);
        let limit = self.limit_for(&key);
        let slot = self.window_for(&key);

        let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(now, self.chrono_window());
        self.evaluate(&key, &window, limit, requests, tokens, now)
    }

    /// Current request count and token sum for a model.
    pub fn usage(&self, model: &str) -> WindowUsage {
        let key = normalize_model(model);
        let limit = self.limit_for(&key);
        let slot = self.window_for(&key);
        let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
        window.prune(Utc::now(), self.chrono_window());
        WindowUsage {
            requests: window.request_count(),
            tokens: window.token_sum(),
            limit,
        }
    }

    /// Drop all in-memory windows and delete the persisted state file.
    pub fn clear(&self) -> io::Result<()> {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        if let Some(path) = &self.state_path {
            let _lock = StateLock::acquire(path)?;
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Merge persisted entries into memory, discarding anything already expired.
    pub fn load(&self) -> io::Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let disk = {
            let _lock = StateLock::acquire(path)?;
            read_state(path)?
        };
        let now = Utc::now();
        let window_len = self.chrono_window();

        for (key, entries) in disk.models {
            let slot = self.window_for(&key);
            let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
            window.prune(now, window_len);
            let fresh: Vec<RateWindowEntry> = entries
                .into_iter()
                .filter(|e| e.timestamp + window_len > now)
                .collect();
            window.entries = merge_entries(&window.entries, &fresh);
        }
        Ok(())
    }

    /// Persist the window state, merging with whatever is already on disk.
    ///
    /// The merged view is also absorbed into memory, so admissions made after a save
    /// account for requests recorded by other processes sharing the file.
    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.state_path else {
            return Ok(());
        };
        let _lock = StateLock::acquire(path)?;
        let disk = read_state(path)?;
        let now = Utc::now();
        let window_len = self.chrono_window();

        let mut keys: Vec<String> = {
            let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
            windows.keys().cloned().collect()
        };
        for key in disk.models.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut state = PersistedState {
            saved_at: Some(now),
            models: HashMap::new(),
        };
        for key in keys {
            let fresh_disk: Vec<RateWindowEntry> = disk
                .models
                .get(&key)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|e| e.timestamp + window_len > now)
                        .copied()
                        .collect()
                })
                .unwrap_or_default();

            let slot = self.window_for(&key);
            let mut window = slot.lock().unwrap_or_else(|e| e.into_inner());
            window.prune(now, window_len);
            window.entries = merge_entries(&window.entries, &fresh_disk);
            if !window.entries.is_empty() {
                state
                    .models
                    .insert(key, window.entries.iter().copied().collect());
            }
        }

        write_state(path, &state)?;
        log::debug!(
            "RateLimiter: saved {} model window(s) to {}",
            state.models.len(),
            path.display()
        );
        Ok(())
    }

    fn chrono_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::seconds(60))
    }

    fn window_for(&self, key: &str) -> Arc<Mutex<ModelWindow>> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ModelWindow::default())))
            .clone()
    }

    fn evaluate(
        &self,
        key: &str,
        window: &ModelWindow,
        limit: RateLimit,
        requests: u32,
        tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<(), RateLimitExceeded> {
        let current_requests = window.request_count();
        let current_tokens = window.token_sum();
        let over_requests = current_requests + requests > limit.requests_per_minute;
        let over_tokens = current_tokens + tokens > limit.tokens_per_minute;

        if !over_requests && !over_tokens {
            return Ok(());
        }

        let mut retry_after = Duration::ZERO;
        if over_requests {
            retry_after = retry_after.max(self.request_retry_after(window, limit, requests, now));
        }
        if over_tokens {
            retry_after = retry_after.max(self.token_retry_after(window, limit, tokens, now));
        }

        let binding = match (over_requests, over_tokens) {
            (true, true) => LimitKind::Both,
            (true, false) => LimitKind::Requests,
            _ => LimitKind::Tokens,
        };
        log::warn!(
            "RateLimiter: rejected '{}' ({}), retry after {:.2}s",
            key,
            binding,
            retry_after.as_secs_f64()
        );

        Err(RateLimitExceeded {
            model: key.to_string(),
            binding,
            retry_after,
            current_requests,
            current_tokens,
            limit,
        })
    }

    /// Wait until enough of the oldest requests age out to fit `requests` more.
    fn request_retry_after(
        &self,
        window: &ModelWindow,
        limit: RateLimit,
        requests: u32,
        now: DateTime<Utc>,
    ) -> Duration {
        let must_expire =
            (window.request_count() + requests).saturating_sub(limit.requests_per_minute) as usize;
        if must_expire == 0 || must_expire > window.entries.len() {
            return self.window;
        }
        self.age_out(&window.entries[must_expire - 1], now)
    }

    /// Wait until enough accumulated tokens age out to fit `incoming`.
    ///
    /// If `incoming` alone exceeds the token ceiling no prefix of the window can ever
    /// satisfy it; the full window is returned as a conservative answer.
    fn token_retry_after(
        &self,
        window: &ModelWindow,
        limit: RateLimit,
        incoming: u64,
        now: DateTime<Utc>,
    ) -> Duration {
        if incoming > limit.tokens_per_minute {
            return self.window;
        }
        let needed = (window.token_sum() + incoming).saturating_sub(limit.tokens_per_minute);
        let mut freed = 0u64;
        for entry in &window.entries {
            freed += entry.tokens;
            if freed >= needed {
                return self.age_out(entry, now);
            }
        }
        self.window
    }

    fn age_out(&self, entry: &RateWindowEntry, now: DateTime<Utc>) -> Duration {
        (entry.timestamp + self.chrono_window() - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Multiset union of two time-ordered entry lists.
///
/// An identical `(timestamp, tokens)` pair present in both lists is kept once per
/// occurrence in whichever side has more of it, which collapses entries that were
/// previously loaded from or saved to the same file.
fn merge_entries(
    memory: &VecDeque<RateWindowEntry>,
    disk: &[RateWindowEntry],
) -> VecDeque<RateWindowEntry> {
    let mut counts: BTreeMap<(DateTime<Utc>, u64), (usize, usize)> = BTreeMap::new();
    for e in memory {
        counts.entry((e.timestamp, e.tokens)).or_default().0 += 1;
    }
    for e in disk {
        counts.entry((e.timestamp, e.tokens)).or_default().1 += 1;
    }

    let mut merged = VecDeque::new();
    for ((timestamp, tokens), (in_memory, on_disk)) in counts {
        for _ in 0..in_memory.max(on_disk) {
            merged.push_back(RateWindowEntry { timestamp, tokens });
        }
    }
    merged
}

/// Exclusive advisory lock on `<state>.lock`, released on drop.
struct StateLock {
    file: fs::File,
}

impl StateLock {
    fn acquire(state_path: &Path) -> io::Result<Self> {
        let lock_path = state_path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            log::warn!("RateLimiter: failed to release state lock: {}", e);
        }
    }
}

fn read_state(path: &Path) -> io::Result<PersistedState> {
    match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => Ok(PersistedState::default()),
        Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("Failed to parse rate limiter state: {}", e),
            )
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(PersistedState::default()),
        Err(e) => Err(e),
    }
}

fn write_state(path: &Path, state: &PersistedState) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| io::Error::other(format!("Failed to serialize rate limiter state: {}", e)))?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(now: DateTime<Utc>, secs_ago: i64, tokens: u64) -> RateWindowEntry {
        RateWindowEntry {
            timestamp: now - chrono::Duration::seconds(secs_ago),
            tokens,
        }
    }

    #[test]
    fn test_merge_keeps_both_sides() {
        let now = Utc::now();
        let memory: VecDeque<_> = vec![entry(now, 10, 5), entry(now, 5, 5)].into();
        let disk = vec![entry(now, 10, 5), entry(now, 7, 9)];
        let merged = merge_entries(&memory, &disk);
        assert_eq!(merged.len(), 3);
        assert!(merged
            .iter()
            .zip(merged.iter().skip(1))
            .all(|(a, b)| a.timestamp <= b.timestamp));
    }

    #[test]
    fn test_merge_preserves_same_side_duplicates() {
        let now = Utc::now();
        let memory: VecDeque<_> = vec![entry(now, 1, 5), entry(now, 1, 5)].into();
        let merged = merge_entries(&memory, &[]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_prune_drops_expired() {
        let now = Utc::now();
        let mut window = ModelWindow {
            entries: vec![entry(now, 61, 1), entry(now, 60, 1), entry(now, 59, 1)].into(),
        };
        window.prune(now, chrono::Duration::seconds(60));
        assert_eq!(window.request_count(), 1);
    }
}
