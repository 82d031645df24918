//! # Routing Cache
//!
//! The in-process half of the three-layer routing cache plus the key and
//! similarity primitives shared with the durable layers:
//!
//! - **L1**: [`RouteCache`], a bounded in-process map with per-entry TTL.
//! - **L2**: durable exact-key store, reached through
//!   [`crate::stores::RouteCacheStore`]; keys are the same MD5 digests.
//! - **L3**: semantic search over durable entries that carry embeddings,
//!   ranked by [`cosine_similarity`].
//!
//! Keys are built from the *normalized* user message so trivially different
//! phrasings ("你好！" vs "你好") share an entry. Normalization is idempotent.

use md5::{Digest, Md5};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::TaskType;

/// Default L1 capacity.
pub const DEFAULT_L1_CAPACITY: usize = 10_000;
/// Default L1 entry TTL.
pub const DEFAULT_L1_TTL: Duration = Duration::from_secs(300);

/// Normalize message content for cache-key purposes.
///
/// Lowercases, maps full-width/CJK punctuation to ASCII, collapses
/// whitespace runs to single spaces, trims, and strips trailing sentence
/// punctuation (`.`, `!`, `?`).
pub fn normalize_content(input: &str) -> String {
    let lowered = input.to_lowercase();
    let mapped: String = lowered.chars().map(map_cjk_punct).collect();
    let collapsed = mapped.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(['.', '!', '?'])
        .trim()
        .to_string()
}

fn map_cjk_punct(c: char) -> char {
    match c {
        '，' | '、' => ',',
        '。' => '.',
        '！' => '!',
        '？' => '?',
        '：' => ':',
        '；' => ';',
        '“' | '”' | '「' | '」' | '『' | '』' => '"',
        '‘' | '’' => '\'',
        '（' => '(',
        '）' => ')',
        '【' => '[',
        '】' => ']',
        '《' => '<',
        '》' => '>',
        '　' => ' ',
        other => other,
    }
}

/// Cache key for a user message: lowercase hex MD5 of the normalized text.
/// System content is deliberately not part of the key.
pub fn cache_key(message: &str) -> String {
    let normalized = normalize_content(message);
    let mut hasher = Md5::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cosine similarity of two vectors.
///
/// Returns 0.0 for empty inputs, mismatched lengths, or zero-magnitude
/// vectors, so callers can treat "no signal" and "orthogonal" alike.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || b.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += *x as f64 * *y as f64;
        norm_a += *x as f64 * *x as f64;
        norm_b += *y as f64 * *y as f64;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

/// A cached routing outcome held in L1.
#[derive(Debug, Clone)]
pub struct CachedRoute {
    pub task_type: TaskType,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct L1Entry {
    route: CachedRoute,
    expires_at: Instant,
}

/// Bounded in-process routing cache with per-entry TTL.
///
/// Inserting into a full cache first drops expired entries; if the cache is
/// still at capacity it drops the roughly 10% of entries closest to expiry.
pub struct RouteCache {
    entries: Mutex<HashMap<String, L1Entry>>,
    capacity: usize,
    ttl: Duration,
}

impl RouteCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Look up a key, dropping it if expired.
    pub fn get(&self, key: &str) -> Option<CachedRoute> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.route.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a routing outcome, evicting under capacity pressure.
    pub fn insert(&self, key: &str, task_type: TaskType, reason: &str) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();

        if !entries.contains_key(key) && entries.len() >= self.capacity {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.capacity {
                let evict = (self.capacity / 10).max(1);
                let mut by_expiry: Vec<(String, Instant)> = entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.expires_at))
                    .collect();
                by_expiry.sort_by_key(|(_, exp)| *exp);
                for (k, _) in by_expiry.into_iter().take(evict) {
                    entries.remove(&k);
                }
            }
        }

        entries.insert(
            key.to_string(),
            L1Entry {
                route: CachedRoute {
                    task_type,
                    reason: reason.to_string(),
                },
                expires_at: now + self.ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

impl Default for RouteCache {
    fn default() -> Self {
        Self::new(DEFAULT_L1_CAPACITY, DEFAULT_L1_TTL)
    }
}
