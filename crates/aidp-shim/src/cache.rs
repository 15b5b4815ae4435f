// SPDX-License-Identifier: MIT OR Apache-2.0
//! The shim's token cache.
//!
//! Entries are FRESH until 30 seconds before expiry, then STALE; a stale
//! entry is simply overwritten by the next mint (evicted on refresh).
//! Double-mint races are tolerated; the losing writer's token is
//! discarded by the overwrite.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// Refresh skew: tokens are considered stale this long before `exp`.
pub const REFRESH_SKEW_SECS: i64 = 30;

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: i64,
}

/// Key for one cache entry.
///
/// Intent-mode entries are per `(workflow, agent, audience, scopes)`;
/// OAuth entries per `(app, audience, scopes)`. The mode prefix keeps the
/// two spaces disjoint.
#[must_use]
pub fn cache_key(mode: &str, parts: &[&str]) -> String {
    let mut key = String::from(mode);
    for part in parts {
        if !part.is_empty() {
            key.push('|');
            key.push_str(part);
        }
    }
    key
}

/// Mutex-guarded token cache.
#[derive(Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, CachedToken>>,
}

impl TokenCache {
    /// A fresh cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A still-fresh token for `key`, if any.
    #[must_use]
    pub fn get_fresh(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().expect("token cache lock poisoned");
        let entry = entries.get(key)?;
        let now = chrono::Utc::now().timestamp();
        if now < entry.expires_at - REFRESH_SKEW_SECS {
            debug!(key, "token cache hit");
            Some(entry.access_token.clone())
        } else {
            None
        }
    }

    /// Store a freshly minted token.
    pub fn store(&self, key: &str, access_token: &str, expires_in_secs: u64) {
        let mut entries = self.entries.lock().expect("token cache lock poisoned");
        entries.insert(
            key.to_string(),
            CachedToken {
                access_token: access_token.to_string(),
                expires_at: chrono::Utc::now().timestamp() + expires_in_secs as i64,
            },
        );
        debug!(key, expires_in_secs, "token cached");
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("token cache lock poisoned")
            .clear();
    }
}
