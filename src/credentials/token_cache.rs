//! In-memory bearer token cache.
//!
//! Tokens are keyed by their own value and carry an absolute expiry.  Expired
//! entries are not swept on a schedule; they are reaped whenever
//! [`TokenCache::find_valid`] scans the map.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::trace;

/// A bearer credential together with the instant it stops being usable.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(secret: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            secret: secret.into(),
            expires_at,
        }
    }

    /// A token is usable only while `now` is strictly before its expiry.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Process-lifetime store of issued tokens, shared by every request.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the entry for `token`.
    pub fn put(&self, token: &str, expires_at: DateTime<Utc>) {
        self.lock().insert(token.to_string(), expires_at);
        trace!(%expires_at, "token cached");
    }

    /// `true` when at least one entry is stored, expired or not.
    pub fn has_any(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Return a token that is still valid now, reaping expired entries.
    pub fn find_valid(&self) -> Option<AccessToken> {
        self.find_valid_at(Utc::now())
    }

    /// Same as [`find_valid`](Self::find_valid) against an explicit clock.
    ///
    /// Expired keys are collected during the scan and removed afterwards, all
    /// under one lock acquisition.
    pub fn find_valid_at(&self, now: DateTime<Utc>) -> Option<AccessToken> {
        let mut entries = self.lock();

        let mut expired = Vec::new();
        let mut found = None;
        for (token, expires_at) in entries.iter() {
            if now < *expires_at {
                if found.is_none() {
                    found = Some(AccessToken::new(token.clone(), *expires_at));
                }
            } else {
                expired.push(token.clone());
            }
        }

        for token in &expired {
            entries.remove(token);
        }
        if !expired.is_empty() {
            trace!(reaped = expired.len(), "expired tokens removed");
        }

        found
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DateTime<Utc>>> {
        // A poisoned map is still structurally sound: every mutation is a
        // single insert or remove.
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
