// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{collections::BTreeMap, sync::Arc};

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{cfg::config::ServerConfig, utils::random_token};

const SESSION_ID_LEN: usize = 32;
const CSRF_TOKEN_LEN: usize = 32;
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// One browser session, keyed by a random opaque id.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub expires_at: i64,
    pub csrf_token: String,
    pub data: BTreeMap<String, String>,
}

/// Owner of all sessions. Handlers only ever see snapshots; mutations come
/// back as update sets and are applied here under the size bounds.
pub struct SessionManager {
    cfg: ServerConfig,
    sessions: DashMap<String, Session>,
}

impl SessionManager {
    pub fn new(cfg: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            sessions: DashMap::new(),
        })
    }

    /// Loads the session named by the request cookie, or mints a fresh one.
    /// Touching extends the expiry.
    pub fn get_or_create(&self, cookie: Option<&str>) -> Session {
        let now = Utc::now().timestamp_millis();
        let idle_ms = self.cfg.session_idle.as_millis() as i64;

        if let Some(id) = cookie {
            if let Some(mut entry) = self.sessions.get_mut(id) {
                if entry.expires_at > now {
                    entry.last_activity_at = now;
                    entry.expires_at = now + idle_ms;
                    return entry.clone();
                }
            }
        }

        let session = Session {
            id: random_token(SESSION_ID_LEN),
            created_at: now,
            last_activity_at: now,
            expires_at: now + idle_ms,
            csrf_token: random_token(CSRF_TOKEN_LEN),
            data: BTreeMap::new(),
        };
        self.sessions.insert(session.id.clone(), session.clone());
        session
    }

    /// Applies handler updates under the per-entry and total bounds.
    /// Oversized writes are skipped, not truncated.
    pub fn persist(&self, id: &str, updates: &BTreeMap<String, Option<String>>) {
        let Some(mut session) = self.sessions.get_mut(id) else {
            // Session expired mid-request; its updates die with it.
            debug!(id, "persist on a gone session");
            return;
        };

        for (key, update) in updates {
            match update {
                None => {
                    session.data.remove(key);
                },
                Some(value) => {
                    if key.len() + value.len() > self.cfg.session_entry_bytes_max {
                        warn!(key, "session entry over size bound, skipped");
                        continue;
                    }
                    let projected: usize = session
                        .data
                        .iter()
                        .filter(|(k, _)| *k != key)
                        .map(|(k, v)| k.len() + v.len())
                        .sum::<usize>()
                        + key.len()
                        + value.len();
                    if projected > self.cfg.session_total_bytes_max {
                        warn!(key, "session total size bound hit, write skipped");
                        continue;
                    }
                    session.data.insert(key.clone(), value.clone());
                },
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn sweep(&self, now_ms: i64) {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| s.expires_at > now_ms);
        let expired = before - self.sessions.len();
        if expired > 0 {
            debug!(expired, "session sweep");
        }
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(SWEEP_INTERVAL) => {},
                }
                manager.sweep(Utc::now().timestamp_millis());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_round_trip() {
        let mgr = SessionManager::new(ServerConfig::default());
        let created = mgr.get_or_create(None);
        let loaded = mgr.get_or_create(Some(&created.id));
        assert_eq!(created.id, loaded.id);
        assert_eq!(created.csrf_token, loaded.csrf_token);
    }

    #[test]
    fn test_unknown_cookie_mints_new() {
        let mgr = SessionManager::new(ServerConfig::default());
        let s = mgr.get_or_create(Some("bogus"));
        assert_ne!(s.id, "bogus");
    }

    #[test]
    fn test_persist_respects_entry_bound() {
        let mgr = SessionManager::new(ServerConfig::default());
        let s = mgr.get_or_create(None);

        let mut updates = BTreeMap::new();
        updates.insert("small".to_string(), Some("v".to_string()));
        updates.insert("big".to_string(), Some("x".repeat(4096)));
        mgr.persist(&s.id, &updates);

        let stored = mgr.get(&s.id).expect("session");
        assert!(stored.data.contains_key("small"));
        assert!(!stored.data.contains_key("big"));
    }

    #[test]
    fn test_persist_remove() {
        let mgr = SessionManager::new(ServerConfig::default());
        let s = mgr.get_or_create(None);

        let mut updates = BTreeMap::new();
        updates.insert("k".to_string(), Some("v".to_string()));
        mgr.persist(&s.id, &updates);
        updates.insert("k".to_string(), None);
        mgr.persist(&s.id, &updates);

        assert!(mgr.get(&s.id).expect("session").data.is_empty());
    }

    #[test]
    fn test_sweep_expires_sessions() {
        let mgr = SessionManager::new(ServerConfig::default());
        let s = mgr.get_or_create(None);
        mgr.sweep(s.expires_at + 1);
        assert!(mgr.get(&s.id).is_none());
    }
}
