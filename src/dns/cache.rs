// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{cfg::config::DnsConfig, dns::record::DnsRecord};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Fresh,
    /// Past TTL but inside the stale grace; usable while a refresh runs.
    Stale,
}

#[derive(Debug, Clone)]
pub struct CacheHit {
    pub record: DnsRecord,
    pub state: CacheState,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    record: DnsRecord,
    fresh_until: Instant,
    stale_until: Instant,
}

/// TTL cache of records learned from peers, plus a short negative cache so
/// a name that just failed to resolve does not trigger a query storm.
pub struct DnsCache {
    cfg: DnsConfig,
    entries: DashMap<String, CacheEntry>,
    negative: DashMap<String, Instant>,
}

impl DnsCache {
    pub fn new(cfg: DnsConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            entries: DashMap::new(),
            negative: DashMap::new(),
        })
    }

    pub fn get(&self, name: &str) -> Option<CacheHit> {
        let key = name.to_ascii_lowercase();
        let now = Instant::now();

        let hit = {
            let entry = self.entries.get(&key)?;
            if now < entry.fresh_until {
                Some(CacheHit {
                    record: entry.record.clone(),
                    state: CacheState::Fresh,
                })
            } else if now < entry.stale_until {
                Some(CacheHit {
                    record: entry.record.clone(),
                    state: CacheState::Stale,
                })
            } else {
                None
            }
        };
        if hit.is_none() {
            self.entries.remove(&key);
        }
        hit
    }

    /// Stores a record with `ttl`, clamped to the local maximum; `None`
    /// uses the default TTL.
    pub fn set(&self, name: &str, record: DnsRecord, ttl: Option<Duration>) {
        let key = name.to_ascii_lowercase();
        let ttl = ttl
            .unwrap_or(self.cfg.cache_ttl)
            .min(self.cfg.max_cache_ttl);
        let now = Instant::now();
        self.negative.remove(&key);
        self.entries.insert(
            key,
            CacheEntry {
                record,
                fresh_until: now + ttl,
                stale_until: now + ttl + self.cfg.stale_grace,
            },
        );
    }

    pub fn purge(&self, name: &str) {
        self.entries.remove(&name.to_ascii_lowercase());
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.negative.clear();
    }

    pub fn put_negative(&self, name: &str) {
        self.negative.insert(
            name.to_ascii_lowercase(),
            Instant::now() + self.cfg.negative_ttl,
        );
    }

    pub fn is_negative(&self, name: &str) -> bool {
        let key = name.to_ascii_lowercase();
        let state = self.negative.get(&key).map(|until| Instant::now() < *until);
        match state {
            Some(true) => true,
            Some(false) => {
                self.negative.remove(&key);
                false
            },
            None => false,
        }
    }

    /// Drops entries past their stale grace and expired negative marks.
    pub fn expire_sweep(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| now < e.stale_until);
        self.negative.retain(|_, until| now < *until);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            debug!(dropped, "dns cache sweep");
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(SWEEP_INTERVAL) => {},
                }
                cache.expire_sweep();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> DnsRecord {
        DnsRecord {
            name: name.to_string(),
            node_id: 10,
            subdomain: None,
            registered_at: 0,
            expires_at: None,
            owner_node_id: 10,
            verified_at: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_then_stale_then_gone() {
        let cache = DnsCache::new(DnsConfig::default());
        cache.set("news", record("news"), Some(Duration::from_secs(10)));

        assert_eq!(
            cache.get("news").expect("hit").state,
            CacheState::Fresh
        );

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(
            cache.get("news").expect("hit").state,
            CacheState::Stale
        );

        tokio::time::advance(DnsConfig::default().stale_grace).await;
        assert!(cache.get("news").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_negative_cache_expires() {
        let cache = DnsCache::new(DnsConfig::default());
        cache.put_negative("ghost");
        assert!(cache.is_negative("ghost"));

        tokio::time::advance(DnsConfig::default().negative_ttl).await;
        assert!(!cache.is_negative("ghost"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_clamped_to_max() {
        let cfg = DnsConfig::default();
        let max = cfg.max_cache_ttl;
        let cache = DnsCache::new(cfg);
        cache.set("long", record("long"), Some(max * 10));

        tokio::time::advance(max + Duration::from_secs(1)).await;
        // Past the clamped TTL the entry is at best stale.
        let hit = cache.get("long");
        assert!(hit.is_none_or(|h| h.state == CacheState::Stale));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_clears_negative_mark() {
        let cache = DnsCache::new(DnsConfig::default());
        cache.put_negative("news");
        cache.set("news", record("news"), None);
        assert!(!cache.is_negative("news"));
        assert!(cache.get("news").is_some());
    }
}
