// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::time::{Instant, timeout};
use tracing::{debug, warn};

use crate::{
    cfg::config::DnsConfig,
    dns::{
        cache::{CacheState, DnsCache},
        name::DomainName,
        record::DnsRecord,
        registry::DnsRegistry,
    },
    error::{CoreError, CoreResult},
    proto::envelope::{DnsAnswerPayload, DnsQueryPayload, MessageKind},
    transport::adapter::Transport,
};

/// Per-lookup overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Accept an answer whose node did not respond to the verification
    /// ping. Defaults to the configured policy.
    pub allow_unverified: Option<bool>,
}

/// A successful lookup.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub record: DnsRecord,
    pub verified: bool,
    /// Served from cache past its TTL while a refresh runs.
    pub stale: bool,
    /// Peers disagreed about this name; the first-come winner was chosen.
    pub conflict: bool,
}

/// Peer-queried name resolution over the broadcast bus.
pub struct Resolver {
    registry: Arc<DnsRegistry>,
    cache: Arc<DnsCache>,
    transport: Arc<Transport>,
    cfg: DnsConfig,
    /// Names with repeatedly conflicting answers, by observation count.
    conflicts: DashMap<String, u64>,
}

impl Resolver {
    pub fn new(
        registry: Arc<DnsRegistry>,
        cache: Arc<DnsCache>,
        transport: Arc<Transport>,
        cfg: DnsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            transport,
            cfg,
            conflicts: DashMap::new(),
        })
    }

    pub async fn lookup(self: &Arc<Self>, raw: &str) -> CoreResult<Resolved> {
        self.lookup_with(raw, ResolveOptions::default()).await
    }

    pub async fn lookup_with(
        self: &Arc<Self>,
        raw: &str,
        opts: ResolveOptions,
    ) -> CoreResult<Resolved> {
        let name = DomainName::parse(raw)?;
        if name.is_reserved() {
            return Err(CoreError::InvalidName(format!("reserved name: {name}")));
        }
        let key = name.to_string();

        // Authoritative shortcut: names this node owns never hit the
        // network.
        let local_id = self.transport.local_id();
        let locally_owned = match &name {
            DomainName::Computer { node_id, .. } => *node_id == local_id,
            _ => true,
        };
        if locally_owned {
            if let Some(record) = self.registry.lookup_local(&key) {
                // An alias is only first-come-authoritative until the
                // network says otherwise: refresh in the background so an
                // earlier registration elsewhere can shadow this one.
                if matches!(name, DomainName::Alias { .. })
                    && self.cache.get(&key).is_none()
                    && !self.cache.is_negative(&key)
                {
                    let me = Arc::clone(self);
                    let refresh_name = name.clone();
                    let refresh_key = key.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            me.query_network(&refresh_name, &refresh_key, opts).await
                        {
                            debug!(name = %refresh_key, error = %e, "alias refresh failed");
                        }
                    });
                }
                return Ok(Resolved {
                    record,
                    verified: true,
                    stale: false,
                    conflict: false,
                });
            }
            if name.node_id() == Some(local_id) {
                // A computer-form name of this very node that is not
                // registered here cannot exist anywhere else.
                return Err(CoreError::NotFound(key));
            }
        }

        if let Some(hit) = self.cache.get(&key) {
            match hit.state {
                CacheState::Fresh => {
                    return Ok(Resolved {
                        record: hit.record,
                        verified: true,
                        stale: false,
                        conflict: false,
                    });
                },
                CacheState::Stale => {
                    let me = Arc::clone(self);
                    let refresh_key = key.clone();
                    let refresh_name = name.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            me.query_network(&refresh_name, &refresh_key, opts).await
                        {
                            debug!(name = %refresh_key, error = %e, "stale refresh failed");
                        }
                    });
                    return Ok(Resolved {
                        record: hit.record,
                        verified: true,
                        stale: true,
                        conflict: false,
                    });
                },
            }
        }

        if self.cache.is_negative(&key) {
            return Err(CoreError::Unreachable(key));
        }

        self.query_network(&name, &key, opts).await
    }

    /// Broadcast query, bounded answer window, first-come aggregation,
    /// verification ping, cache fill.
    async fn query_network(
        self: &Arc<Self>,
        name: &DomainName,
        key: &str,
        opts: ResolveOptions,
    ) -> CoreResult<Resolved> {
        let payload = DnsQueryPayload {
            name: key.to_string(),
            want_verified: false,
        };
        let env = self
            .transport
            .codec()
            .encode(MessageKind::DnsQuery, &payload, None)?;
        let query_id = env.id.clone();
        let mut answers_rx = self.transport.register_collector(&query_id);
        let broadcast = self.transport.broadcast(&env).await;
        if let Err(e) = broadcast {
            self.transport.unregister_collector(&query_id);
            return Err(e);
        }

        let mut answers: Vec<DnsAnswerPayload> = Vec::new();
        let deadline = Instant::now() + self.cfg.query_window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match timeout(remaining, answers_rx.recv()).await {
                Ok(Some(env)) => {
                    if let Some(answer) = env.payload::<DnsAnswerPayload>() {
                        if answer.name.eq_ignore_ascii_case(key) {
                            answers.push(answer);
                        }
                    }
                },
                Ok(None) | Err(_) => break,
            }
        }
        self.transport.unregister_collector(&query_id);

        if answers.is_empty() {
            self.cache.put_negative(key);
            return Err(CoreError::Unreachable(key.to_string()));
        }

        match name {
            DomainName::Computer { node_id, .. } => {
                self.settle_computer(key, *node_id, answers, opts).await
            },
            DomainName::Alias { .. } => self.settle_alias(key, answers, opts).await,
            DomainName::Reserved { .. } => {
                Err(CoreError::InvalidName(key.to_string()))
            },
        }
    }

    /// Computer form: only answers embedding the right node id count; the
    /// first one that verifies wins.
    async fn settle_computer(
        &self,
        key: &str,
        expected_node: u64,
        answers: Vec<DnsAnswerPayload>,
        opts: ResolveOptions,
    ) -> CoreResult<Resolved> {
        let conflict = answers.iter().any(|a| a.node_id != expected_node);
        if conflict {
            self.note_conflict(key);
        }

        let mut last_unverified: Option<DnsRecord> = None;
        for answer in answers
            .into_iter()
            .filter(|a| a.node_id == expected_node)
        {
            let mut record = DnsRecord::from_answer(&answer);
            if self.verify(&mut record).await {
                self.cache_record(key, &record, &answer);
                return Ok(Resolved {
                    record,
                    verified: true,
                    stale: false,
                    conflict,
                });
            }
            last_unverified = Some(record);
        }

        self.finish_unverified(key, last_unverified, conflict, opts)
    }

    /// Alias form: earliest registration wins, ties to the lowest owner id.
    /// A single dissenter does not invalidate the winner; repeated
    /// disagreement is recorded and flagged to the caller.
    async fn settle_alias(
        &self,
        key: &str,
        answers: Vec<DnsAnswerPayload>,
        opts: ResolveOptions,
    ) -> CoreResult<Resolved> {
        let mut records: Vec<(DnsRecord, DnsAnswerPayload)> = answers
            .iter()
            .map(|a| (DnsRecord::from_answer(a), a.clone()))
            .collect();
        records.sort_by_key(|(r, _)| (r.registered_at, r.owner_node_id));

        let distinct_owners = {
            let mut owners: Vec<_> = records
                .iter()
                .map(|(r, _)| (r.node_id, r.owner_node_id))
                .collect();
            owners.sort_unstable();
            owners.dedup();
            owners.len()
        };
        let conflict = distinct_owners > 1;
        if conflict {
            self.note_conflict(key);
        }

        // The winner may shadow a local later registration of the same
        // alias.
        if let Some((winner, _)) = records.first() {
            if let Some(local) = self.registry.lookup_local(key) {
                if winner.owner_node_id != self.registry.local_id()
                    && winner.beats(&local)
                {
                    self.registry.mark_shadowed(key);
                }
            }
        }

        let mut last_unverified: Option<DnsRecord> = None;
        for (mut record, answer) in records {
            if self.verify(&mut record).await {
                self.cache_record(key, &record, &answer);
                return Ok(Resolved {
                    record,
                    verified: true,
                    stale: false,
                    conflict,
                });
            }
            last_unverified = Some(record);
            // Only the first-come winner is eligible; a dead winner does
            // not promote a later registrant.
            break;
        }

        self.finish_unverified(key, last_unverified, conflict, opts)
    }

    fn finish_unverified(
        &self,
        key: &str,
        last_unverified: Option<DnsRecord>,
        conflict: bool,
        opts: ResolveOptions,
    ) -> CoreResult<Resolved> {
        let allow = opts
            .allow_unverified
            .unwrap_or(self.cfg.allow_unverified);
        match last_unverified {
            Some(record) if allow => {
                self.cache.set(key, record.clone(), None);
                Ok(Resolved {
                    record,
                    verified: false,
                    stale: false,
                    conflict,
                })
            },
            _ => {
                self.cache.put_negative(key);
                Err(CoreError::Unreachable(key.to_string()))
            },
        }
    }

    /// Direct reachability probe of the claimed node.
    async fn verify(&self, record: &mut DnsRecord) -> bool {
        match self
            .transport
            .ping(record.node_id, Some(self.cfg.verification_timeout))
            .await
        {
            Ok(()) => {
                record.verified_at = Some(Utc::now().timestamp_millis());
                true
            },
            Err(e) => {
                debug!(node = record.node_id, error = %e, "verification ping failed");
                false
            },
        }
    }

    fn cache_record(&self, key: &str, record: &DnsRecord, answer: &DnsAnswerPayload) {
        let ttl = answer.expires_at.and_then(|expires| {
            let now = Utc::now().timestamp_millis();
            u64::try_from(expires - now)
                .ok()
                .map(std::time::Duration::from_millis)
        });
        self.cache.set(key, record.clone(), ttl);
    }

    fn note_conflict(&self, key: &str) {
        let count = {
            let mut entry = self.conflicts.entry(key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        warn!(name = %key, count, "conflicting dns answers observed");
    }

    pub fn conflict_count(&self, name: &str) -> u64 {
        self.conflicts.get(name).map(|c| *c).unwrap_or(0)
    }
}
