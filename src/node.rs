// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    bus::{Bus, BusFrame},
    cfg::config::Config,
    collab::{
        AllowAllGuard, BasicMarkup, ContentScanner, GrantAllPermissions,
        MarkupParser, NetworkGuard, PermissionGate, TrustingScanner,
    },
    crawler::crawl::{CrawlReport, Crawler, TransportFetcher},
    dns::{
        cache::DnsCache,
        name::DomainName,
        record::DnsRecord,
        registry::DnsRegistry,
        resolver::{Resolved, Resolver},
    },
    error::{CoreError, CoreResult},
    peers::registry::{PeerClass, PeerRegistry},
    proto::{
        codec::Codec,
        envelope::{
            DnsAnswerPayload, DnsQueryPayload, DnsWithdrawPayload, Envelope,
            MessageKind, NodeId, PeerAnnouncePayload, RequestPayload,
            ResponsePayload,
        },
    },
    sandbox::Sandbox,
    search::{
        index::SearchIndex,
        query::{self, SearchHit},
    },
    server::{router::Router, sessions::SessionManager, site::SiteRoot},
    transport::adapter::{SendOptions, Transport},
    url::RdntUrl,
};

/// Pluggable host hooks. Defaults are permissive, which is what a bare
/// node wants; the host UI swaps in real policies.
pub struct Collaborators {
    pub guard: Arc<dyn NetworkGuard>,
    pub permissions: Arc<dyn PermissionGate>,
    pub scanner: Arc<dyn ContentScanner>,
    pub markup: Arc<dyn MarkupParser>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            guard: Arc::new(AllowAllGuard),
            permissions: Arc::new(GrantAllPermissions),
            scanner: Arc::new(TrustingScanner),
            markup: Arc::new(BasicMarkup),
        }
    }
}

/// One node of the platform: browser, server, dns peer and crawler in a
/// single process, each concern an owned service behind a typed handle.
pub struct RedNet {
    pub cfg: Config,
    pub transport: Arc<Transport>,
    pub peers: Arc<PeerRegistry>,
    pub dns_registry: Arc<DnsRegistry>,
    pub dns_cache: Arc<DnsCache>,
    pub resolver: Arc<Resolver>,
    pub sessions: Arc<SessionManager>,
    pub router: Arc<Router>,
    pub index: Arc<SearchIndex>,
    pub crawler: Arc<Crawler>,
    cancel: CancellationToken,
}

impl RedNet {
    pub fn start(
        cfg: Config,
        bus: Arc<dyn Bus>,
        frames: mpsc::Receiver<BusFrame>,
    ) -> Arc<Self> {
        Self::start_with(cfg, bus, frames, Collaborators::default())
    }

    pub fn start_with(
        cfg: Config,
        bus: Arc<dyn Bus>,
        frames: mpsc::Receiver<BusFrame>,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let local = bus.local_id();

        let codec = Arc::new(Codec::new(local, &cfg));
        let peers = PeerRegistry::new(
            local,
            cfg.peers.clone(),
            cfg.transport.inbound_queue,
        );
        let (transport, dispatch_rx) = Transport::start(
            Arc::clone(&codec),
            bus,
            frames,
            Arc::clone(&peers),
            Arc::clone(&collaborators.guard),
            &cfg,
            cancel.child_token(),
        );

        let dns_registry = DnsRegistry::new(local);
        let dns_cache = DnsCache::new(cfg.dns.clone());
        let resolver = Resolver::new(
            Arc::clone(&dns_registry),
            Arc::clone(&dns_cache),
            Arc::clone(&transport),
            cfg.dns.clone(),
        );

        let sessions = SessionManager::new(cfg.server.clone());
        let sandbox = Sandbox::new(&cfg.sandbox);
        let router = Router::new(
            Arc::clone(&dns_registry),
            Arc::clone(&sessions),
            sandbox,
            Arc::clone(&collaborators.permissions),
            Arc::clone(&collaborators.scanner),
            &cfg.server,
        );

        let index = SearchIndex::new(&cfg.index);
        let fetcher = TransportFetcher::new(
            Arc::clone(&resolver),
            Arc::clone(&transport),
            cfg.crawl.agent.clone(),
        );
        let crawler = Crawler::new(
            fetcher,
            Arc::clone(&index),
            Arc::clone(&collaborators.markup),
            Arc::clone(&collaborators.scanner),
            cfg.crawl.clone(),
        );

        peers.spawn_sweeper(cancel.child_token());
        dns_cache.spawn_sweeper(cancel.child_token());
        sessions.spawn_sweeper(cancel.child_token());
        index.spawn_snapshotter(&cfg.index, cancel.child_token());

        let node = Arc::new(Self {
            cfg,
            transport,
            peers,
            dns_registry,
            dns_cache,
            resolver,
            sessions,
            router,
            index,
            crawler,
            cancel,
        });

        let dispatcher = Arc::clone(&node);
        tokio::spawn(async move {
            dispatcher.dispatch_loop(dispatch_rx).await;
        });

        info!(node = local, "node started");
        node
    }

    pub fn local_id(&self) -> NodeId {
        self.transport.local_id()
    }

    pub fn shutdown(&self) {
        info!(node = self.local_id(), "node shutting down");
        self.cancel.cancel();
    }

    // ────────────────────────────────────────────────────────────────────
    // Public operations

    /// Registers a name and serves `root` under it.
    pub async fn host_site(
        &self,
        name: &str,
        root: SiteRoot,
    ) -> CoreResult<DnsRecord> {
        let parsed = DomainName::parse(name)?;
        let record = self.dns_registry.register(&parsed)?;
        self.router.mount(&record.name, root);
        // Best effort: peers learn about the new server either way when
        // they query.
        if let Err(e) = self
            .peers
            .announce(&self.transport, PeerClass::Server, record.name.clone())
            .await
        {
            debug!(error = %e, "announce after registration failed");
        }
        Ok(record)
    }

    /// Withdraws a name network-wide and unmounts its site.
    pub async fn drop_site(&self, name: &str) -> CoreResult<()> {
        let record = self
            .dns_registry
            .unregister(name)
            .ok_or_else(|| CoreError::NotFound(name.to_string()))?;
        self.router.unmount(name);
        let payload = DnsWithdrawPayload {
            name: record.name,
            owner_node_id: record.owner_node_id,
        };
        let env = self
            .transport
            .codec()
            .encode(MessageKind::DnsWithdraw, &payload, None)?;
        self.transport.broadcast(&env).await
    }

    pub async fn resolve(&self, name: &str) -> CoreResult<Resolved> {
        self.resolver.lookup(name).await
    }

    /// Browser-side fetch of a URL: resolve, exchange, unwrap.
    pub async fn fetch(&self, url: &str) -> CoreResult<ResponsePayload> {
        let parsed = RdntUrl::parse(url)?;
        let resolved = self.resolver.lookup(&parsed.host).await?;

        let payload = RequestPayload {
            method: "GET".to_string(),
            url: parsed.to_string(),
            ..RequestPayload::default()
        };
        let env = self
            .transport
            .codec()
            .create_request(resolved.record.node_id, &payload)?;
        let reply = self.transport.exchange(env, None).await?;
        match reply.kind {
            MessageKind::Response => reply.payload::<ResponsePayload>().ok_or_else(
                || CoreError::Parse("malformed response payload".to_string()),
            ),
            MessageKind::Error => {
                let err = reply
                    .payload::<crate::proto::envelope::ErrorPayload>()
                    .ok_or_else(|| {
                        CoreError::Parse("malformed error payload".to_string())
                    })?;
                match err.status {
                    404 => Err(CoreError::NotFound(url.to_string())),
                    _ => Err(CoreError::Unreachable(format!(
                        "{url}: {} {}",
                        err.status, err.reason
                    ))),
                }
            },
            other => Err(CoreError::Parse(format!(
                "unexpected reply kind {}",
                other.as_wire()
            ))),
        }
    }

    pub fn search(&self, raw_query: &str, limit: usize) -> Vec<SearchHit> {
        query::search(&self.index, raw_query, limit)
    }

    /// Drops indexed documents older than `grace` whose host no longer
    /// resolves. Returns how many documents were removed.
    pub async fn prune_unreachable_docs(&self, grace: std::time::Duration) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let grace_ms = grace.as_millis() as i64;
        let mut hosts: std::collections::BTreeMap<String, bool> =
            std::collections::BTreeMap::new();
        let mut removed = 0;

        for (doc_id, url, indexed_at) in self.index.doc_refs() {
            if now - indexed_at < grace_ms {
                continue;
            }
            let Ok(parsed) = RdntUrl::parse(&url) else {
                continue;
            };
            let reachable = match hosts.get(&parsed.host) {
                Some(r) => *r,
                None => {
                    let r = self.resolver.lookup(&parsed.host).await.is_ok();
                    hosts.insert(parsed.host.clone(), r);
                    r
                },
            };
            if !reachable && self.index.remove_document(doc_id) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "pruned documents from unreachable hosts");
        }
        removed
    }

    pub async fn crawl(&self, seed: &str) -> CoreResult<CrawlReport> {
        let limits = self.crawler.default_limits();
        self.crawler.crawl_site(seed, &limits).await
    }

    pub async fn announce(&self) -> CoreResult<()> {
        let class = if self.dns_registry.hosts_any() {
            PeerClass::Server
        } else {
            PeerClass::Client
        };
        self.peers
            .announce(&self.transport, class, String::new())
            .await
    }

    // ────────────────────────────────────────────────────────────────────
    // Inbound dispatch

    async fn dispatch_loop(self: Arc<Self>, mut tokens: mpsc::Receiver<NodeId>) {
        loop {
            let source = tokio::select! {
                _ = self.cancel.cancelled() => return,
                t = tokens.recv() => match t {
                    Some(t) => t,
                    None => return,
                },
            };
            let Some(env) = self.transport.take_inbound(source) else {
                continue;
            };
            self.dispatch(env).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, env: Envelope) {
        match env.kind {
            // A slow handler must not stall the dispatcher; requests get
            // their own task and the sandbox semaphore bounds them.
            MessageKind::Request => {
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    node.handle_request(env).await;
                });
            },
            MessageKind::DnsQuery => self.handle_dns_query(&env).await,
            MessageKind::DnsAnswer => self.learn_dns_answer(&env),
            MessageKind::DnsWithdraw => self.handle_dns_withdraw(&env),
            MessageKind::PeerAnnounce => {
                if let Some(payload) = env.payload::<PeerAnnouncePayload>() {
                    self.peers.on_peer_seen(&payload);
                }
            },
            MessageKind::CrawlRequest => {
                let Some(payload) =
                    env.payload::<crate::proto::envelope::CrawlRequestPayload>()
                else {
                    return;
                };
                let node = Arc::clone(self);
                tokio::spawn(async move {
                    match node.crawl(&payload.seed_url).await {
                        Ok(report) => {
                            info!(seed = %report.seed, indexed = report.pages_indexed,
                                "requested crawl finished");
                        },
                        Err(e) => {
                            warn!(seed = %payload.seed_url, error = %e,
                                "requested crawl failed");
                        },
                    }
                });
            },
            // Ping/pong and reply correlation live in the transport.
            MessageKind::Ping
            | MessageKind::Pong
            | MessageKind::Response
            | MessageKind::Error => {},
        }
    }

    async fn handle_request(self: &Arc<Self>, env: Envelope) {
        let outcome = self.router.handle_request(&env).await;
        let reply = if outcome.is_error() {
            self.transport.codec().create_error(
                &env,
                outcome.status,
                outcome.reason.unwrap_or_else(|| {
                    outcome.status.reason().to_string()
                }),
            )
        } else {
            self.transport.codec().create_response(
                &env,
                outcome.status,
                ResponsePayload {
                    in_reply_to: String::new(),
                    status: 0,
                    headers: outcome.headers,
                    body: outcome.body,
                    cookies_set: outcome.cookies_set,
                },
            )
        };
        match reply {
            Ok(reply) => {
                let opts = SendOptions::fire_and_forget(&self.cfg.transport);
                if let Err(e) = self.transport.send(reply, opts).await {
                    debug!(error = %e, "response send failed");
                }
            },
            Err(e) => warn!(error = %e, "failed to build response"),
        }
    }

    async fn handle_dns_query(&self, env: &Envelope) {
        let Some(query) = env.payload::<DnsQueryPayload>() else {
            return;
        };
        let Some(answer) = self
            .dns_registry
            .answer_for(&query.name, Some(env.id.clone()))
        else {
            return;
        };
        let reply = self.transport.codec().encode(
            MessageKind::DnsAnswer,
            &answer,
            Some(env.source),
        );
        match reply {
            Ok(reply) => {
                let opts = SendOptions::fire_and_forget(&self.cfg.transport);
                if let Err(e) = self.transport.send(reply, opts).await {
                    debug!(error = %e, "dns answer send failed");
                }
            },
            Err(e) => warn!(error = %e, "failed to build dns answer"),
        }
    }

    /// Unsolicited answers still teach this node name mappings and peer
    /// classes.
    fn learn_dns_answer(&self, env: &Envelope) {
        let Some(answer) = env.payload::<DnsAnswerPayload>() else {
            return;
        };
        if DomainName::parse(&answer.name).is_err() {
            return;
        }
        let record = DnsRecord::from_answer(&answer);
        self.dns_cache.set(&answer.name, record, None);
        self.peers.note_answers_dns(env.source);
        self.peers.note_hosts_sites(answer.node_id);
    }

    fn handle_dns_withdraw(&self, env: &Envelope) {
        let Some(withdraw) = env.payload::<DnsWithdrawPayload>() else {
            return;
        };
        // Only the recorded owner may purge the mapping from this cache.
        if let Some(hit) = self.dns_cache.get(&withdraw.name) {
            if hit.record.owner_node_id == withdraw.owner_node_id {
                self.dns_cache.purge(&withdraw.name);
                debug!(name = %withdraw.name, "cache entry withdrawn");
            }
        }
    }
}
