// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    bus::{Bus, BusFrame},
    cfg::config::{Config, TransportConfig},
    collab::{GuardAction, NetworkGuard},
    error::{CoreError, CoreResult},
    peers::{connection::ConnState, registry::PeerRegistry},
    proto::{
        codec::{Codec, Decoded},
        envelope::{Envelope, MessageKind, NodeId},
    },
    transport::keepalive,
};

/// Per-send knobs. Retries apply only to timeouts of sends that expect a
/// response; refusals and malformed frames are terminal.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub timeout: Duration,
    pub retries: u32,
    pub expects_response: bool,
}

impl SendOptions {
    pub fn fire_and_forget(cfg: &TransportConfig) -> Self {
        Self {
            timeout: cfg.send_timeout,
            retries: 0,
            expects_response: false,
        }
    }

    pub fn expecting_response(cfg: &TransportConfig) -> Self {
        Self {
            timeout: cfg.send_timeout,
            retries: cfg.retries,
            expects_response: true,
        }
    }
}

/// Drop and traffic counters. Network-layer failures are counted here and
/// never surfaced to callers.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub sent: AtomicU64,
    pub received: AtomicU64,
    pub integrity_drop: AtomicU64,
    pub replay_drop: AtomicU64,
    pub parse_drop: AtomicU64,
    pub overload_drop: AtomicU64,
    pub guard_drop: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub sent: u64,
    pub received: u64,
    pub integrity_drop: u64,
    pub replay_drop: u64,
    pub parse_drop: u64,
    pub overload_drop: u64,
    pub guard_drop: u64,
}

impl TransportCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            integrity_drop: self.integrity_drop.load(Ordering::Relaxed),
            replay_drop: self.replay_drop.load(Ordering::Relaxed),
            parse_drop: self.parse_drop.load(Ordering::Relaxed),
            overload_drop: self.overload_drop.load(Ordering::Relaxed),
            guard_drop: self.guard_drop.load(Ordering::Relaxed),
        }
    }
}

/// Bridges the raw datagram bus to validated envelope traffic.
///
/// Outbound: request/response correlation with timeout and retry. Inbound:
/// codec validation, guard check, reply matching, then bounded
/// per-connection queues drained by the dispatcher. A slow handler can fill
/// its own connection queue but never stalls this loop.
pub struct Transport {
    pub(crate) codec: Arc<Codec>,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) registry: Arc<PeerRegistry>,
    guard: Arc<dyn NetworkGuard>,
    pending: DashMap<String, oneshot::Sender<Envelope>>,
    collectors: DashMap<String, mpsc::Sender<Envelope>>,
    dispatch_tx: mpsc::Sender<NodeId>,
    pub(crate) counters: Arc<TransportCounters>,
    pub(crate) cfg: TransportConfig,
    pub(crate) cancel: CancellationToken,
}

const DISPATCH_QUEUE: usize = 4096;
const COLLECTOR_QUEUE: usize = 32;

impl Transport {
    /// Spawns the read loop and the keepalive task; returns the transport
    /// handle plus the dispatch stream of node ids with queued inbound
    /// work.
    pub fn start(
        codec: Arc<Codec>,
        bus: Arc<dyn Bus>,
        frames: mpsc::Receiver<BusFrame>,
        registry: Arc<PeerRegistry>,
        guard: Arc<dyn NetworkGuard>,
        cfg: &Config,
        cancel: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<NodeId>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE);
        let transport = Arc::new(Self {
            codec,
            bus,
            registry,
            guard,
            pending: DashMap::new(),
            collectors: DashMap::new(),
            dispatch_tx,
            counters: Arc::new(TransportCounters::default()),
            cfg: cfg.transport.clone(),
            cancel,
        });

        let reader = Arc::clone(&transport);
        tokio::spawn(async move {
            reader.read_loop(frames).await;
        });

        let pinger = Arc::clone(&transport);
        tokio::spawn(async move {
            keepalive::run(pinger).await;
        });

        (transport, dispatch_rx)
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn local_id(&self) -> NodeId {
        self.codec.local_id()
    }

    pub fn counters(&self) -> &Arc<TransportCounters> {
        &self.counters
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    // ────────────────────────────────────────────────────────────────────
    // Outbound

    /// Sends `env`. With `expects_response` the returned envelope is the
    /// reply; retries re-stamp the id so the receiver's dedup accepts the
    /// attempt. Without it, resolution means the bus accepted the frame.
    pub async fn send(
        &self,
        env: Envelope,
        opts: SendOptions,
    ) -> CoreResult<Option<Envelope>> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Timeout("transport cancelled".to_string()));
        }

        if !opts.expects_response {
            let bytes = Codec::to_bytes(&env)?;
            self.bus.transmit(env.target, bytes).await?;
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let target = env.target.ok_or_else(|| {
            CoreError::Parse("a response requires a unicast target".to_string())
        })?;
        let conn = self.registry.ensure_connection(target);
        // One exchange at a time per peer: the reply to this request lands
        // before any later exchange toward the same peer completes.
        let _gate = conn.exchange_gate.lock().await;

        let mut attempt: u32 = 0;
        loop {
            let out = if attempt == 0 {
                env.clone()
            } else {
                self.codec.restamp(&env)?
            };
            let (tx, rx) = oneshot::channel();
            self.pending.insert(out.id.clone(), tx);

            let bytes = Codec::to_bytes(&out)?;
            if let Err(e) = self.bus.transmit(out.target, bytes).await {
                self.pending.remove(&out.id);
                return Err(e);
            }
            self.counters.sent.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.pending.remove(&out.id);
                    return Err(CoreError::Timeout("transport cancelled".to_string()));
                },
                res = timeout(opts.timeout, rx) => match res {
                    Ok(Ok(reply)) => {
                        conn.retries.store(0, Ordering::Relaxed);
                        return Ok(Some(reply));
                    },
                    Ok(Err(_)) => {
                        self.pending.remove(&out.id);
                        return Err(CoreError::Timeout(
                            "transport shutting down".to_string(),
                        ));
                    },
                    Err(_) => {
                        self.pending.remove(&out.id);
                        conn.retries.fetch_add(1, Ordering::Relaxed);
                        if attempt >= opts.retries {
                            return Err(CoreError::Timeout(format!(
                                "no response from node {target}"
                            )));
                        }
                        let backoff = self.cfg.retry_backoff * 2u32.pow(attempt);
                        debug!(target, attempt, "send timed out, backing off");
                        tokio::select! {
                            _ = self.cancel.cancelled() => {
                                return Err(CoreError::Timeout(
                                    "transport cancelled".to_string(),
                                ));
                            },
                            _ = sleep(backoff) => {},
                        }
                        attempt += 1;
                    },
                },
            }
        }
    }

    /// Request/response round trip with the configured defaults.
    pub async fn exchange(
        &self,
        env: Envelope,
        timeout_override: Option<Duration>,
    ) -> CoreResult<Envelope> {
        let mut opts = SendOptions::expecting_response(&self.cfg);
        if let Some(t) = timeout_override {
            opts.timeout = t;
        }
        self.send(env, opts)
            .await?
            .ok_or_else(|| CoreError::Timeout("no response".to_string()))
    }

    /// Fire-and-forget on the broadcast channel.
    pub async fn broadcast(&self, env: &Envelope) -> CoreResult<()> {
        let bytes = Codec::to_bytes(env)?;
        self.bus.transmit(None, bytes).await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Single ping/pong probe, no retries.
    pub async fn ping(
        &self,
        target: NodeId,
        timeout_override: Option<Duration>,
    ) -> CoreResult<()> {
        let env = self.codec.create_ping(target)?;
        let opts = SendOptions {
            timeout: timeout_override.unwrap_or(self.cfg.send_timeout),
            retries: 0,
            expects_response: true,
        };
        let reply = self
            .send(env, opts)
            .await?
            .ok_or_else(|| CoreError::Timeout("no pong".to_string()))?;
        match reply.kind {
            MessageKind::Pong => Ok(()),
            other => Err(CoreError::Parse(format!(
                "expected pong, got {}",
                other.as_wire()
            ))),
        }
    }

    // ────────────────────────────────────────────────────────────────────
    // Multi-answer correlation (dns query windows)

    /// Streams every reply naming `id` until the collector is dropped via
    /// [`Self::unregister_collector`].
    pub fn register_collector(&self, id: &str) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(COLLECTOR_QUEUE);
        self.collectors.insert(id.to_string(), tx);
        rx
    }

    pub fn unregister_collector(&self, id: &str) {
        self.collectors.remove(id);
    }

    // ────────────────────────────────────────────────────────────────────
    // Inbound

    async fn read_loop(self: Arc<Self>, mut frames: mpsc::Receiver<BusFrame>) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                f = frames.recv() => match f {
                    Some(f) => f,
                    None => return,
                },
            };

            let env = match self.codec.decode(&frame.bytes) {
                Ok(Decoded::Accepted(env)) => env,
                Ok(Decoded::IgnoredUnknownKind(kind)) => {
                    debug!(kind, "skipped forward-compat frame");
                    continue;
                },
                Err(CoreError::Integrity) => {
                    self.counters.integrity_drop.fetch_add(1, Ordering::Relaxed);
                    continue;
                },
                Err(CoreError::Replay) => {
                    self.counters.replay_drop.fetch_add(1, Ordering::Relaxed);
                    continue;
                },
                Err(e) => {
                    debug!(error = %e, "inbound frame rejected");
                    self.counters.parse_drop.fetch_add(1, Ordering::Relaxed);
                    continue;
                },
            };
            self.counters.received.fetch_add(1, Ordering::Relaxed);

            match self.guard.check_request(&env) {
                GuardAction::Allow => self.accept(env).await,
                GuardAction::Throttle(delay) => {
                    let me = Arc::clone(&self);
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = me.cancel.cancelled() => {},
                            _ = sleep(delay) => me.accept(env).await,
                        }
                    });
                },
                GuardAction::Drop | GuardAction::Block => {
                    self.counters.guard_drop.fetch_add(1, Ordering::Relaxed);
                },
            }
        }
    }

    async fn accept(&self, env: Envelope) {
        let now = Utc::now().timestamp_millis();
        let conn = self.registry.ensure_connection(env.source);
        conn.touch(now);
        if !matches!(conn.state(), ConnState::Open | ConnState::Closing) {
            conn.set_state(ConnState::Open);
        }
        self.registry.touch_peer(env.source);

        if env.kind == MessageKind::Ping {
            self.auto_pong(&env).await;
            return;
        }

        if env.kind.is_reply() {
            if let Some(id) = env.in_reply_to().map(str::to_string) {
                if let Some((_, tx)) = self.pending.remove(&id) {
                    let _ = tx.send(env);
                    return;
                }
                if let Some(collector) = self.collectors.get(&id) {
                    if collector.value().try_send(env).is_err() {
                        debug!("collector full, answer dropped");
                    }
                    return;
                }
            }
            // Unsolicited answers still teach us name mappings; any other
            // orphaned reply is late and gets dropped.
            if env.kind == MessageKind::DnsAnswer {
                self.enqueue_for_dispatch(&conn, env);
            } else {
                debug!(id = %env.id, "unmatched reply dropped");
            }
            return;
        }

        self.enqueue_for_dispatch(&conn, env);
    }

    async fn auto_pong(&self, ping: &Envelope) {
        let pong = match self.codec.create_pong(ping) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to build pong");
                return;
            },
        };
        if let Ok(bytes) = Codec::to_bytes(&pong) {
            if self.bus.transmit(pong.target, bytes).await.is_ok() {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn enqueue_for_dispatch(
        &self,
        conn: &Arc<crate::peers::connection::Connection>,
        env: Envelope,
    ) {
        let source = env.source;
        if conn.enqueue(env).is_some() {
            self.counters.overload_drop.fetch_add(1, Ordering::Relaxed);
        }
        if self.dispatch_tx.try_send(source).is_err() {
            // Dispatcher is saturated; the envelope stays queued on the
            // connection and rides along with a later token.
            self.counters.overload_drop.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Pops the next queued inbound envelope from `node`'s connection.
    pub fn take_inbound(&self, node: NodeId) -> Option<Envelope> {
        self.registry.connection(node).and_then(|c| c.dequeue())
    }
}
