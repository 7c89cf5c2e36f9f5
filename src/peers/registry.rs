// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::config::PeerConfig,
    error::{CoreError, CoreResult},
    peers::connection::{ConnState, Connection},
    proto::envelope::{NodeId, PeerAnnouncePayload},
    transport::adapter::Transport,
};

/// Capability class of a peer, inferred from observed behavior.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PeerClass {
    Client,
    Server,
    Hybrid,
    Dns,
}

impl fmt::Display for PeerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PeerClass::Client => "client",
            PeerClass::Server => "server",
            PeerClass::Hybrid => "hybrid",
            PeerClass::Dns => "dns",
        })
    }
}

/// What this node knows about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerDescriptor {
    pub node_id: NodeId,
    pub class: PeerClass,
    pub version: String,
    pub capabilities: Vec<String>,
    pub last_seen_ms: i64,
    pub info: String,
    /// Observed hosting at least one registered name.
    pub hosts_sites: bool,
    /// Observed answering dns queries.
    pub answers_dns: bool,
}

impl PeerDescriptor {
    fn inferred_class(&self) -> PeerClass {
        match (self.hosts_sites, self.answers_dns) {
            (true, true) => PeerClass::Hybrid,
            (true, false) => PeerClass::Server,
            (false, true) => PeerClass::Dns,
            (false, false) => self.class,
        }
    }
}

/// Registry of known peers and their connections.
///
/// Connections are owned here and addressed by remote node id; other
/// components never hold them across await points longer than one exchange.
pub struct PeerRegistry {
    local: NodeId,
    cfg: PeerConfig,
    inbound_capacity: usize,
    conns: DashMap<NodeId, Arc<Connection>>,
    peers: DashMap<NodeId, PeerDescriptor>,
}

impl PeerRegistry {
    pub fn new(local: NodeId, cfg: PeerConfig, inbound_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            local,
            cfg,
            inbound_capacity,
            conns: DashMap::new(),
            peers: DashMap::new(),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Connection handle for `node`, created in `Idle` state when missing.
    pub fn ensure_connection(&self, node: NodeId) -> Arc<Connection> {
        self.conns
            .entry(node)
            .or_insert_with(|| Arc::new(Connection::new(node, self.inbound_capacity)))
            .value()
            .clone()
    }

    pub fn connection(&self, node: NodeId) -> Option<Arc<Connection>> {
        self.conns.get(&node).map(|c| c.value().clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.conns.iter().map(|c| c.value().clone()).collect()
    }

    /// Idempotent open: an existing `Open` connection is returned as-is, an
    /// idle or failed one is probed with a ping/pong exchange first.
    pub async fn get_or_open(
        &self,
        transport: &Transport,
        node: NodeId,
    ) -> CoreResult<Arc<Connection>> {
        let conn = self.ensure_connection(node);
        if conn.state() == ConnState::Open {
            return Ok(conn);
        }

        conn.set_state(ConnState::Connecting);
        match transport.ping(node, None).await {
            Ok(()) => {
                conn.set_state(ConnState::Open);
                conn.touch(Utc::now().timestamp_millis());
                Ok(conn)
            },
            Err(e) => {
                conn.set_state(ConnState::Failed);
                Err(e)
            },
        }
    }

    /// Broadcasts this node's descriptor so peers can upsert it.
    pub async fn announce(
        &self,
        transport: &Transport,
        class: PeerClass,
        info: impl Into<String>,
    ) -> CoreResult<()> {
        let payload = PeerAnnouncePayload {
            node_id: self.local,
            class: class.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: self.cfg.capabilities.clone(),
            info: info.into(),
        };
        let env = transport.codec().encode(
            crate::proto::envelope::MessageKind::PeerAnnounce,
            &payload,
            None,
        )?;
        transport.broadcast(&env).await
    }

    /// Upserts a peer from an announcement or any other sighting.
    pub fn on_peer_seen(&self, payload: &PeerAnnouncePayload) {
        let now = Utc::now().timestamp_millis();
        let class = match payload.class.as_str() {
            "server" => PeerClass::Server,
            "hybrid" => PeerClass::Hybrid,
            "dns" => PeerClass::Dns,
            _ => PeerClass::Client,
        };
        let mut entry = self
            .peers
            .entry(payload.node_id)
            .or_insert_with(|| PeerDescriptor {
                node_id: payload.node_id,
                class,
                version: payload.version.clone(),
                capabilities: payload.capabilities.clone(),
                last_seen_ms: now,
                info: payload.info.clone(),
                hosts_sites: false,
                answers_dns: false,
            });
        entry.class = class;
        entry.version = payload.version.clone();
        entry.capabilities = payload.capabilities.clone();
        entry.info = payload.info.clone();
        entry.last_seen_ms = now;
        let inferred = entry.inferred_class();
        entry.class = inferred;
    }

    /// Records traffic from `node` without a full descriptor.
    pub fn touch_peer(&self, node: NodeId) {
        let now = Utc::now().timestamp_millis();
        if let Some(mut p) = self.peers.get_mut(&node) {
            p.last_seen_ms = now;
        }
        if let Some(conn) = self.connection(node) {
            conn.touch(now);
        }
    }

    pub fn note_hosts_sites(&self, node: NodeId) {
        if let Some(mut p) = self.peers.get_mut(&node) {
            p.hosts_sites = true;
            p.class = p.inferred_class();
        }
    }

    pub fn note_answers_dns(&self, node: NodeId) {
        if let Some(mut p) = self.peers.get_mut(&node) {
            p.answers_dns = true;
            p.class = p.inferred_class();
        }
    }

    pub fn peer(&self, node: NodeId) -> Option<PeerDescriptor> {
        self.peers.get(&node).map(|p| p.clone())
    }

    pub fn peers(&self) -> Vec<PeerDescriptor> {
        self.peers.iter().map(|p| p.clone()).collect()
    }

    /// Evicts peers unseen past the freshness window and closes connections
    /// idle past the idle timeout.
    pub fn sweep(&self, now_ms: i64) {
        let freshness = self.cfg.freshness.as_millis() as i64;
        let before = self.peers.len();
        self.peers
            .retain(|_, p| now_ms - p.last_seen_ms <= freshness);
        let evicted = before - self.peers.len();
        if evicted > 0 {
            debug!(evicted, "peer sweep evicted stale peers");
        }

        let idle = self.cfg.idle_timeout.as_millis() as i64;
        for conn in self.conns.iter() {
            let c = conn.value();
            if c.state() == ConnState::Open && c.idle_for_ms(now_ms) > idle {
                info!(remote = c.remote, "closing idle connection");
                c.set_state(ConnState::Closed);
            }
        }
        self.conns.retain(|_, c| {
            !matches!(c.state(), ConnState::Closed | ConnState::Failed)
                || c.queued() > 0
        });
    }

    /// Periodic sweep task; runs until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(registry.cfg.sweep_interval) => {},
                }
                registry.sweep(Utc::now().timestamp_millis());
            }
        })
    }

    /// Marks a connection failed after a keepalive miss.
    pub fn on_keepalive_miss(&self, node: NodeId, err: &CoreError) {
        if let Some(conn) = self.connection(node) {
            warn!(remote = node, error = %err, "keepalive missed, failing connection");
            conn.set_state(ConnState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<PeerRegistry> {
        PeerRegistry::new(1, PeerConfig::default(), 256)
    }

    fn announce(node: NodeId) -> PeerAnnouncePayload {
        PeerAnnouncePayload {
            node_id: node,
            class: "client".to_string(),
            version: "0.1.0".to_string(),
            capabilities: vec![],
            info: String::new(),
        }
    }

    #[test]
    fn test_class_inference_upgrades() {
        let reg = registry();
        reg.on_peer_seen(&announce(5));
        assert_eq!(reg.peer(5).expect("peer").class, PeerClass::Client);

        reg.note_answers_dns(5);
        assert_eq!(reg.peer(5).expect("peer").class, PeerClass::Dns);

        reg.note_hosts_sites(5);
        assert_eq!(reg.peer(5).expect("peer").class, PeerClass::Hybrid);
    }

    #[test]
    fn test_sweep_evicts_stale_peers() {
        let reg = registry();
        reg.on_peer_seen(&announce(5));
        let now = Utc::now().timestamp_millis();

        reg.sweep(now);
        assert!(reg.peer(5).is_some());

        let past_window = now + PeerConfig::default().freshness.as_millis() as i64 + 1;
        reg.sweep(past_window);
        assert!(reg.peer(5).is_none());
    }

    #[test]
    fn test_ensure_connection_is_idempotent() {
        let reg = registry();
        let a = reg.ensure_connection(9);
        let b = reg.ensure_connection(9);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
