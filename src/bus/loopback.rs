// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    bus::{Bus, BusFrame},
    error::{CoreError, CoreResult},
    proto::envelope::NodeId,
};

const ENDPOINT_QUEUE: usize = 1024;

/// In-process datagram hub connecting several loopback endpoints.
///
/// Single-process stand-in for the host's wireless bus: broadcast reaches
/// every attached node except the sender, delivery to a detached node is
/// silently lost. Used by the CLI in single-node mode and by the
/// integration tests.
pub struct LoopbackHub {
    endpoints: DashMap<NodeId, mpsc::Sender<BusFrame>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: DashMap::new(),
        })
    }

    /// Attaches a node and returns its outbound bus handle plus the inbound
    /// frame stream. Re-attaching an id replaces the previous endpoint.
    pub fn attach(
        self: &Arc<Self>,
        node: NodeId,
    ) -> (Arc<LoopbackBus>, mpsc::Receiver<BusFrame>) {
        let (tx, rx) = mpsc::channel(ENDPOINT_QUEUE);
        self.endpoints.insert(node, tx);
        (
            Arc::new(LoopbackBus {
                hub: Arc::downgrade(self),
                node,
            }),
            rx,
        )
    }

    pub fn detach(&self, node: NodeId) {
        self.endpoints.remove(&node);
    }

    async fn deliver(&self, from: NodeId, target: Option<NodeId>, bytes: Bytes) {
        match target {
            Some(node) => {
                if let Some(tx) = self.endpoints.get(&node).map(|e| e.value().clone()) {
                    if tx.send(BusFrame { source: from, bytes }).await.is_err() {
                        debug!(node, "loopback endpoint gone, frame lost");
                    }
                }
            },
            None => {
                let peers: Vec<(NodeId, mpsc::Sender<BusFrame>)> = self
                    .endpoints
                    .iter()
                    .filter(|e| *e.key() != from)
                    .map(|e| (*e.key(), e.value().clone()))
                    .collect();
                for (node, tx) in peers {
                    if tx
                        .send(BusFrame {
                            source: from,
                            bytes: bytes.clone(),
                        })
                        .await
                        .is_err()
                    {
                        debug!(node, "loopback endpoint gone, frame lost");
                    }
                }
            },
        }
    }
}

/// Outbound handle of one node attached to a [`LoopbackHub`].
pub struct LoopbackBus {
    hub: Weak<LoopbackHub>,
    node: NodeId,
}

#[async_trait]
impl Bus for LoopbackBus {
    fn local_id(&self) -> NodeId {
        self.node
    }

    async fn transmit(&self, target: Option<NodeId>, bytes: Bytes) -> CoreResult<()> {
        let hub = self
            .hub
            .upgrade()
            .ok_or_else(|| CoreError::Unreachable("bus hub dropped".to_string()))?;
        hub.deliver(self.node, target, bytes).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let hub = LoopbackHub::new();
        let (a, mut rx_a) = hub.attach(1);
        let (_b, mut rx_b) = hub.attach(2);

        a.transmit(None, Bytes::from_static(b"hello"))
            .await
            .expect("transmit");

        let frame = rx_b.recv().await.expect("frame");
        assert_eq!(frame.source, 1);
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unicast_to_detached_node_is_lost() {
        let hub = LoopbackHub::new();
        let (a, _rx_a) = hub.attach(1);
        hub.detach(2);

        a.transmit(Some(2), Bytes::from_static(b"gone"))
            .await
            .expect("transmit");
    }
}
