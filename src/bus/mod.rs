// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::CoreResult, proto::envelope::NodeId};

pub mod loopback;

/// One raw frame delivered by the host datagram bus.
#[derive(Debug, Clone)]
pub struct BusFrame {
    /// Node the bus attributes the frame to. Advisory, like everything on
    /// this network.
    pub source: NodeId,
    pub bytes: Bytes,
}

/// Outbound half of the host datagram bus.
///
/// The bus is lossy, reordering and duplicating; everything above it goes
/// through the codec's replay/dedup layer. Inbound frames arrive on the
/// `mpsc::Receiver<BusFrame>` handed to the transport at construction.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    /// Identifier the host environment assigned to this node.
    fn local_id(&self) -> NodeId;

    /// Sends one frame to `target`, or to every reachable node when `target`
    /// is `None`.
    async fn transmit(&self, target: Option<NodeId>, bytes: Bytes) -> CoreResult<()>;
}
