// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde::{Deserialize, Serialize};

use crate::proto::envelope::{DnsAnswerPayload, NodeId};

/// One name-to-node mapping, either authored locally or learned from a
/// peer.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DnsRecord {
    pub name: String,
    pub node_id: NodeId,
    pub subdomain: Option<String>,
    /// Milliseconds since epoch; first-come conflict resolution compares
    /// this field first.
    pub registered_at: i64,
    pub expires_at: Option<i64>,
    pub owner_node_id: NodeId,
    /// Last successful reachability probe of `node_id`.
    pub verified_at: Option<i64>,
}

impl DnsRecord {
    pub fn from_answer(answer: &DnsAnswerPayload) -> Self {
        Self {
            name: answer.name.clone(),
            node_id: answer.node_id,
            subdomain: answer.subdomain.clone(),
            registered_at: answer.registered_at,
            expires_at: answer.expires_at,
            owner_node_id: answer.owner_node_id,
            verified_at: None,
        }
    }

    pub fn to_answer(&self, in_reply_to: Option<String>) -> DnsAnswerPayload {
        DnsAnswerPayload {
            in_reply_to,
            name: self.name.clone(),
            node_id: self.node_id,
            subdomain: self.subdomain.clone(),
            registered_at: self.registered_at,
            expires_at: self.expires_at,
            owner_node_id: self.owner_node_id,
        }
    }

    /// First-come ordering: earlier registration wins, ties break toward
    /// the lower owner id.
    pub fn beats(&self, other: &DnsRecord) -> bool {
        (self.registered_at, self.owner_node_id)
            < (other.registered_at, other.owner_node_id)
    }
}
