// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Stable integer identifier of a participating host, assigned by the
/// environment. Not cryptographic; honest-but-observable.
pub type NodeId = u64;

/// Current protocol version stamped into the `v` wire key.
pub const PROTO_VERSION: u8 = 1;

/// Upper bound on the length of the `id` wire key.
pub const MAX_ID_LEN: usize = 64;

/// Closed set of message kinds carried by the `t` wire key.
///
/// The wire value is the snake_case string; in memory dispatch is a match
/// over this variant, never a string table.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Error,
    DnsQuery,
    DnsAnswer,
    DnsWithdraw,
    Ping,
    Pong,
    PeerAnnounce,
    CrawlRequest,
}

impl MessageKind {
    pub fn from_wire(s: &str) -> Option<Self> {
        serde_json::from_value(Value::String(s.to_string())).ok()
    }

    pub fn as_wire(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            MessageKind::DnsQuery => "dns_query",
            MessageKind::DnsAnswer => "dns_answer",
            MessageKind::DnsWithdraw => "dns_withdraw",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::PeerAnnounce => "peer_announce",
            MessageKind::CrawlRequest => "crawl_request",
        }
    }

    /// Kinds that answer an earlier message and carry `in_reply_to` in their
    /// payload.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            MessageKind::Response
                | MessageKind::Error
                | MessageKind::Pong
                | MessageKind::DnsAnswer
        )
    }
}

/// A framed, integrity-protected message on the datagram bus.
///
/// Wire keys are the short names (`v`, `t`, `id`, `ts`, `src`, `tgt`, `d`,
/// `m`); unknown keys survive a decode/encode round trip via `extra`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Envelope {
    #[serde(rename = "v")]
    pub version: u8,
    #[serde(rename = "t")]
    pub kind: MessageKind,
    /// Per-sender monotonic id, unique within the replay window.
    pub id: String,
    /// Milliseconds since epoch at the sender.
    #[serde(rename = "ts")]
    pub timestamp_ms: i64,
    #[serde(rename = "src")]
    pub source: NodeId,
    #[serde(rename = "tgt")]
    pub target: Option<NodeId>,
    /// Structured payload; shape depends on `kind`.
    #[serde(rename = "d")]
    pub data: Value,
    /// Hex keyed digest over `id || ts || canonical(d)`.
    #[serde(rename = "m", skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Envelope {
    /// Id of the message this envelope answers, if its payload names one.
    pub fn in_reply_to(&self) -> Option<&str> {
        self.data.get("in_reply_to").and_then(Value::as_str)
    }

    pub fn payload<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Typed payload shapes per message kind

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq, Default)]
pub struct RequestPayload {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub cookies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ResponsePayload {
    pub in_reply_to: String,
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub cookies_set: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub in_reply_to: String,
    pub status: u16,
    pub reason: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DnsQueryPayload {
    pub name: String,
    #[serde(default)]
    pub want_verified: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DnsAnswerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub name: String,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subdomain: Option<String>,
    pub registered_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    pub owner_node_id: NodeId,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct DnsWithdrawPayload {
    pub name: String,
    pub owner_node_id: NodeId,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PingPayload {
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PongPayload {
    pub in_reply_to: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PeerAnnouncePayload {
    pub node_id: NodeId,
    pub class: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub info: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct CrawlRequestPayload {
    pub seed_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_round_trip() {
        for kind in [
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Error,
            MessageKind::DnsQuery,
            MessageKind::DnsAnswer,
            MessageKind::DnsWithdraw,
            MessageKind::Ping,
            MessageKind::Pong,
            MessageKind::PeerAnnounce,
            MessageKind::CrawlRequest,
        ] {
            assert_eq!(MessageKind::from_wire(kind.as_wire()), Some(kind));
        }
        assert_eq!(MessageKind::from_wire("telemetry"), None);
    }
}
