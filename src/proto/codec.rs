// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    cfg::config::Config,
    error::{CoreError, CoreResult},
    proto::{
        envelope::{
            Envelope, ErrorPayload, MAX_ID_LEN, MessageKind, NodeId, PROTO_VERSION,
            PingPayload, PongPayload, RequestPayload, ResponsePayload,
        },
        status::Status,
    },
    utils::id_entropy,
};

/// Outcome of decoding one raw frame.
#[derive(Debug)]
pub enum Decoded {
    Accepted(Envelope),
    /// The frame parsed but carried a kind this build does not know, and the
    /// forward-compat policy says to skip it rather than reject.
    IgnoredUnknownKind(String),
}

/// Builds and parses envelopes: id allocation, MAC, replay window.
///
/// The bus reorders and duplicates; id dedup inside the replay window plus
/// the skew gate give exactly-once delivery at the application layer without
/// an ordered stream underneath.
pub struct Codec {
    local: NodeId,
    network_key: String,
    accept_unknown_kinds: bool,
    replay_window_ms: i64,
    skew_ms: i64,
    seq: AtomicU64,
    entropy: String,
    /// (source, id) -> timestamp of first sighting.
    seen: DashMap<(NodeId, String), i64>,
}

/// Serde shape used on the inbound path so an unknown `t` can be told apart
/// from malformed JSON.
#[derive(Deserialize)]
struct RawWire {
    v: u8,
    t: String,
    id: String,
    ts: i64,
    src: NodeId,
    #[serde(default)]
    tgt: Option<NodeId>,
    d: Value,
    #[serde(default)]
    m: Option<String>,
    #[serde(flatten)]
    extra: serde_json::Map<String, Value>,
}

impl Codec {
    pub fn new(local: NodeId, cfg: &Config) -> Self {
        Self {
            local,
            network_key: cfg.network.key.clone(),
            accept_unknown_kinds: cfg.network.accept_unknown_kinds,
            replay_window_ms: cfg.transport.replay_window.as_millis() as i64,
            skew_ms: cfg.transport.skew.as_millis() as i64,
            seq: AtomicU64::new(0),
            entropy: id_entropy(),
            seen: DashMap::new(),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Next per-sender monotonic id. The entropy suffix keeps ids unique
    /// across a process restart that resets the counter.
    pub fn next_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{seq:08x}-{}", self.local, self.entropy)
    }

    /// Canonical serialization of a payload. `serde_json::Map` keeps object
    /// keys sorted, so equal values always produce equal bytes here.
    pub fn canonical(data: &Value) -> CoreResult<String> {
        serde_json::to_string(data)
            .map_err(|e| CoreError::Parse(format!("unserializable payload: {e}")))
    }

    /// Shared secret for a (local, remote) pair; falls back to the
    /// well-known network key on broadcast. Integrity-only: the claimed
    /// source stays advisory.
    fn secret_for(&self, a: NodeId, b: Option<NodeId>) -> String {
        match b {
            Some(b) => {
                let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
                format!("{}:{lo}:{hi}", self.network_key)
            },
            None => self.network_key.clone(),
        }
    }

    fn mac(&self, secret: &str, id: &str, ts: i64, canonical: &str) -> String {
        let mut hasher = Md5::new();
        hasher.update(secret.as_bytes());
        hasher.update(id.as_bytes());
        hasher.update(ts.to_string().as_bytes());
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    // ────────────────────────────────────────────────────────────────────
    // Encode path

    pub fn encode_value(
        &self,
        kind: MessageKind,
        data: Value,
        target: Option<NodeId>,
    ) -> CoreResult<Envelope> {
        let id = self.next_id();
        let ts = Utc::now().timestamp_millis();
        let canonical = Self::canonical(&data)?;
        let secret = self.secret_for(self.local, target);
        let mac = self.mac(&secret, &id, ts, &canonical);

        Ok(Envelope {
            version: PROTO_VERSION,
            kind,
            id,
            timestamp_ms: ts,
            source: self.local,
            target,
            data,
            mac: Some(mac),
            extra: serde_json::Map::new(),
        })
    }

    pub fn encode<T: Serialize>(
        &self,
        kind: MessageKind,
        payload: &T,
        target: Option<NodeId>,
    ) -> CoreResult<Envelope> {
        let data = serde_json::to_value(payload)
            .map_err(|e| CoreError::Parse(format!("unserializable payload: {e}")))?;
        self.encode_value(kind, data, target)
    }

    /// Re-stamps an envelope with a fresh id, timestamp and MAC. Used by the
    /// transport before every retry so the receiver's dedup does not eat the
    /// second attempt.
    pub fn restamp(&self, env: &Envelope) -> CoreResult<Envelope> {
        self.encode_value(env.kind, env.data.clone(), env.target)
    }

    pub fn to_bytes(env: &Envelope) -> CoreResult<Bytes> {
        let s = serde_json::to_string(env)
            .map_err(|e| CoreError::Parse(format!("unserializable envelope: {e}")))?;
        Ok(Bytes::from(s))
    }

    // ────────────────────────────────────────────────────────────────────
    // Decode path

    pub fn decode(&self, bytes: &[u8]) -> CoreResult<Decoded> {
        self.decode_at(bytes, Utc::now().timestamp_millis())
    }

    /// Decode with an explicit clock, so window edges are testable.
    pub fn decode_at(&self, bytes: &[u8], now_ms: i64) -> CoreResult<Decoded> {
        let raw: RawWire = serde_json::from_slice(bytes)
            .map_err(|e| CoreError::Parse(format!("malformed envelope: {e}")))?;

        if raw.v != PROTO_VERSION {
            return Err(CoreError::Parse(format!(
                "unsupported protocol version {}",
                raw.v
            )));
        }
        if raw.id.is_empty() || raw.id.len() > MAX_ID_LEN {
            return Err(CoreError::Parse(format!(
                "bad id length {}",
                raw.id.len()
            )));
        }

        let kind = match MessageKind::from_wire(&raw.t) {
            Some(k) => k,
            None if self.accept_unknown_kinds => {
                debug!("skipping forward-compat kind {}", raw.t);
                return Ok(Decoded::IgnoredUnknownKind(raw.t));
            },
            None => {
                return Err(CoreError::Parse(format!("unknown message kind {}", raw.t)));
            },
        };

        // MAC before anything else: a frame that fails integrity must not
        // touch the replay map.
        let canonical = Self::canonical(&raw.d)?;
        let secret = self.secret_for(raw.src, raw.tgt);
        let expect = self.mac(&secret, &raw.id, raw.ts, &canonical);
        match &raw.m {
            Some(m) if m.eq_ignore_ascii_case(&expect) => {},
            _ => return Err(CoreError::Integrity),
        }

        if (now_ms - raw.ts).abs() > self.skew_ms {
            return Err(CoreError::Replay);
        }
        let key = (raw.src, raw.id.clone());
        if self.seen.contains_key(&key) {
            return Err(CoreError::Replay);
        }
        self.seen.insert(key, raw.ts);

        Ok(Decoded::Accepted(Envelope {
            version: raw.v,
            kind,
            id: raw.id,
            timestamp_ms: raw.ts,
            source: raw.src,
            target: raw.tgt,
            data: raw.d,
            mac: raw.m,
            extra: raw.extra,
        }))
    }

    /// Drops dedup entries older than the replay window.
    pub fn purge_replay(&self, now_ms: i64) {
        let horizon = now_ms - self.replay_window_ms;
        self.seen.retain(|_, ts| *ts >= horizon);
    }

    #[allow(dead_code)]
    pub(crate) fn replay_entries(&self) -> usize {
        self.seen.len()
    }

    // ────────────────────────────────────────────────────────────────────
    // Helpers for the common shapes

    pub fn create_request(
        &self,
        target: NodeId,
        payload: &RequestPayload,
    ) -> CoreResult<Envelope> {
        self.encode(MessageKind::Request, payload, Some(target))
    }

    pub fn create_response(
        &self,
        request: &Envelope,
        status: Status,
        payload: ResponsePayload,
    ) -> CoreResult<Envelope> {
        let payload = ResponsePayload {
            in_reply_to: request.id.clone(),
            status: status.code(),
            ..payload
        };
        self.encode(MessageKind::Response, &payload, Some(request.source))
    }

    pub fn create_error(
        &self,
        request: &Envelope,
        status: Status,
        reason: impl Into<String>,
    ) -> CoreResult<Envelope> {
        let payload = ErrorPayload {
            in_reply_to: request.id.clone(),
            status: status.code(),
            reason: reason.into(),
        };
        self.encode(MessageKind::Error, &payload, Some(request.source))
    }

    pub fn create_ping(&self, target: NodeId) -> CoreResult<Envelope> {
        self.encode(MessageKind::Ping, &PingPayload { note: None }, Some(target))
    }

    pub fn create_pong(&self, ping: &Envelope) -> CoreResult<Envelope> {
        self.encode(
            MessageKind::Pong,
            &PongPayload {
                in_reply_to: ping.id.clone(),
            },
            Some(ping.source),
        )
    }
}
