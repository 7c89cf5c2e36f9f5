// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{
        Mutex, RwLock,
        atomic::{AtomicI64, AtomicU32, Ordering},
    },
};

use crate::proto::envelope::{Envelope, NodeId};

/// Lifecycle of a logical conversation with one remote node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Failed,
}

/// Per-peer conversation state.
///
/// The registry owns connections; everything else holds them through the
/// registry by remote node id. The inbound queue is bounded: overflow drops
/// the oldest entry and reports it so the transport can count the loss.
#[derive(Debug)]
pub struct Connection {
    pub remote: NodeId,
    state: RwLock<ConnState>,
    last_seen_ms: AtomicI64,
    pub retries: AtomicU32,
    inbound: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    /// Serializes request/response exchanges toward this peer, so a reply
    /// always lands before the next exchange completes.
    pub(crate) exchange_gate: tokio::sync::Mutex<()>,
}

impl Connection {
    pub fn new(remote: NodeId, capacity: usize) -> Self {
        Self {
            remote,
            state: RwLock::new(ConnState::Idle),
            last_seen_ms: AtomicI64::new(0),
            retries: AtomicU32::new(0),
            inbound: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            capacity,
            exchange_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state.read().expect("conn state lock poisoned")
    }

    pub fn set_state(&self, next: ConnState) {
        *self.state.write().expect("conn state lock poisoned") = next;
    }

    pub fn touch(&self, now_ms: i64) {
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn last_seen_ms(&self) -> i64 {
        self.last_seen_ms.load(Ordering::Relaxed)
    }

    pub fn idle_for_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.last_seen_ms()
    }

    /// Appends to the inbound queue; returns the envelope that had to be
    /// dropped to make room, if any.
    pub fn enqueue(&self, env: Envelope) -> Option<Envelope> {
        let mut q = self.inbound.lock().expect("inbound queue lock poisoned");
        let dropped = if q.len() >= self.capacity {
            q.pop_front()
        } else {
            None
        };
        q.push_back(env);
        dropped
    }

    pub fn dequeue(&self) -> Option<Envelope> {
        self.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .pop_front()
    }

    pub fn queued(&self) -> usize {
        self.inbound
            .lock()
            .expect("inbound queue lock poisoned")
            .len()
    }
}
