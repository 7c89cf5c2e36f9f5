// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Read-only request view handed to a handler invocation.
#[derive(Debug, Clone, Default)]
pub struct SandboxRequest {
    pub method: String,
    pub url: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub cookies: BTreeMap<String, String>,
    pub body: Option<String>,
    pub session_id: Option<String>,
}

/// Response accumulated by a handler. Immutable once returned.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct SandboxResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub cookies_set: BTreeMap<String, String>,
}

impl Default for SandboxResponse {
    fn default() -> Self {
        Self {
            status: 200,
            headers: BTreeMap::new(),
            body: String::new(),
            cookies_set: BTreeMap::new(),
        }
    }
}

/// Session data visible to one invocation. The handler reads and writes a
/// copy; the owner decides what to persist from the returned updates.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub data: BTreeMap<String, String>,
    /// Site-scoped persistent key-value store, also snapshotted.
    pub storage: BTreeMap<String, String>,
}

/// Everything a finished invocation produced. Nothing outside this value
/// was touched.
#[derive(Debug, Clone)]
pub struct SandboxInvocation {
    pub response: SandboxResponse,
    /// Session keys the handler wrote (value `None` means removed).
    pub session_updates: BTreeMap<String, Option<String>>,
    /// Storage keys the handler wrote.
    pub storage_updates: BTreeMap<String, Option<String>>,
}
