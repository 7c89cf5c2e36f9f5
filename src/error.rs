// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure class reported by a sandboxed handler invocation.
///
/// Exactly one invocation is the fault domain: whatever happens inside the
/// handler is converted into one of these kinds and never crashes the caller.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxFault {
    Syntax,
    Runtime,
    Timeout,
    LimitExceeded,
    ForbiddenAccess,
}

impl fmt::Display for SandboxFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SandboxFault::Syntax => "syntax",
            SandboxFault::Runtime => "runtime",
            SandboxFault::Timeout => "timeout",
            SandboxFault::LimitExceeded => "limit_exceeded",
            SandboxFault::ForbiddenAccess => "forbidden_access",
        })
    }
}

/// Closed error taxonomy of the core.
///
/// Network-layer kinds (`Integrity`, `Replay`, `Parse` on inbound frames,
/// `OverloadDrop`) never escape to the user; the transport counts them and
/// drops the frame. Name-resolution and timeout kinds surface to the caller.
/// Sandbox faults are converted to 5xx responses by the router.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Syntactically invalid name. Not surfaced to the network.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// No verified answer within the query window.
    #[error("unreachable: {0}")]
    Unreachable(String),

    /// Registration conflict or ownership mismatch.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Deadline exceeded on a network exchange or a handler invocation.
    #[error("timed out: {0}")]
    Timeout(String),

    /// MAC mismatch on a received envelope. Dropped silently, counted.
    #[error("integrity check failed")]
    Integrity,

    /// Duplicate or out-of-window message id. Dropped silently, counted.
    #[error("replayed or out-of-window message")]
    Replay,

    /// Malformed envelope, URL or query.
    #[error("parse error: {0}")]
    Parse(String),

    /// Handler failure, tagged with the fault class.
    #[error("sandbox {kind}: {message}")]
    Sandbox { kind: SandboxFault, message: String },

    /// Queue or rate-limit rejection.
    #[error("dropped due to overload")]
    OverloadDrop,

    /// No record or document for the given name or URL.
    #[error("not found: {0}")]
    NotFound(String),
}

impl CoreError {
    pub fn sandbox(kind: SandboxFault, message: impl Into<String>) -> Self {
        CoreError::Sandbox {
            kind,
            message: message.into(),
        }
    }

    /// True for kinds the transport swallows and counts instead of
    /// propagating.
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            CoreError::Integrity
                | CoreError::Replay
                | CoreError::Parse(_)
                | CoreError::OverloadDrop
        )
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;
