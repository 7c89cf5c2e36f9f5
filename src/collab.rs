// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use crate::proto::envelope::Envelope;

/// Verdict of the network guard for one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    Allow,
    /// Delay dispatch by the given interval.
    Throttle(Duration),
    /// Drop without a response.
    Drop,
    /// Drop and remember the sender as blocked.
    Block,
}

/// Rate limiting / moderation hook consulted between codec decode and
/// handler dispatch. The host application plugs in its own policy; the
/// default allows everything.
pub trait NetworkGuard: Send + Sync {
    fn check_request(&self, envelope: &Envelope) -> GuardAction;
}

/// Consent hook for actions that need explicit user approval (downloads,
/// storage beyond the handler scope).
pub trait PermissionGate: Send + Sync {
    fn check(&self, kind: &str, origin: &str) -> bool;

    /// Same check, but the host may interactively prompt.
    fn check_with_prompt(&self, kind: &str, origin: &str) -> bool {
        self.check(kind, origin)
    }
}

/// Result of scanning a body before indexing or serving.
#[derive(Debug, Clone)]
pub struct ScanVerdict {
    pub safe: bool,
    pub level: u8,
    pub threats: Vec<String>,
}

pub trait ContentScanner: Send + Sync {
    fn scan(&self, bytes: &[u8], content_type: &str, origin: &str) -> ScanVerdict;
}

/// Document produced by the external markup parser: plain text for the
/// indexer plus extracted link targets for the crawler.
#[derive(Debug, Clone, Default)]
pub struct ParsedMarkup {
    pub title: Option<String>,
    pub text: String,
    pub links: Vec<String>,
}

pub trait MarkupParser: Send + Sync {
    fn parse(&self, source: &str) -> ParsedMarkup;
}

// ─────────────────────────────────────────────────────────────────────────────
// Default permissive implementations

/// Guard that admits every envelope.
#[derive(Debug, Default)]
pub struct AllowAllGuard;

impl NetworkGuard for AllowAllGuard {
    fn check_request(&self, _envelope: &Envelope) -> GuardAction {
        GuardAction::Allow
    }
}

/// Permission gate that grants every request.
#[derive(Debug, Default)]
pub struct GrantAllPermissions;

impl PermissionGate for GrantAllPermissions {
    fn check(&self, _kind: &str, _origin: &str) -> bool {
        true
    }
}

/// Scanner that trusts every body.
#[derive(Debug, Default)]
pub struct TrustingScanner;

impl ContentScanner for TrustingScanner {
    fn scan(&self, _bytes: &[u8], _content_type: &str, _origin: &str) -> ScanVerdict {
        ScanVerdict {
            safe: true,
            level: 0,
            threats: vec![],
        }
    }
}

/// Minimal markup reader used when no richer parser is plugged in.
///
/// Recognizes a first line starting with `# ` as the title, collects
/// `href="…"` attribute values and bare `rdnt://` URLs as links, and passes
/// the source through as text otherwise.
#[derive(Debug, Default)]
pub struct BasicMarkup;

impl MarkupParser for BasicMarkup {
    fn parse(&self, source: &str) -> ParsedMarkup {
        let title = source
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("# "))
            .map(|t| t.trim().to_string());

        let mut links = Vec::new();
        let mut rest = source;
        while let Some(at) = rest.find("href=\"") {
            rest = &rest[at + 6..];
            if let Some(end) = rest.find('"') {
                let target = &rest[..end];
                if !target.is_empty() {
                    links.push(target.to_string());
                }
                rest = &rest[end..];
            } else {
                break;
            }
        }
        for word in source.split_whitespace() {
            let word = word.trim_end_matches(|c: char| ",.;)]\"'".contains(c));
            if word.starts_with("rdnt://") && !links.iter().any(|l| l == word) {
                links.push(word.to_string());
            }
        }

        ParsedMarkup {
            title,
            text: source.to_string(),
            links,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_markup_extracts_links_and_title() {
        let doc = "# Shop Front\nSee href=\"/items\" or rdnt://other/about.";
        let parsed = BasicMarkup.parse(doc);
        assert_eq!(parsed.title.as_deref(), Some("Shop Front"));
        assert!(parsed.links.iter().any(|l| l == "/items"));
        assert!(parsed.links.iter().any(|l| l == "rdnt://other/about"));
    }
}
