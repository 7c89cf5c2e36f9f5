// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{info, warn};

use crate::{
    dns::{name::DomainName, record::DnsRecord},
    error::{CoreError, CoreResult},
    proto::envelope::{DnsAnswerPayload, NodeId},
};

/// A locally authored record plus its shadow flag.
///
/// A record becomes shadowed when the network turns out to hold an earlier
/// registration of the same alias; it stays listed locally but no longer
/// answers queries.
#[derive(Debug, Clone)]
pub struct LocalRecord {
    pub record: DnsRecord,
    pub shadowed: bool,
}

/// Authoritative store of the names this node registered.
pub struct DnsRegistry {
    local: NodeId,
    records: DashMap<String, LocalRecord>,
}

impl DnsRegistry {
    pub fn new(local: NodeId) -> Arc<Self> {
        Arc::new(Self {
            local,
            records: DashMap::new(),
        })
    }

    pub fn local_id(&self) -> NodeId {
        self.local
    }

    /// Registers a name. Computer form must embed this node's id; aliases
    /// are first-come. Re-registering an owned name is a no-op returning
    /// the existing record.
    pub fn register(&self, name: &DomainName) -> CoreResult<DnsRecord> {
        if name.is_reserved() {
            return Err(CoreError::Unauthorized(format!(
                "name is reserved: {name}"
            )));
        }

        let key = name.to_string();
        if let Some(existing) = self.records.get(&key) {
            return Ok(existing.record.clone());
        }

        let node_id = match name {
            DomainName::Computer { node_id, .. } => {
                if *node_id != self.local {
                    return Err(CoreError::Unauthorized(format!(
                        "name {name} embeds node {node_id}, local node is {}",
                        self.local
                    )));
                }
                *node_id
            },
            DomainName::Alias { .. } => self.local,
            DomainName::Reserved { .. } => unreachable!("rejected above"),
        };

        let record = DnsRecord {
            name: key.clone(),
            node_id,
            subdomain: name.subdomain().map(str::to_string),
            registered_at: Utc::now().timestamp_millis(),
            expires_at: None,
            owner_node_id: self.local,
            verified_at: None,
        };
        info!(name = %key, "registered name");
        self.records.insert(
            key,
            LocalRecord {
                record: record.clone(),
                shadowed: false,
            },
        );
        Ok(record)
    }

    /// Removes an authoritative record. The caller broadcasts the
    /// withdrawal so peers purge their caches.
    pub fn unregister(&self, name: &str) -> Option<DnsRecord> {
        let key = name.to_ascii_lowercase();
        let removed = self.records.remove(&key).map(|(_, lr)| lr.record);
        if removed.is_some() {
            info!(name = %key, "unregistered name");
        }
        removed
    }

    pub fn list_local(&self) -> Vec<LocalRecord> {
        self.records.iter().map(|r| r.value().clone()).collect()
    }

    /// Active (non-shadowed) record for `name`.
    pub fn lookup_local(&self, name: &str) -> Option<DnsRecord> {
        let key = name.to_ascii_lowercase();
        self.records
            .get(&key)
            .filter(|lr| !lr.shadowed)
            .map(|lr| lr.record.clone())
    }

    /// Answer payload for a network query, or `None` when this node is not
    /// authoritative for the name.
    pub fn answer_for(
        &self,
        name: &str,
        in_reply_to: Option<String>,
    ) -> Option<DnsAnswerPayload> {
        self.lookup_local(name)
            .map(|record| record.to_answer(in_reply_to))
    }

    /// Called when resolution discovers an earlier registration elsewhere:
    /// the local alias loses and stops answering.
    pub fn mark_shadowed(&self, name: &str) {
        let key = name.to_ascii_lowercase();
        if let Some(mut lr) = self.records.get_mut(&key) {
            if !lr.shadowed {
                warn!(name = %key, "local alias shadowed by earlier registration");
                lr.shadowed = true;
            }
        }
    }

    pub fn hosts_any(&self) -> bool {
        !self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_computer_requires_matching_node() {
        let reg = DnsRegistry::new(1234);

        let ours = DomainName::parse("shop.comp1234.rednet").expect("parse");
        let record = reg.register(&ours).expect("register");
        assert_eq!(record.node_id, 1234);

        let theirs = DomainName::parse("shop.comp9999.rednet").expect("parse");
        assert!(matches!(
            reg.register(&theirs),
            Err(CoreError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_register_is_idempotent() {
        let reg = DnsRegistry::new(7);
        let name = DomainName::parse("news").expect("parse");

        let first = reg.register(&name).expect("register");
        let second = reg.register(&name).expect("register again");
        assert_eq!(first, second);
        assert_eq!(reg.list_local().len(), 1);
    }

    #[test]
    fn test_reserved_refused() {
        let reg = DnsRegistry::new(7);
        let name = DomainName::parse("admin").expect("parse");
        assert!(matches!(
            reg.register(&name),
            Err(CoreError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_shadowed_record_stops_answering() {
        let reg = DnsRegistry::new(7);
        let name = DomainName::parse("news").expect("parse");
        reg.register(&name).expect("register");

        assert!(reg.answer_for("news", None).is_some());
        reg.mark_shadowed("news");
        assert!(reg.answer_for("news", None).is_none());
        assert_eq!(reg.list_local().len(), 1);
    }
}
