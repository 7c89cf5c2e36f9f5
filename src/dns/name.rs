// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use core::fmt;
use std::collections::HashSet;

use once_cell::sync::Lazy;

use crate::{
    error::{CoreError, CoreResult},
    proto::envelope::NodeId,
};

/// Top-level zone every name lives under.
pub const ZONE: &str = "rednet";

/// Labels refused for registration: administrative names and names the
/// platform itself uses.
static RESERVED_LABELS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "admin", "root", "system", "rednet", "www", "dns", "search", "home",
        "settings", "error",
    ])
});

pub fn is_reserved_label(label: &str) -> bool {
    RESERVED_LABELS.contains(label)
}

const MAX_LABEL_LEN: usize = 63;

/// A parsed name.
///
/// Computer form embeds the authoritative node id, so it can never collide;
/// an alias is a single free label mapped by first-come registration;
/// reserved labels parse but refuse registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainName {
    Computer {
        subdomain: Option<String>,
        node_id: NodeId,
    },
    Alias {
        label: String,
    },
    Reserved {
        label: String,
    },
}

impl DomainName {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let lower = raw.trim().to_ascii_lowercase();
        if lower.is_empty() {
            return Err(CoreError::InvalidName("empty name".to_string()));
        }

        let labels: Vec<&str> = lower.split('.').collect();
        match labels.as_slice() {
            [label] => {
                validate_label(label)?;
                if is_reserved_label(label) {
                    Ok(DomainName::Reserved {
                        label: (*label).to_string(),
                    })
                } else {
                    Ok(DomainName::Alias {
                        label: (*label).to_string(),
                    })
                }
            },
            [comp, zone] if *zone == ZONE => Ok(DomainName::Computer {
                subdomain: None,
                node_id: parse_comp_label(comp)?,
            }),
            [sub, comp, zone] if *zone == ZONE => {
                validate_label(sub)?;
                if is_reserved_label(sub) {
                    return Err(CoreError::InvalidName(format!(
                        "reserved subdomain: {sub}"
                    )));
                }
                Ok(DomainName::Computer {
                    subdomain: Some((*sub).to_string()),
                    node_id: parse_comp_label(comp)?,
                })
            },
            _ => Err(CoreError::InvalidName(format!("unrecognized name: {raw}"))),
        }
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, DomainName::Reserved { .. })
    }

    pub fn node_id(&self) -> Option<NodeId> {
        match self {
            DomainName::Computer { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }

    pub fn subdomain(&self) -> Option<&str> {
        match self {
            DomainName::Computer { subdomain, .. } => subdomain.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainName::Computer {
                subdomain: Some(sub),
                node_id,
            } => write!(f, "{sub}.comp{node_id}.{ZONE}"),
            DomainName::Computer {
                subdomain: None,
                node_id,
            } => write!(f, "comp{node_id}.{ZONE}"),
            DomainName::Alias { label } | DomainName::Reserved { label } => {
                f.write_str(label)
            },
        }
    }
}

fn parse_comp_label(label: &str) -> CoreResult<NodeId> {
    let digits = label.strip_prefix("comp").ok_or_else(|| {
        CoreError::InvalidName(format!("expected comp<id> label, got {label}"))
    })?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::InvalidName(format!(
            "bad node id in label {label}"
        )));
    }
    digits
        .parse::<NodeId>()
        .map_err(|_| CoreError::InvalidName(format!("node id out of range: {label}")))
}

/// One label: ASCII letters, digits, hyphen; 1..=63 chars; no hyphen at
/// either end.
pub fn validate_label(label: &str) -> CoreResult<()> {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return Err(CoreError::InvalidName(format!(
            "label length {} outside 1..={MAX_LABEL_LEN}",
            label.len()
        )));
    }
    if !label
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(CoreError::InvalidName(format!(
            "label has invalid characters: {label}"
        )));
    }
    if label.starts_with('-') || label.ends_with('-') {
        return Err(CoreError::InvalidName(format!(
            "label has hyphen at edge: {label}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_computer_form_with_subdomain() {
        let name = DomainName::parse("shop.comp1234.rednet").expect("parse");
        assert_eq!(name.node_id(), Some(1234));
        assert_eq!(name.subdomain(), Some("shop"));
        assert_eq!(name.to_string(), "shop.comp1234.rednet");
    }

    #[test]
    fn test_computer_form_bare() {
        let name = DomainName::parse("comp42.rednet").expect("parse");
        assert_eq!(name.node_id(), Some(42));
        assert_eq!(name.subdomain(), None);
    }

    #[test]
    fn test_alias_and_reserved() {
        assert!(matches!(
            DomainName::parse("news").expect("parse"),
            DomainName::Alias { .. }
        ));
        assert!(DomainName::parse("admin").expect("parse").is_reserved());
    }

    #[test]
    fn test_label_length_boundaries() {
        assert!(DomainName::parse("a").is_ok());
        let max = "a".repeat(63);
        assert!(DomainName::parse(&max).is_ok());
        let over = "a".repeat(64);
        assert!(matches!(
            DomainName::parse(&over),
            Err(CoreError::InvalidName(_))
        ));
    }

    #[test]
    fn test_hyphen_edges_rejected() {
        assert!(DomainName::parse("-shop").is_err());
        assert!(DomainName::parse("shop-").is_err());
        assert!(DomainName::parse("my-shop").is_ok());
    }

    #[test]
    fn test_bad_comp_labels() {
        assert!(DomainName::parse("shop.compx.rednet").is_err());
        assert!(DomainName::parse("shop.comp.rednet").is_err());
        assert!(DomainName::parse("shop.1234.rednet").is_err());
        assert!(DomainName::parse("a.b.c.rednet").is_err());
    }

    #[test]
    fn test_case_is_folded() {
        let name = DomainName::parse("Shop.COMP7.Rednet").expect("parse");
        assert_eq!(name.to_string(), "shop.comp7.rednet");
    }
}
