// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};

pub const SCHEME: &str = "rdnt";

/// A parsed `rdnt://<name>[/<path>][?<query>]` URL.
///
/// The host part is kept as the raw name string; name syntax is validated
/// separately by the resolver. Path segments are percent-decoded, the query
/// is split into `k=v` pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdntUrl {
    pub host: String,
    /// Decoded path, always starting with `/`.
    pub path: String,
    pub params: BTreeMap<String, String>,
}

impl RdntUrl {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let rest = raw
            .strip_prefix("rdnt://")
            .ok_or_else(|| CoreError::Parse(format!("not an rdnt url: {raw}")))?;

        let (rest, fragmentless) = match rest.split_once('#') {
            Some((r, _)) => (r, true),
            None => (rest, false),
        };
        let _ = fragmentless;

        let (location, query) = match rest.split_once('?') {
            Some((l, q)) => (l, Some(q)),
            None => (rest, None),
        };

        let (host, path) = match location.split_once('/') {
            Some((h, p)) => (h, format!("/{p}")),
            None => (location, "/".to_string()),
        };
        if host.is_empty() {
            return Err(CoreError::Parse(format!("empty host in url: {raw}")));
        }

        let path = percent_decode(&path)?;
        let mut params = BTreeMap::new();
        if let Some(q) = query {
            for pair in q.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = match pair.split_once('=') {
                    Some((k, v)) => (percent_decode(k)?, percent_decode(v)?),
                    None => (percent_decode(pair)?, String::new()),
                };
                params.insert(k, v);
            }
        }

        Ok(Self {
            host: host.to_string(),
            path,
            params,
        })
    }

    /// Canonical form used for crawl deduplication: scheme + lowercased host
    /// + slash-collapsed path, fragment and query dropped.
    pub fn canonical(&self) -> String {
        let host = self.host.to_ascii_lowercase();
        let mut path = String::with_capacity(self.path.len());
        let mut prev_slash = false;
        for c in self.path.chars() {
            if c == '/' {
                if prev_slash {
                    continue;
                }
                prev_slash = true;
            } else {
                prev_slash = false;
            }
            path.push(c);
        }
        if path.len() > 1 && path.ends_with('/') {
            path.pop();
        }
        format!("{SCHEME}://{host}{path}")
    }

    /// Resolves a link target found in a document against this URL.
    ///
    /// Absolute `rdnt://` targets are returned as-is; `/abs` paths replace
    /// the path on the same host; anything else is joined to the current
    /// path's directory.
    pub fn join(&self, target: &str) -> CoreResult<RdntUrl> {
        if target.starts_with("rdnt://") {
            return RdntUrl::parse(target);
        }
        if let Some(abs) = target.strip_prefix('/') {
            return RdntUrl::parse(&format!("rdnt://{}/{}", self.host, abs));
        }
        let dir = match self.path.rfind('/') {
            Some(i) => &self.path[..=i],
            None => "/",
        };
        RdntUrl::parse(&format!("rdnt://{}{}{}", self.host, dir, target))
    }
}

impl std::fmt::Display for RdntUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{SCHEME}://{}{}", self.host, self.path)?;
        if !self.params.is_empty() {
            let mut sep = '?';
            for (k, v) in &self.params {
                write!(f, "{sep}{k}={v}")?;
                sep = '&';
            }
        }
        Ok(())
    }
}

fn percent_decode(input: &str) -> CoreResult<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes
                    .get(i + 1)
                    .and_then(|b| (*b as char).to_digit(16))
                    .ok_or_else(|| {
                        CoreError::Parse(format!("bad percent escape in {input}"))
                    })?;
                let lo = bytes
                    .get(i + 2)
                    .and_then(|b| (*b as char).to_digit(16))
                    .ok_or_else(|| {
                        CoreError::Parse(format!("bad percent escape in {input}"))
                    })?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            },
            b => {
                out.push(b);
                i += 1;
            },
        }
    }
    String::from_utf8(out)
        .map_err(|_| CoreError::Parse(format!("non-utf8 percent data in {input}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let u = RdntUrl::parse("rdnt://shop.comp1234.rednet/items/list?page=2&q=red%20stone")
            .expect("parse");
        assert_eq!(u.host, "shop.comp1234.rednet");
        assert_eq!(u.path, "/items/list");
        assert_eq!(u.params.get("page").map(String::as_str), Some("2"));
        assert_eq!(u.params.get("q").map(String::as_str), Some("red stone"));
    }

    #[test]
    fn test_parse_bare_host() {
        let u = RdntUrl::parse("rdnt://news").expect("parse");
        assert_eq!(u.host, "news");
        assert_eq!(u.path, "/");
    }

    #[test]
    fn test_canonical_strips_fragment_and_collapses() {
        let u = RdntUrl::parse("rdnt://News//a///b/#section").expect("parse");
        assert_eq!(u.canonical(), "rdnt://news/a/b");
    }

    #[test]
    fn test_join_relative_and_absolute() {
        let base = RdntUrl::parse("rdnt://site/docs/guide").expect("parse");
        assert_eq!(base.join("intro").expect("join").path, "/docs/intro");
        assert_eq!(base.join("/top").expect("join").path, "/top");
        assert_eq!(
            base.join("rdnt://other/x").expect("join").host,
            "other"
        );
    }

    #[test]
    fn test_rejects_foreign_scheme() {
        assert!(RdntUrl::parse("http://example.com").is_err());
    }
}
