// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tokio::{
    sync::Semaphore,
    time::{Instant, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{
    cfg::config::CrawlConfig,
    collab::{ContentScanner, MarkupParser},
    crawler::robots::RobotsRules,
    dns::resolver::Resolver,
    error::{CoreError, CoreResult},
    proto::envelope::{ErrorPayload, MessageKind, RequestPayload, ResponsePayload},
    search::index::SearchIndex,
    transport::adapter::Transport,
    url::RdntUrl,
};

/// Per-crawl limits; defaults come from the crawl config section.
#[derive(Debug, Clone)]
pub struct CrawlLimits {
    pub max_depth: u32,
    pub max_pages: usize,
    pub min_interval: Duration,
    pub timeout: Duration,
    pub follow_external: bool,
    pub max_age: Duration,
}

impl CrawlLimits {
    pub fn from_config(cfg: &CrawlConfig) -> Self {
        Self {
            max_depth: cfg.max_depth,
            max_pages: cfg.max_pages,
            min_interval: cfg.min_interval,
            timeout: cfg.timeout,
            follow_external: cfg.follow_external,
            max_age: cfg.max_age,
        }
    }
}

/// What one crawl did, and what it left out.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlReport {
    pub seed: String,
    pub pages_fetched: usize,
    pub pages_indexed: usize,
    pub pages_skipped: usize,
    pub errors: usize,
    /// URLs refused by exclusion directives.
    pub excluded: Vec<String>,
    /// Hosts given up on: robots fetch failed closed or too many
    /// consecutive errors.
    pub abandoned_hosts: Vec<String>,
    /// The page budget ran out with work still queued.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

/// Document fetch seam. The crawler goes through the same request path a
/// browser uses; tests plug in a canned fetcher.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &RdntUrl, timeout: Duration) -> CoreResult<FetchedPage>;
}

/// Fetcher over DNS resolution plus a request/response exchange.
pub struct TransportFetcher {
    resolver: Arc<Resolver>,
    transport: Arc<Transport>,
    agent: String,
}

impl TransportFetcher {
    pub fn new(
        resolver: Arc<Resolver>,
        transport: Arc<Transport>,
        agent: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            transport,
            agent: agent.into(),
        })
    }
}

#[async_trait]
impl PageFetcher for TransportFetcher {
    async fn fetch(&self, url: &RdntUrl, timeout: Duration) -> CoreResult<FetchedPage> {
        let resolved = self.resolver.lookup(&url.host).await?;

        let mut headers = std::collections::BTreeMap::new();
        headers.insert("User-Agent".to_string(), self.agent.clone());
        let payload = RequestPayload {
            method: "GET".to_string(),
            url: url.to_string(),
            headers,
            cookies: Default::default(),
            body: None,
        };
        let env = self
            .transport
            .codec()
            .create_request(resolved.record.node_id, &payload)?;
        let reply = self.transport.exchange(env, Some(timeout)).await?;

        match reply.kind {
            MessageKind::Response => {
                let response: ResponsePayload = reply.payload().ok_or_else(|| {
                    CoreError::Parse("malformed response payload".to_string())
                })?;
                Ok(FetchedPage {
                    status: response.status,
                    content_type: response
                        .headers
                        .get("Content-Type")
                        .cloned()
                        .unwrap_or_default(),
                    body: response.body,
                })
            },
            MessageKind::Error => {
                let error: ErrorPayload = reply.payload().ok_or_else(|| {
                    CoreError::Parse("malformed error payload".to_string())
                })?;
                Ok(FetchedPage {
                    status: error.status,
                    content_type: String::new(),
                    body: String::new(),
                })
            },
            other => Err(CoreError::Parse(format!(
                "unexpected reply kind {}",
                other.as_wire()
            ))),
        }
    }
}

/// Link-walks sites into the search index, politely.
pub struct Crawler {
    fetcher: Arc<dyn PageFetcher>,
    index: Arc<SearchIndex>,
    markup: Arc<dyn MarkupParser>,
    scanner: Arc<dyn ContentScanner>,
    cfg: CrawlConfig,
    /// Earliest next-fetch instant per host, shared across crawls.
    host_next_fetch: DashMap<String, Instant>,
    /// Concurrent fetch cap per host, shared across crawls.
    host_slots: DashMap<String, Arc<Semaphore>>,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        index: Arc<SearchIndex>,
        markup: Arc<dyn MarkupParser>,
        scanner: Arc<dyn ContentScanner>,
        cfg: CrawlConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            fetcher,
            index,
            markup,
            scanner,
            cfg,
            host_next_fetch: DashMap::new(),
            host_slots: DashMap::new(),
        })
    }

    pub fn default_limits(&self) -> CrawlLimits {
        CrawlLimits::from_config(&self.cfg)
    }

    /// Breadth-first walk from `seed`, bounded by `limits`.
    pub async fn crawl_site(
        &self,
        seed: &str,
        limits: &CrawlLimits,
    ) -> CoreResult<CrawlReport> {
        let seed_url = RdntUrl::parse(seed)?;
        let mut report = CrawlReport {
            seed: seed_url.canonical(),
            ..CrawlReport::default()
        };

        let mut queue: VecDeque<(RdntUrl, u32)> = VecDeque::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut robots: HashMap<String, Option<RobotsRules>> = HashMap::new();
        let mut host_errors: HashMap<String, usize> = HashMap::new();
        let mut abandoned: HashSet<String> = HashSet::new();

        visited.insert(seed_url.canonical());
        queue.push_back((seed_url, 0));

        while let Some((url, depth)) = queue.pop_front() {
            if report.pages_fetched >= limits.max_pages {
                report.truncated = true;
                break;
            }

            let host = url.host.to_ascii_lowercase();
            if abandoned.contains(&host) {
                report.pages_skipped += 1;
                continue;
            }

            // First contact with a host reads its exclusion rules. A
            // robots fetch that fails closes the host for this crawl.
            if !robots.contains_key(&host) {
                let rules = self.fetch_robots(&url, limits).await;
                if rules.is_none() {
                    warn!(host, "robots fetch failed, skipping host");
                    abandoned.insert(host.clone());
                    report.abandoned_hosts.push(host.clone());
                    robots.insert(host.clone(), None);
                    report.pages_skipped += 1;
                    continue;
                }
                robots.insert(host.clone(), rules);
            }
            let rules = match robots.get(&host) {
                Some(Some(r)) => r.clone(),
                _ => {
                    report.pages_skipped += 1;
                    continue;
                },
            };

            if !rules.is_allowed(&self.cfg.agent, &url.path) {
                debug!(url = %url, "excluded by robots rules");
                report.excluded.push(url.canonical());
                continue;
            }

            // Freshly indexed copies are not re-fetched.
            if let Some(doc) = self.index.doc_by_url(&url.canonical()) {
                let age_ms = chrono::Utc::now().timestamp_millis() - doc.indexed_at;
                if age_ms >= 0 && (age_ms as u128) < limits.max_age.as_millis() {
                    report.pages_skipped += 1;
                    continue;
                }
            }

            let delay = rules
                .crawl_delay(&self.cfg.agent)
                .unwrap_or(Duration::ZERO)
                .max(limits.min_interval);
            let page = self.polite_fetch(&host, &url, delay, limits.timeout).await;
            report.pages_fetched += 1;

            let page = match page {
                Ok(p) if p.status == 200 => {
                    host_errors.insert(host.clone(), 0);
                    p
                },
                Ok(p) => {
                    debug!(url = %url, status = p.status, "page skipped");
                    report.errors += 1;
                    self.note_host_error(
                        &host,
                        &mut host_errors,
                        &mut abandoned,
                        &mut report,
                    );
                    continue;
                },
                Err(e) => {
                    debug!(url = %url, error = %e, "fetch failed");
                    report.errors += 1;
                    self.note_host_error(
                        &host,
                        &mut host_errors,
                        &mut abandoned,
                        &mut report,
                    );
                    continue;
                },
            };

            let verdict =
                self.scanner
                    .scan(page.body.as_bytes(), &page.content_type, &host);
            if !verdict.safe {
                warn!(url = %url, threats = ?verdict.threats, "content blocked from index");
                report.pages_skipped += 1;
                continue;
            }

            let parsed = self.markup.parse(&page.body);
            let title = parsed
                .title
                .clone()
                .unwrap_or_else(|| url.canonical());
            self.index.add_document(
                &url.canonical(),
                &title,
                &parsed.text,
                kind_from_content_type(&page.content_type),
            );
            report.pages_indexed += 1;

            if depth < limits.max_depth {
                for link in &parsed.links {
                    let Ok(next) = url.join(link) else {
                        continue;
                    };
                    let off_site =
                        !next.host.eq_ignore_ascii_case(&url.host);
                    if off_site && !limits.follow_external {
                        continue;
                    }
                    if visited.insert(next.canonical()) {
                        queue.push_back((next, depth + 1));
                    }
                }
            }
        }

        if !queue.is_empty() {
            report.truncated = true;
        }
        info!(
            seed = %report.seed,
            fetched = report.pages_fetched,
            indexed = report.pages_indexed,
            excluded = report.excluded.len(),
            truncated = report.truncated,
            "crawl finished"
        );
        Ok(report)
    }

    async fn fetch_robots(
        &self,
        any_url: &RdntUrl,
        limits: &CrawlLimits,
    ) -> Option<RobotsRules> {
        let robots_url = RdntUrl {
            host: any_url.host.clone(),
            path: "/robots.txt".to_string(),
            params: Default::default(),
        };
        let host = any_url.host.to_ascii_lowercase();
        match self
            .polite_fetch(&host, &robots_url, limits.min_interval, limits.timeout)
            .await
        {
            Ok(page) if page.status == 200 => Some(RobotsRules::parse(&page.body)),
            // No robots file means no restrictions.
            Ok(_) => Some(RobotsRules::default()),
            // Unreachable rules fail closed.
            Err(_) => None,
        }
    }

    /// Fetch under the per-host rate floor and concurrency cap.
    async fn polite_fetch(
        &self,
        host: &str,
        url: &RdntUrl,
        delay: Duration,
        timeout: Duration,
    ) -> CoreResult<FetchedPage> {
        let slots = self
            .host_slots
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.cfg.per_host_fetches)))
            .value()
            .clone();
        let _slot = slots.acquire_owned().await.map_err(|_| {
            CoreError::Timeout("crawler shutting down".to_string())
        })?;

        let now = Instant::now();
        let ready_at = {
            let mut entry = self
                .host_next_fetch
                .entry(host.to_string())
                .or_insert(now);
            let ready = (*entry).max(now);
            *entry = ready + delay;
            ready
        };
        sleep_until(ready_at).await;

        self.fetcher.fetch(url, timeout).await
    }

    fn note_host_error(
        &self,
        host: &str,
        host_errors: &mut HashMap<String, usize>,
        abandoned: &mut HashSet<String>,
        report: &mut CrawlReport,
    ) {
        let streak = host_errors.entry(host.to_string()).or_insert(0);
        *streak += 1;
        if *streak >= 5 && abandoned.insert(host.to_string()) {
            warn!(host, streak, "host abandoned for this crawl");
            report.abandoned_hosts.push(host.to_string());
        }
    }
}

fn kind_from_content_type(content_type: &str) -> &str {
    match content_type {
        "text/rwml" => "rwml",
        "text/x-handler" => "lua",
        other => {
            let tail = other.rsplit('/').next().unwrap_or("");
            if tail.is_empty() { "unknown" } else { tail }
        },
    }
}
