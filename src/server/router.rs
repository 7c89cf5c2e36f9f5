// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    cfg::config::ServerConfig,
    collab::{ContentScanner, PermissionGate},
    dns::registry::DnsRegistry,
    error::{CoreError, SandboxFault},
    proto::{
        envelope::{Envelope, RequestPayload},
        status::Status,
    },
    sandbox::{
        Sandbox,
        api::{SandboxRequest, SessionSnapshot},
    },
    server::{
        sessions::SessionManager,
        site::{PageKind, SiteRoot},
    },
    url::RdntUrl,
};

/// Everything the router decided about one request. Converted into a
/// response or error envelope by the caller.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub status: Status,
    pub reason: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub cookies_set: BTreeMap<String, String>,
}

impl RouteOutcome {
    fn error(status: Status, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
            headers: BTreeMap::new(),
            body: String::new(),
            cookies_set: BTreeMap::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.status.code() >= 400
    }
}

/// Dispatches request envelopes to static files or sandboxed handlers of
/// locally hosted sites.
pub struct Router {
    dns: Arc<DnsRegistry>,
    sessions: Arc<SessionManager>,
    sandbox: Arc<Sandbox>,
    permissions: Arc<dyn PermissionGate>,
    scanner: Arc<dyn ContentScanner>,
    sites: DashMap<String, Arc<SiteRoot>>,
    /// Handler-visible persistent key-value stores, one per site.
    storage: DashMap<String, Arc<DashMap<String, String>>>,
    cookie_name: String,
}

impl Router {
    pub fn new(
        dns: Arc<DnsRegistry>,
        sessions: Arc<SessionManager>,
        sandbox: Arc<Sandbox>,
        permissions: Arc<dyn PermissionGate>,
        scanner: Arc<dyn ContentScanner>,
        cfg: &ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            dns,
            sessions,
            sandbox,
            permissions,
            scanner,
            sites: DashMap::new(),
            storage: DashMap::new(),
            cookie_name: cfg.cookie_name.clone(),
        })
    }

    /// Serves `root` under `name`. The name must already be registered.
    pub fn mount(&self, name: &str, root: SiteRoot) {
        self.sites
            .insert(name.to_ascii_lowercase(), Arc::new(root));
    }

    pub fn unmount(&self, name: &str) {
        self.sites.remove(&name.to_ascii_lowercase());
    }

    pub async fn handle_request(&self, env: &Envelope) -> RouteOutcome {
        let Some(request) = env.payload::<RequestPayload>() else {
            return RouteOutcome::error(Status::BadRequest, "malformed request");
        };

        let url = match RdntUrl::parse(&request.url) {
            Ok(u) => u,
            Err(e) => {
                return RouteOutcome::error(Status::BadRequest, e.to_string());
            },
        };

        // Only names this node actually registered are served.
        let host = url.host.to_ascii_lowercase();
        if self.dns.lookup_local(&host).is_none() {
            return RouteOutcome::error(
                Status::NotFound,
                format!("no such site: {host}"),
            );
        }
        let Some(site) = self.sites.get(&host).map(|s| s.value().clone()) else {
            return RouteOutcome::error(
                Status::NotFound,
                format!("site not mounted: {host}"),
            );
        };

        let page = match site.resolve(&url.path).await {
            Ok(p) => p,
            Err(CoreError::NotFound(_)) => {
                return RouteOutcome::error(
                    Status::NotFound,
                    format!("no page at {}", url.path),
                );
            },
            Err(e) => {
                warn!(error = %e, "page resolution failed");
                return RouteOutcome::error(Status::InternalError, "resolver error");
            },
        };

        match page.kind {
            PageKind::Handler => {
                self.run_handler(env, &request, &url, &host, &site, &page)
                    .await
            },
            PageKind::Markup | PageKind::Asset => {
                if page.kind == PageKind::Asset
                    && !self
                        .permissions
                        .check("download", &env.source.to_string())
                {
                    return RouteOutcome::error(
                        Status::Forbidden,
                        "download not permitted",
                    );
                }
                self.serve_static(env, &host, &site, &page).await
            },
        }
    }

    async fn serve_static(
        &self,
        env: &Envelope,
        host: &str,
        site: &Arc<SiteRoot>,
        page: &crate::server::site::ResolvedPage,
    ) -> RouteOutcome {
        let body = match site.read(page).await {
            Ok(b) => b,
            Err(_) => {
                return RouteOutcome::error(Status::NotFound, "file vanished");
            },
        };

        let verdict =
            self.scanner
                .scan(body.as_bytes(), &page.content_type, host);
        if !verdict.safe {
            debug!(source = env.source, threats = ?verdict.threats, "body blocked");
            return RouteOutcome::error(Status::Forbidden, "content blocked");
        }

        let mut headers = BTreeMap::new();
        headers.insert("Content-Type".to_string(), page.content_type.clone());
        RouteOutcome {
            status: Status::Ok,
            reason: None,
            headers,
            body,
            cookies_set: BTreeMap::new(),
        }
    }

    async fn run_handler(
        &self,
        env: &Envelope,
        request: &RequestPayload,
        url: &RdntUrl,
        host: &str,
        site: &Arc<SiteRoot>,
        page: &crate::server::site::ResolvedPage,
    ) -> RouteOutcome {
        let script = match site.read(page).await {
            Ok(s) => s,
            Err(_) => {
                return RouteOutcome::error(Status::NotFound, "handler vanished");
            },
        };

        let cookie = request.cookies.get(&self.cookie_name).map(String::as_str);
        let had_cookie = cookie.is_some();
        let session = self.sessions.get_or_create(cookie);
        let fresh_session = !had_cookie
            || cookie.is_some_and(|c| c != session.id);

        let storage = self
            .storage
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(DashMap::new()))
            .value()
            .clone();
        let storage_snapshot: BTreeMap<String, String> = storage
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let sandbox_request = SandboxRequest {
            method: request.method.clone(),
            url: request.url.clone(),
            path: url.path.clone(),
            params: url.params.clone(),
            headers: request.headers.clone(),
            cookies: request.cookies.clone(),
            body: request.body.clone(),
            session_id: Some(session.id.clone()),
        };
        let snapshot = SessionSnapshot {
            session_id: Some(session.id.clone()),
            data: session.data.clone(),
            storage: storage_snapshot,
        };

        match self.sandbox.invoke(&script, sandbox_request, snapshot).await {
            Ok(invocation) => {
                self.sessions.persist(&session.id, &invocation.session_updates);
                let storage_ok = invocation.storage_updates.is_empty()
                    || self
                        .permissions
                        .check_with_prompt("storage", host);
                if storage_ok {
                    for (k, update) in invocation.storage_updates {
                        match update {
                            Some(v) => {
                                storage.insert(k, v);
                            },
                            None => {
                                storage.remove(&k);
                            },
                        }
                    }
                } else {
                    debug!(host, "storage writes denied by permission gate");
                }

                let mut outcome = RouteOutcome {
                    status: map_status(invocation.response.status),
                    reason: None,
                    headers: invocation.response.headers,
                    body: invocation.response.body,
                    cookies_set: invocation.response.cookies_set,
                };
                if fresh_session {
                    outcome
                        .cookies_set
                        .insert(self.cookie_name.clone(), session.id);
                }
                outcome
            },
            Err(CoreError::Sandbox { kind, message }) => {
                debug!(host, %kind, message, "handler failed");
                match kind {
                    SandboxFault::Timeout => {
                        RouteOutcome::error(Status::Unavailable, "timeout")
                    },
                    SandboxFault::LimitExceeded => {
                        RouteOutcome::error(Status::Unavailable, "limit_exceeded")
                    },
                    SandboxFault::ForbiddenAccess => {
                        RouteOutcome::error(Status::Forbidden, "forbidden_access")
                    },
                    SandboxFault::Syntax | SandboxFault::Runtime => {
                        RouteOutcome::error(Status::InternalError, "handler error")
                    },
                }
            },
            Err(e) => {
                warn!(error = %e, "sandbox invocation failed");
                RouteOutcome::error(Status::InternalError, "handler error")
            },
        }
    }
}

/// Clamps a handler-chosen status onto the closed response set.
fn map_status(code: u16) -> Status {
    Status::try_from(code).unwrap_or(match code {
        200..=299 => Status::Ok,
        300..=399 => Status::Found,
        400..=499 => Status::BadRequest,
        _ => Status::InternalError,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status_clamps_unlisted_codes() {
        assert_eq!(map_status(200), Status::Ok);
        assert_eq!(map_status(204), Status::Ok);
        assert_eq!(map_status(307), Status::Found);
        assert_eq!(map_status(418), Status::BadRequest);
        assert_eq!(map_status(599), Status::InternalError);
    }
}
