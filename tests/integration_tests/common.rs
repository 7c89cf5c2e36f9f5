// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use rednet_explorer::{
    bus::loopback::LoopbackHub,
    cfg::config::Config,
    node::RedNet,
    proto::envelope::NodeId,
    server::site::SiteRoot,
    utils::random_token,
};

/// Config tuned for loopback tests: short windows, quick retries.
pub fn fast_config() -> Config {
    let mut cfg = Config::default();
    cfg.transport.send_timeout = Duration::from_millis(400);
    cfg.transport.retries = 1;
    cfg.transport.retry_backoff = Duration::from_millis(50);
    cfg.dns.query_window = Duration::from_millis(200);
    cfg.dns.verification_timeout = Duration::from_millis(300);
    cfg.crawl.min_interval = Duration::from_millis(5);
    cfg.crawl.timeout = Duration::from_millis(500);
    cfg.validate_and_normalize().expect("valid test config");
    cfg
}

/// A handful of nodes attached to one in-process hub.
pub struct TestNet {
    pub hub: Arc<LoopbackHub>,
    pub nodes: Vec<Arc<RedNet>>,
}

impl TestNet {
    pub fn spawn(ids: &[NodeId]) -> Self {
        Self::spawn_with(ids, fast_config)
    }

    pub fn spawn_with(ids: &[NodeId], make_cfg: fn() -> Config) -> Self {
        let hub = LoopbackHub::new();
        let nodes = ids
            .iter()
            .map(|&id| {
                let (bus, frames) = hub.attach(id);
                RedNet::start(make_cfg(), bus, frames)
            })
            .collect();
        Self { hub, nodes }
    }

    pub fn node(&self, i: usize) -> &Arc<RedNet> {
        &self.nodes[i]
    }
}

impl Drop for TestNet {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

/// Site fixture on disk, removed on drop.
pub struct TempSite {
    root: PathBuf,
}

impl TempSite {
    pub async fn with_files(files: &[(&str, &str)]) -> Self {
        let root = std::env::temp_dir().join(format!("rednet-site-{}", random_token(8)));
        for (name, body) in files {
            let path = root.join(name);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.expect("mkdir");
            }
            tokio::fs::write(&path, body).await.expect("write fixture");
        }
        Self { root }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn site_root(&self) -> SiteRoot {
        SiteRoot::new(&self.root)
    }
}

impl Drop for TempSite {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}
