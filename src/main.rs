// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::process::ExitCode;

use anyhow::{Context, Result};
use rednet_explorer::{
    bus::loopback::LoopbackHub,
    cfg::{cli::resolve_optional_config_path, config::Config, logger::init_logger},
    node::RedNet,
    server::site::SiteRoot,
};
use tracing::info;

const EXIT_USAGE: u8 = 1;
const EXIT_NETWORK: u8 = 2;
const EXIT_CONFIG: u8 = 3;
const EXIT_FATAL: u8 = 4;

fn usage() -> ExitCode {
    eprintln!("usage: rednet-explorer [config.yaml] [--serve <name> <root>]");
    ExitCode::from(EXIT_USAGE)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path: Option<String> = None;
    let mut serve: Option<(String, String)> = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--serve" => {
                if args.len() < i + 3 {
                    return usage();
                }
                serve = Some((args[i + 1].clone(), args[i + 2].clone()));
                i += 3;
            },
            flag if flag.starts_with('-') => return usage(),
            path => {
                if config_path.is_some() {
                    return usage();
                }
                config_path = Some(path.to_string());
                i += 1;
            },
        }
    }

    let cfg = match load_config(config_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration invalid: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        },
    };

    let _log_guard = match init_logger(None) {
        Ok(g) => g,
        Err(e) => {
            eprintln!("fatal: logger init failed: {e:#}");
            return ExitCode::from(EXIT_FATAL);
        },
    };

    match run(cfg, serve).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Network(e)) => {
            eprintln!("network unavailable: {e:#}");
            ExitCode::from(EXIT_NETWORK)
        },
        Err(RunError::Fatal(e)) => {
            eprintln!("fatal: {e:#}");
            ExitCode::from(EXIT_FATAL)
        },
    }
}

enum RunError {
    Network(anyhow::Error),
    Fatal(anyhow::Error),
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(p) => {
            let resolved = resolve_optional_config_path(p)?
                .with_context(|| format!("config file not found: {p}"))?;
            Config::load_from_file(resolved)
        },
        None => {
            let mut cfg = Config::default();
            cfg.validate_and_normalize()?;
            Ok(cfg)
        },
    }
}

async fn run(cfg: Config, serve: Option<(String, String)>) -> Result<(), RunError> {
    // The host environment normally hands us the bus; standalone runs get
    // an in-process hub with the id from RDNT_NODE_ID.
    let node_id = std::env::var("RDNT_NODE_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1u64);

    let hub = LoopbackHub::new();
    let (bus, frames) = hub.attach(node_id);

    let node = RedNet::start(cfg, bus, frames);

    if let Some((name, root)) = serve {
        node.host_site(&name, SiteRoot::new(root))
            .await
            .map_err(|e| RunError::Fatal(anyhow::anyhow!("host site: {e}")))?;
        info!(name, "serving site");
    }

    node.announce()
        .await
        .map_err(|e| RunError::Network(anyhow::anyhow!("announce: {e}")))?;

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| RunError::Fatal(e.into()))?;
    node.shutdown();
    Ok(())
}
