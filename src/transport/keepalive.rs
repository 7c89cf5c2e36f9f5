// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use chrono::Utc;
use tokio::time::sleep;
use tracing::debug;

use crate::{peers::connection::ConnState, transport::adapter::Transport};

/// Keepalive loop: pings open connections that went quiet and fails the
/// ones that stop answering. Also purges the codec's replay map so old
/// dedup entries do not accumulate.
pub(crate) async fn run(transport: Arc<Transport>) {
    let interval = transport.cfg.keepalive_interval;
    let probe_every = interval / 2;

    loop {
        tokio::select! {
            _ = transport.cancel.cancelled() => return,
            _ = sleep(probe_every) => {},
        }

        let now = Utc::now().timestamp_millis();
        transport.codec.purge_replay(now);

        let idle_threshold = interval.as_millis() as i64;
        for conn in transport.registry.connections() {
            if conn.state() != ConnState::Open {
                continue;
            }
            if conn.idle_for_ms(now) < idle_threshold {
                continue;
            }

            let remote = conn.remote;
            let me = Arc::clone(&transport);
            tokio::spawn(async move {
                debug!(remote, "keepalive ping");
                if let Err(e) = me.ping(remote, Some(me.cfg.send_timeout)).await {
                    me.registry.on_keepalive_miss(remote, &e);
                }
            });
        }
    }
}
