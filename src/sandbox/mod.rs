// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::Arc, time::Duration};

use tokio::{sync::Semaphore, time::timeout};
use tracing::warn;

use crate::{
    cfg::config::SandboxConfig,
    error::{CoreError, CoreResult, SandboxFault},
    sandbox::{
        api::{SandboxInvocation, SandboxRequest, SessionSnapshot},
        limits::SandboxLimits,
    },
};

pub mod api;
pub mod interp;
pub mod lexer;
pub mod limits;
pub mod parser;
pub mod screen;
pub mod value;

/// Extra wall-clock slack given to the outer watchdog beyond the
/// interpreter's own deadline, so the cooperative check usually fires
/// first.
const WATCHDOG_GRACE: Duration = Duration::from_millis(500);

/// Executes untrusted handler scripts with enforced limits.
///
/// One invocation is one fault domain: the evaluator runs on a blocking
/// worker with its own deadline and operation budget, and whatever goes
/// wrong comes back as a `SandboxFault`, never a crash of the caller. At
/// most `concurrent_max` invocations run at once; excess callers queue on
/// the semaphore.
pub struct Sandbox {
    limits: SandboxLimits,
    permits: Arc<Semaphore>,
}

impl Sandbox {
    pub fn new(cfg: &SandboxConfig) -> Arc<Self> {
        Arc::new(Self {
            limits: SandboxLimits::from_config(cfg),
            permits: Arc::new(Semaphore::new(cfg.concurrent_max)),
        })
    }

    /// Runs `script` against one request. The snapshot arguments keep the
    /// invocation self-contained: handler effects are confined to the
    /// returned response, session updates and storage updates.
    pub async fn invoke(
        &self,
        script: &str,
        request: SandboxRequest,
        session: SessionSnapshot,
    ) -> CoreResult<SandboxInvocation> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| {
                CoreError::sandbox(SandboxFault::Runtime, "sandbox shut down")
            })?;

        screen::static_screen(script)?;

        let limits = self.limits.clone();
        let source = script.to_string();
        let worker =
            tokio::task::spawn_blocking(move || {
                interp::run_script(&source, &limits, request, session)
            });

        match timeout(self.limits.wall_clock + WATCHDOG_GRACE, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                warn!(error = %join_err, "handler worker died");
                Err(CoreError::sandbox(
                    SandboxFault::Runtime,
                    "handler crashed",
                ))
            },
            // The worker is abandoned; its own deadline check stops it at
            // the next operation boundary.
            Err(_) => Err(CoreError::sandbox(
                SandboxFault::Timeout,
                "handler exceeded wall clock limit",
            )),
        }
    }
}
