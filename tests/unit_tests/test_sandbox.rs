// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use rednet_explorer::{
    cfg::config::SandboxConfig,
    error::{CoreError, SandboxFault},
    sandbox::{
        Sandbox,
        api::{SandboxRequest, SessionSnapshot},
    },
};

fn quick_sandbox() -> std::sync::Arc<Sandbox> {
    let cfg = SandboxConfig {
        wall_clock: Duration::from_millis(300),
        op_budget: 100_000,
        output_bytes_max: 8 * 1024,
        string_bytes_max: 2 * 1024,
        memory_bytes_max: 256 * 1024,
        concurrent_max: 2,
    };
    Sandbox::new(&cfg)
}

fn request(path: &str) -> SandboxRequest {
    SandboxRequest {
        method: "GET".to_string(),
        url: format!("rdnt://site{path}"),
        path: path.to_string(),
        ..SandboxRequest::default()
    }
}

#[tokio::test]
async fn test_happy_path_page() {
    let sandbox = quick_sandbox();
    let script = r#"
        response.set_header("Content-Type", "text/rwml")
        print("hello from " .. request.path)
    "#;
    let out = sandbox
        .invoke(script, request("/page"), SessionSnapshot::default())
        .await
        .expect("invoke");
    assert_eq!(out.response.status, 200);
    assert_eq!(out.response.body, "hello from /page\n");
    assert_eq!(
        out.response.headers.get("Content-Type").map(String::as_str),
        Some("text/rwml")
    );
}

#[tokio::test]
async fn test_spin_loop_is_bounded() {
    let sandbox = quick_sandbox();
    let started = std::time::Instant::now();
    let err = sandbox
        .invoke("while 1 do end", request("/spin"), SessionSnapshot::default())
        .await
        .unwrap_err();
    match err {
        CoreError::Sandbox { kind, .. } => assert!(matches!(
            kind,
            SandboxFault::LimitExceeded | SandboxFault::Timeout
        )),
        other => panic!("unexpected {other:?}"),
    }
    // Bounded well below a second with these limits.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_screen_blocks_before_execution() {
    let sandbox = quick_sandbox();
    let err = sandbox
        .invoke(
            "local h = io.open(\"x\")",
            request("/"),
            SessionSnapshot::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Sandbox {
            kind: SandboxFault::ForbiddenAccess,
            ..
        }
    ));
}

#[tokio::test]
async fn test_syntax_error_kind() {
    let sandbox = quick_sandbox();
    let err = sandbox
        .invoke("if then end", request("/"), SessionSnapshot::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Sandbox {
            kind: SandboxFault::Syntax,
            ..
        }
    ));
}

#[tokio::test]
async fn test_a_slow_handler_does_not_block_a_fast_one() {
    let sandbox = quick_sandbox();

    let slow = {
        let sandbox = std::sync::Arc::clone(&sandbox);
        tokio::spawn(async move {
            sandbox
                .invoke("while 1 do end", request("/spin"), SessionSnapshot::default())
                .await
        })
    };

    let started = std::time::Instant::now();
    let fast = sandbox
        .invoke("print(\"ok\")", request("/fast"), SessionSnapshot::default())
        .await
        .expect("fast invoke");
    assert_eq!(fast.response.body, "ok\n");
    assert!(started.elapsed() < Duration::from_secs(1));

    let slow = slow.await.expect("join");
    assert!(slow.is_err());
}

#[tokio::test]
async fn test_storage_round_trip_through_snapshot() {
    let sandbox = quick_sandbox();
    let mut snapshot = SessionSnapshot::default();
    snapshot
        .storage
        .insert("counter".to_string(), "41".to_string());

    let script = r#"
        local n = tonumber(storage.get("counter")) + 1
        storage.set("counter", tostring(n))
        write(n)
    "#;
    let out = sandbox
        .invoke(script, request("/count"), snapshot)
        .await
        .expect("invoke");
    assert_eq!(out.response.body, "42");
    assert_eq!(
        out.storage_updates.get("counter"),
        Some(&Some("42".to_string()))
    );
}
