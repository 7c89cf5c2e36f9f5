// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use rednet_explorer::{
    cfg::config::Config,
    proto::{
        codec::{Codec, Decoded},
        envelope::{MessageKind, RequestPayload, ResponsePayload},
        status::Status,
    },
};

fn pair() -> (Codec, Codec) {
    let cfg = Config::default();
    (Codec::new(10, &cfg), Codec::new(20, &cfg))
}

#[test]
fn test_request_response_correlation_fields() -> Result<()> {
    let (client, server) = pair();

    let request = client.create_request(
        20,
        &RequestPayload {
            method: "GET".to_string(),
            url: "rdnt://shop.comp20.rednet/items?page=2".to_string(),
            ..RequestPayload::default()
        },
    )?;
    assert_eq!(request.kind, MessageKind::Request);
    assert_eq!(request.source, 10);
    assert_eq!(request.target, Some(20));

    let response = server.create_response(
        &request,
        Status::Ok,
        ResponsePayload {
            in_reply_to: String::new(),
            status: 0,
            headers: Default::default(),
            body: "<page/>".to_string(),
            cookies_set: Default::default(),
        },
    )?;
    assert_eq!(response.in_reply_to(), Some(request.id.as_str()));
    assert_eq!(response.target, Some(10));

    let parsed: ResponsePayload = response.payload().expect("payload");
    assert_eq!(parsed.status, 200);
    assert_eq!(parsed.body, "<page/>");
    Ok(())
}

#[test]
fn test_error_helper_carries_reason() -> Result<()> {
    let (client, server) = pair();
    let request = client.create_request(
        20,
        &RequestPayload {
            method: "GET".to_string(),
            url: "rdnt://nowhere/".to_string(),
            ..RequestPayload::default()
        },
    )?;
    let error = server.create_error(&request, Status::NotFound, "no such site")?;

    let bytes = Codec::to_bytes(&error)?;
    let decoded = match client.decode_at(&bytes, error.timestamp_ms)? {
        Decoded::Accepted(env) => env,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(decoded.kind, MessageKind::Error);
    let payload: rednet_explorer::proto::envelope::ErrorPayload =
        decoded.payload().expect("payload");
    assert_eq!(payload.status, 404);
    assert_eq!(payload.reason, "no such site");
    Ok(())
}

#[test]
fn test_wire_round_trip_across_nodes() -> Result<()> {
    let (a, b) = pair();

    let env = a.encode(
        MessageKind::DnsQuery,
        &rednet_explorer::proto::envelope::DnsQueryPayload {
            name: "news".to_string(),
            want_verified: true,
        },
        None,
    )?;
    let bytes = Codec::to_bytes(&env)?;
    let decoded = match b.decode_at(&bytes, env.timestamp_ms)? {
        Decoded::Accepted(env) => env,
        other => panic!("unexpected {other:?}"),
    };
    assert_eq!(decoded, env);
    Ok(())
}

#[test]
fn test_status_closed_set() {
    for code in [200u16, 301, 302, 400, 401, 403, 404, 500, 503] {
        let status = Status::try_from(code).expect("listed status");
        assert_eq!(status.code(), code);
    }
    assert!(Status::try_from(418).is_err());
    assert!(Status::MovedPermanently.is_redirect());
    assert!(!Status::Ok.is_redirect());
}

#[test]
fn test_id_allocation_is_unique_and_bounded() {
    let cfg = Config::default();
    let codec = Codec::new(7, &cfg);
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
        let id = codec.next_id();
        assert!(id.len() <= 64);
        assert!(seen.insert(id));
    }
}
