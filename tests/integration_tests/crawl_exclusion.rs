// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::Result;
use serial_test::serial;

use crate::integration_tests::common::{TempSite, TestNet};

fn shop_site() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "index.rwml",
            "# Shop Front\nSee href=\"/about\" and href=\"/private/secret\" for more.",
        ),
        ("about.rwml", "# About\nWe sell mining turtles."),
        ("private/secret.rwml", "# Secret\nUnlisted stock numbers."),
        ("robots.txt", "User-agent: *\nDisallow: /private/\n"),
    ]
}

/// Exclusion rules keep `/private/` out of the index, and the report says
/// which URL was excluded.
#[tokio::test]
#[serial]
async fn test_crawl_respects_exclusion_rules() -> Result<()> {
    let net = TestNet::spawn(&[10, 20]);
    let site = TempSite::with_files(&shop_site()).await;
    net.node(0)
        .host_site("shop.comp10.rednet", site.site_root())
        .await?;

    let report = net.node(1).crawl("rdnt://shop.comp10.rednet/").await?;

    assert_eq!(report.pages_indexed, 2, "report: {report:?}");
    assert!(
        report
            .excluded
            .iter()
            .any(|u| u.contains("/private/secret")),
        "excluded list should name the blocked URL: {report:?}"
    );

    let index = &net.node(1).index;
    assert!(index.doc_by_url("rdnt://shop.comp10.rednet/about").is_some());
    assert!(
        index
            .doc_by_url("rdnt://shop.comp10.rednet/private/secret")
            .is_none()
    );
    Ok(())
}

/// Crawled pages are searchable afterwards, through the same index.
#[tokio::test]
#[serial]
async fn test_crawl_then_search() -> Result<()> {
    let net = TestNet::spawn(&[10, 20]);
    let site = TempSite::with_files(&shop_site()).await;
    net.node(0)
        .host_site("shop.comp10.rednet", site.site_root())
        .await?;

    net.node(1).crawl("rdnt://shop.comp10.rednet/").await?;

    let hits = net.node(1).search("mining turtles", 10);
    assert_eq!(hits.len(), 1);
    assert!(hits[0].url.contains("/about"));
    assert!(!hits[0].snippet.is_empty());

    // Nothing from the excluded area leaks into search.
    assert!(net.node(1).search("unlisted stock", 10).is_empty());
    Ok(())
}

/// The page budget terminates the crawl cleanly and reports truncation.
#[tokio::test]
#[serial]
async fn test_max_pages_truncates() -> Result<()> {
    let net = TestNet::spawn(&[10, 20]);
    let site = TempSite::with_files(&[
        (
            "index.rwml",
            "# Hub\nhref=\"/a\" href=\"/b\" href=\"/c\" href=\"/d\"",
        ),
        ("a.rwml", "# A"),
        ("b.rwml", "# B"),
        ("c.rwml", "# C"),
        ("d.rwml", "# D"),
    ])
    .await;
    net.node(0)
        .host_site("shop.comp10.rednet", site.site_root())
        .await?;

    let mut limits = net.node(1).crawler.default_limits();
    limits.max_pages = 2;
    let report = net
        .node(1)
        .crawler
        .crawl_site("rdnt://shop.comp10.rednet/", &limits)
        .await?;

    assert!(report.truncated, "report: {report:?}");
    assert!(report.pages_fetched <= 2);
    Ok(())
}
