// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use rednet_explorer::{
    cfg::config::IndexConfig,
    search::{index::SearchIndex, query::search},
};

/// Two documents, straight from the operator examples: A holds
/// "turtle mining guide", B holds "advanced mining".
fn seeded() -> std::sync::Arc<SearchIndex> {
    let index = SearchIndex::new(&IndexConfig::default());
    index.add_document(
        "rdnt://docs.comp1.rednet/a",
        "turtle mining guide",
        "turtle mining guide",
        "rwml",
    );
    index.add_document(
        "rdnt://docs.comp1.rednet/b",
        "advanced mining",
        "advanced mining",
        "rwml",
    );
    index
}

#[test]
fn test_plain_and_query() {
    let index = seeded();
    let hits = search(&index, "turtle mining", 10);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].url, "rdnt://docs.comp1.rednet/a");
}

#[test]
fn test_negation_excludes() {
    let index = seeded();
    let hits = search(&index, "mining -turtle", 10);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].url, "rdnt://docs.comp1.rednet/b");
}

#[test]
fn test_phrase_query() {
    let index = seeded();
    let hits = search(&index, "\"advanced mining\"", 10);
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].url, "rdnt://docs.comp1.rednet/b");
}

#[test]
fn test_or_unions_groups() {
    let index = seeded();
    let hits = search(&index, "turtle OR advanced", 10);
    assert_eq!(hits.len(), 2);
}

#[test]
fn test_empty_query_is_empty_result() {
    let index = seeded();
    assert!(search(&index, "", 10).is_empty());
}

#[test]
fn test_snippet_window_is_bounded() {
    let index = SearchIndex::new(&IndexConfig::default());
    let body = format!("{} beacon {}", "padding ".repeat(30), "padding ".repeat(30));
    index.add_document("rdnt://a/long", "long page", &body, "rwml");
    let hits = search(&index, "beacon", 10);
    assert_eq!(hits.len(), 1);
    assert!(hits[0].snippet.contains("beacon"));
    assert!(hits[0].snippet.chars().count() < body.chars().count());
}
