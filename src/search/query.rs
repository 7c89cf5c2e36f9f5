// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashSet;

use serde::Serialize;

use crate::{
    search::{
        index::{DocId, DocMeta, SearchIndex},
        snippet::make_snippet,
        tokenizer::terms,
    },
    url::RdntUrl,
};

/// A single positive or negative query unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryTerm {
    Word(String),
    /// Quoted phrase; matches only consecutive tokens.
    Phrase(Vec<String>),
}

/// Terms between two `OR`s: all includes must match, no exclude may.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Group {
    pub include: Vec<QueryTerm>,
    pub exclude: Vec<QueryTerm>,
}

/// Query-wide filters.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Filters {
    pub site: Option<String>,
    pub kind: Option<String>,
    /// Terms that must appear inside the stored title.
    pub title: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ParsedQuery {
    pub groups: Vec<Group>,
    pub filters: Filters,
}

impl ParsedQuery {
    /// True when nothing positive was asked for; such a query matches
    /// nothing rather than everything.
    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.include.is_empty())
            && self.filters.title.is_empty()
    }

    fn positive_words(&self) -> Vec<String> {
        let mut out = Vec::new();
        for group in &self.groups {
            for term in &group.include {
                match term {
                    QueryTerm::Word(w) => out.push(w.clone()),
                    QueryTerm::Phrase(ws) => out.extend(ws.iter().cloned()),
                }
            }
        }
        out.extend(self.filters.title.iter().cloned());
        out.sort();
        out.dedup();
        out
    }
}

/// Splits the raw query into clauses: bare words, `-`/`NOT` negation,
/// quoted phrases, `OR` group separators and `field:value` filters.
pub fn parse_query(raw: &str) -> ParsedQuery {
    let mut query = ParsedQuery::default();
    let mut group = Group::default();
    let mut negate_next = false;

    for clause in clauses(raw) {
        match clause {
            Clause::Or => {
                if !group.include.is_empty() || !group.exclude.is_empty() {
                    query.groups.push(std::mem::take(&mut group));
                }
                negate_next = false;
            },
            Clause::Not => negate_next = true,
            Clause::Filter(field, value) => {
                match field.as_str() {
                    "site" => query.filters.site = Some(value.to_ascii_lowercase()),
                    "type" => query.filters.kind = Some(value.to_ascii_lowercase()),
                    "title" => query.filters.title.extend(terms(&value)),
                    _ => {
                        // Unknown field reads as a plain word.
                        push_term(
                            &mut group,
                            QueryTerm::Word(value.to_ascii_lowercase()),
                            &mut negate_next,
                        );
                    },
                }
            },
            Clause::Phrase(text) => {
                let words = terms(&text);
                if !words.is_empty() {
                    push_term(&mut group, QueryTerm::Phrase(words), &mut negate_next);
                }
            },
            Clause::Word(negated, text) => {
                if negated {
                    negate_next = true;
                }
                let mut words = terms(&text);
                if let Some(word) = words.pop() {
                    push_term(&mut group, QueryTerm::Word(word), &mut negate_next);
                } else {
                    negate_next = false;
                }
            },
        }
    }
    if !group.include.is_empty() || !group.exclude.is_empty() {
        query.groups.push(group);
    }
    query
}

fn push_term(group: &mut Group, term: QueryTerm, negate: &mut bool) {
    if *negate {
        group.exclude.push(term);
        *negate = false;
    } else {
        group.include.push(term);
    }
}

enum Clause {
    Word(bool, String),
    Phrase(String),
    Filter(String, String),
    Or,
    Not,
}

fn clauses(raw: &str) -> Vec<Clause> {
    let mut out = Vec::new();
    let mut rest = raw.trim();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('"') {
            match after.find('"') {
                Some(end) => {
                    out.push(Clause::Phrase(after[..end].to_string()));
                    rest = after[end + 1..].trim_start();
                },
                None => {
                    out.push(Clause::Phrase(after.to_string()));
                    rest = "";
                },
            }
            continue;
        }

        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        let word = &rest[..end];
        rest = rest[end..].trim_start();

        if word == "OR" {
            out.push(Clause::Or);
        } else if word == "NOT" {
            out.push(Clause::Not);
        } else if let Some(negated) = word.strip_prefix('-') {
            if let Some(after) = negated.strip_prefix('"') {
                // Negated phrase: -"two words" (closing quote in a later
                // chunk is not supported; treat to end of clause).
                out.push(Clause::Not);
                out.push(Clause::Phrase(after.trim_end_matches('"').to_string()));
            } else {
                out.push(Clause::Word(true, negated.to_string()));
            }
        } else if let Some((field, value)) = word.split_once(':') {
            if value.is_empty() {
                out.push(Clause::Word(false, field.to_string()));
            } else {
                out.push(Clause::Filter(
                    field.to_ascii_lowercase(),
                    value.to_string(),
                ));
            }
        } else {
            out.push(Clause::Word(false, word.to_string()));
        }
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Evaluation

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub doc_id: DocId,
    pub url: String,
    pub title: String,
    pub score: f64,
    pub snippet: String,
    pub indexed_at: i64,
}

const TITLE_BOOST: f64 = 1.5;
const URL_BOOST: f64 = 1.2;
const PHRASE_BOOST: f64 = 2.0;

/// Evaluates `raw` against the index and returns hits ranked by TF-IDF
/// score, ties broken by most recent indexing.
pub fn search(index: &SearchIndex, raw: &str, limit: usize) -> Vec<SearchHit> {
    let query = parse_query(raw);
    if query.is_empty() {
        return Vec::new();
    }

    let words = query.positive_words();
    let candidates = index.find(&words);

    // One read guard for the whole evaluation: every candidate is judged
    // against a single consistent index state.
    let inner = index.read();
    let total_docs = inner.documents.len().max(1) as f64;

    let mut hits: Vec<SearchHit> = Vec::new();
    for doc_id in candidates {
        let Some(meta) = inner.documents.get(&doc_id) else {
            continue;
        };
        if !passes_filters(&query.filters, meta) {
            continue;
        }
        // A title: filter alone may select docs when every group is empty.
        let group_ok = query.groups.is_empty()
            || query
                .groups
                .iter()
                .any(|g| group_matches(&inner.terms, g, doc_id, meta));
        if !group_ok {
            continue;
        }
        score_and_push(&inner, &query, doc_id, meta, total_docs, &mut hits);
    }

    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.indexed_at.cmp(&a.indexed_at))
    });
    hits.truncate(limit);
    hits
}

fn score_and_push(
    inner: &crate::search::index::IndexInner,
    query: &ParsedQuery,
    doc_id: DocId,
    meta: &DocMeta,
    total_docs: f64,
    hits: &mut Vec<SearchHit>,
) {
    let title_terms: HashSet<String> = terms(&meta.title).into_iter().collect();
    let url_terms: HashSet<String> = terms(&meta.url).into_iter().collect();

    let mut score = 0.0;
    let mut earliest_pos: Option<u32> = None;
    for word in query.positive_words() {
        let Some(postings) = inner.terms.get(&word) else {
            continue;
        };
        let Some(posting) = postings.get(&doc_id) else {
            continue;
        };
        let tf = posting.count as f64;
        let df = postings.len() as f64;
        let idf = (total_docs / (1.0 + df)).ln();
        let title_boost = if title_terms.contains(&word) {
            TITLE_BOOST
        } else {
            1.0
        };
        let url_boost = if url_terms.contains(&word) {
            URL_BOOST
        } else {
            1.0
        };
        score += tf * idf.max(0.01) * title_boost * url_boost;

        if let Some(first) = posting.positions.first() {
            earliest_pos =
                Some(earliest_pos.map_or(*first, |cur| cur.min(*first)));
        }
    }

    let has_phrase_match = query.groups.iter().any(|g| {
        g.include.iter().any(|t| {
            matches!(t, QueryTerm::Phrase(words) if phrase_in_doc(meta, words))
        })
    });
    if has_phrase_match {
        score *= PHRASE_BOOST;
    }

    hits.push(SearchHit {
        doc_id,
        url: meta.url.clone(),
        title: meta.title.clone(),
        score,
        snippet: make_snippet(&meta.body, earliest_pos.unwrap_or(0) as usize),
        indexed_at: meta.indexed_at,
    });
}

fn passes_filters(filters: &Filters, meta: &DocMeta) -> bool {
    if let Some(site) = &filters.site {
        let host = RdntUrl::parse(&meta.url)
            .map(|u| u.host.to_ascii_lowercase())
            .unwrap_or_default();
        if &host != site {
            return false;
        }
    }
    if let Some(kind) = &filters.kind {
        if !meta.kind.eq_ignore_ascii_case(kind) {
            return false;
        }
    }
    if !filters.title.is_empty() {
        let title_terms: HashSet<String> =
            terms(&meta.title).into_iter().collect();
        if !filters.title.iter().all(|t| title_terms.contains(t)) {
            return false;
        }
    }
    true
}

fn group_matches(
    terms_map: &std::collections::HashMap<
        String,
        std::collections::HashMap<DocId, crate::search::index::Posting>,
    >,
    group: &Group,
    doc_id: DocId,
    meta: &DocMeta,
) -> bool {
    let word_in_doc = |w: &str| {
        terms_map
            .get(w)
            .is_some_and(|postings| postings.contains_key(&doc_id))
    };
    let term_in_doc = |t: &QueryTerm| match t {
        QueryTerm::Word(w) => word_in_doc(w),
        QueryTerm::Phrase(words) => phrase_in_doc(meta, words),
    };

    group.include.iter().all(&term_in_doc)
        && !group.exclude.iter().any(&term_in_doc)
}

/// Consecutive-token phrase check against the document's own text.
fn phrase_in_doc(meta: &DocMeta, words: &[String]) -> bool {
    if words.is_empty() {
        return false;
    }
    let title_tokens = terms(&meta.title);
    let body_tokens = terms(&meta.body);
    contains_run(&title_tokens, words) || contains_run(&body_tokens, words)
}

fn contains_run(haystack: &[String], needle: &[String]) -> bool {
    if needle.len() > haystack.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::config::IndexConfig;

    fn seeded() -> std::sync::Arc<SearchIndex> {
        let idx = SearchIndex::new(&IndexConfig::default());
        idx.add_document(
            "rdnt://guides/mining",
            "turtle mining guide",
            "a guide about turtle mining for beginners",
            "rwml",
        );
        idx.add_document(
            "rdnt://pro/advanced",
            "advanced mining",
            "advanced mining techniques and strip layouts",
            "rwml",
        );
        idx
    }

    #[test]
    fn test_and_group() {
        let idx = seeded();
        let hits = search(&idx, "turtle mining", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "rdnt://guides/mining");
    }

    #[test]
    fn test_negation() {
        let idx = seeded();
        let hits = search(&idx, "mining -turtle", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "rdnt://pro/advanced");

        let hits = search(&idx, "mining NOT turtle", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "rdnt://pro/advanced");
    }

    #[test]
    fn test_phrase_requires_adjacency() {
        let idx = seeded();
        let hits = search(&idx, "\"advanced mining\"", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "rdnt://pro/advanced");

        // Both words appear in the first doc, but never adjacent.
        let hits = search(&idx, "\"mining about\"", 10);
        assert!(hits.is_empty());
    }

    #[test]
    fn test_or_joins_groups() {
        let idx = seeded();
        let hits = search(&idx, "turtle OR advanced", 10);
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_filters() {
        let idx = seeded();
        let hits = search(&idx, "mining site:pro", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "rdnt://pro/advanced");

        let hits = search(&idx, "mining title:guide", 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].url, "rdnt://guides/mining");
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let idx = seeded();
        assert!(search(&idx, "", 10).is_empty());
        assert!(search(&idx, "   ", 10).is_empty());
        assert!(search(&idx, "-mining", 10).is_empty());
    }

    #[test]
    fn test_title_match_outranks_body_match() {
        let idx = SearchIndex::new(&IndexConfig::default());
        idx.add_document("rdnt://a/1", "redstone", "a page", "rwml");
        idx.add_document("rdnt://b/2", "other", "about redstone here", "rwml");
        let hits = search(&idx, "redstone", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "rdnt://a/1");
    }
}
