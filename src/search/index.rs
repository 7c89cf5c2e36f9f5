// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, RwLock, RwLockReadGuard},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cfg::{config::IndexConfig, logger::perform_save_to_file},
    search::tokenizer::{terms, tokenize},
};

pub type DocId = u64;

/// One `(term, document)` entry: occurrence count plus the byte positions
/// of the first few occurrences in the body, kept for snippets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub count: u32,
    pub positions: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMeta {
    pub doc_id: DocId,
    pub url: String,
    pub title: String,
    pub kind: String,
    pub indexed_at: i64,
    pub term_count: u32,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub documents: usize,
    pub terms: usize,
    pub postings: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct IndexInner {
    pub terms: HashMap<String, HashMap<DocId, Posting>>,
    pub documents: HashMap<DocId, DocMeta>,
    pub by_url: HashMap<String, DocId>,
    pub next_doc_id: DocId,
}

/// In-memory inverted index with atomic document replace.
///
/// All mutation happens under one write lock, so a concurrent query sees
/// either the pre-update or the post-update state of both maps, never a
/// half-applied document.
pub struct SearchIndex {
    inner: RwLock<IndexInner>,
    positions_cap: usize,
}

impl SearchIndex {
    pub fn new(cfg: &IndexConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(IndexInner::default()),
            positions_cap: cfg.positions_per_term_per_doc,
        })
    }

    /// Indexes a document. A URL already present is replaced atomically;
    /// re-adding identical content keeps a single document.
    pub fn add_document(
        &self,
        url: &str,
        title: &str,
        body: &str,
        kind: &str,
    ) -> DocId {
        let title_terms = terms(title);
        let body_tokens = tokenize(body);
        let term_count = (title_terms.len() + body_tokens.len()) as u32;

        // Per-term counts over title+body, byte positions from the body
        // only.
        let mut counts: HashMap<String, Posting> = HashMap::new();
        for t in &title_terms {
            counts
                .entry(t.clone())
                .or_insert_with(|| Posting {
                    count: 0,
                    positions: Vec::new(),
                })
                .count += 1;
        }
        for tok in &body_tokens {
            let posting = counts.entry(tok.text.clone()).or_insert_with(|| Posting {
                count: 0,
                positions: Vec::new(),
            });
            posting.count += 1;
            if posting.positions.len() < self.positions_cap {
                posting.positions.push(tok.byte_pos);
            }
        }

        let mut inner = self.inner.write().expect("index lock poisoned");
        if let Some(old_id) = inner.by_url.get(url).copied() {
            remove_locked(&mut inner, old_id);
        }

        let doc_id = inner.next_doc_id;
        inner.next_doc_id += 1;

        for (term, posting) in counts {
            inner
                .terms
                .entry(term)
                .or_default()
                .insert(doc_id, posting);
        }
        inner.documents.insert(
            doc_id,
            DocMeta {
                doc_id,
                url: url.to_string(),
                title: title.to_string(),
                kind: kind.to_string(),
                indexed_at: Utc::now().timestamp_millis(),
                term_count,
                body: body.to_string(),
            },
        );
        inner.by_url.insert(url.to_string(), doc_id);
        doc_id
    }

    /// Removes a document and every posting that references it.
    pub fn remove_document(&self, doc_id: DocId) -> bool {
        let mut inner = self.inner.write().expect("index lock poisoned");
        remove_locked(&mut inner, doc_id)
    }

    /// Candidate documents containing any of `terms` (OR semantics).
    pub fn find(&self, terms: &[String]) -> Vec<DocId> {
        let inner = self.inner.read().expect("index lock poisoned");
        let mut seen = HashSet::new();
        for term in terms {
            if let Some(postings) = inner.terms.get(term) {
                seen.extend(postings.keys().copied());
            }
        }
        let mut out: Vec<DocId> = seen.into_iter().collect();
        out.sort_unstable();
        out
    }

    pub fn doc(&self, doc_id: DocId) -> Option<DocMeta> {
        self.inner
            .read()
            .expect("index lock poisoned")
            .documents
            .get(&doc_id)
            .cloned()
    }

    pub fn doc_by_url(&self, url: &str) -> Option<DocMeta> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .by_url
            .get(url)
            .and_then(|id| inner.documents.get(id))
            .cloned()
    }

    /// Slim listing used by maintenance passes: id, url, indexed-at.
    pub fn doc_refs(&self) -> Vec<(DocId, String, i64)> {
        let inner = self.inner.read().expect("index lock poisoned");
        inner
            .documents
            .values()
            .map(|d| (d.doc_id, d.url.clone(), d.indexed_at))
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let inner = self.inner.read().expect("index lock poisoned");
        IndexStats {
            documents: inner.documents.len(),
            terms: inner.terms.len(),
            postings: inner.terms.values().map(HashMap::len).sum(),
        }
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, IndexInner> {
        self.inner.read().expect("index lock poisoned")
    }

    /// Posting/document-map cross-check: every posting references a live
    /// document with a matching count sum, every document is reachable.
    pub fn check_consistency(&self) -> bool {
        let inner = self.inner.read().expect("index lock poisoned");
        for postings in inner.terms.values() {
            for doc_id in postings.keys() {
                if !inner.documents.contains_key(doc_id) {
                    return false;
                }
            }
        }
        for (doc_id, meta) in &inner.documents {
            let posted: u32 = inner
                .terms
                .values()
                .filter_map(|p| p.get(doc_id))
                .map(|p| p.count)
                .sum();
            if posted != meta.term_count {
                return false;
            }
            if inner.by_url.get(&meta.url) != Some(doc_id) {
                return false;
            }
        }
        true
    }

    // ────────────────────────────────────────────────────────────────────
    // Snapshots

    pub async fn snapshot_to_disk<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = {
            let inner = self.inner.read().expect("index lock poisoned");
            serde_json::to_string(&*inner).context("serialize index snapshot")?
        };
        perform_save_to_file(path, json).await
    }

    pub async fn load_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .context("read index snapshot")?;
        let loaded: IndexInner =
            serde_json::from_slice(&bytes).context("parse index snapshot")?;
        let documents = loaded.documents.len();
        *self.inner.write().expect("index lock poisoned") = loaded;
        info!(documents, "index snapshot loaded");
        Ok(())
    }

    /// Periodic snapshot task; no-op when no path is configured.
    pub fn spawn_snapshotter(
        self: &Arc<Self>,
        cfg: &IndexConfig,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let path = cfg.snapshot_path.clone()?;
        let interval = cfg.snapshot_interval;
        let index = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(interval) => {},
                }
                match index.snapshot_to_disk(&path).await {
                    Ok(()) => debug!(path, "index snapshot written"),
                    Err(e) => warn!(path, error = %e, "index snapshot failed"),
                }
            }
        }))
    }
}

fn remove_locked(inner: &mut IndexInner, doc_id: DocId) -> bool {
    let Some(meta) = inner.documents.remove(&doc_id) else {
        return false;
    };
    inner.by_url.remove(&meta.url);
    inner.terms.retain(|_, postings| {
        postings.remove(&doc_id);
        !postings.is_empty()
    });
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> Arc<SearchIndex> {
        SearchIndex::new(&IndexConfig::default())
    }

    #[test]
    fn test_add_and_stats() {
        let idx = index();
        idx.add_document("rdnt://a/one", "Turtle Mining Guide", "dig dig dig", "rwml");
        let stats = idx.stats();
        assert_eq!(stats.documents, 1);
        assert!(stats.terms >= 4);
        assert!(idx.check_consistency());
    }

    #[test]
    fn test_replace_same_url_is_atomic() {
        let idx = index();
        let first = idx.add_document("rdnt://a/p", "Old", "old words here", "rwml");
        let second = idx.add_document("rdnt://a/p", "New", "new words", "rwml");
        assert_ne!(first, second);
        assert_eq!(idx.stats().documents, 1);
        assert!(idx.doc(first).is_none());
        assert_eq!(idx.doc(second).expect("doc").title, "New");
        assert!(idx.check_consistency());
    }

    #[test]
    fn test_remove_purges_postings() {
        let idx = index();
        let id = idx.add_document("rdnt://a/p", "Title", "unique-term body", "rwml");
        assert!(idx.remove_document(id));
        assert!(!idx.remove_document(id));
        let stats = idx.stats();
        assert_eq!(stats.documents, 0);
        assert_eq!(stats.postings, 0);
        assert!(idx.check_consistency());
    }

    #[test]
    fn test_positions_capped() {
        let idx = index();
        let body = "word ".repeat(50);
        let id = idx.add_document("rdnt://a/p", "", &body, "rwml");
        let inner = idx.read();
        let posting = &inner.terms["word"][&id];
        assert_eq!(posting.count, 50);
        assert_eq!(
            posting.positions.len(),
            IndexConfig::default().positions_per_term_per_doc
        );
    }

    #[test]
    fn test_find_is_union() {
        let idx = index();
        idx.add_document("rdnt://a/1", "", "alpha beta", "rwml");
        idx.add_document("rdnt://a/2", "", "beta gamma", "rwml");
        let hits = idx.find(&["alpha".to_string(), "gamma".to_string()]);
        assert_eq!(hits.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let idx = index();
        idx.add_document("rdnt://a/1", "Title", "some body text", "rwml");
        let path = std::env::temp_dir().join(format!(
            "rednet-index-{}.json",
            crate::utils::random_token(8)
        ));

        idx.snapshot_to_disk(&path).await.expect("snapshot");
        let restored = SearchIndex::new(&IndexConfig::default());
        restored.load_snapshot(&path).await.expect("load");
        assert_eq!(restored.stats(), idx.stats());
        assert!(restored.check_consistency());

        let _ = tokio::fs::remove_file(&path).await;
    }
}
