//! Revision-keyed result cache.
//!
//! Keys embed the (absolute) revision an operation ran at, and published
//! revisions are immutable, so entries never need explicit invalidation:
//! a commit simply makes older keys cold. Entries leave the cache only
//! under the byte budget's pressure.
//!
//! Builds are single-flight: concurrent lookups of the same key await one
//! in-flight build instead of racing, and a caller cancelled mid-build hands
//! the build over to a waiter rather than leaking a half-built entry.
//! Failed builds (including `EntryNotFound`) are never cached: a negative
//! answer is cheap to recompute and would only ever change at a later
//! revision, which is a different key.

use std::future::Future;
use std::sync::Arc;

use moka::future::Cache;

use crate::{
    model::{Change, Commit, Entry, EntryContent, ListEntry},
    Error,
};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub(crate) struct CacheKey {
    pub op: &'static str,
    pub revision: i32,
    pub fingerprint: String,
}

#[derive(Debug, Clone)]
pub(crate) enum Cached {
    Entries(Arc<Vec<Entry>>),
    ListEntries(Arc<Vec<ListEntry>>),
    Commits(Arc<Vec<Commit>>),
    Changes(Arc<Vec<Change>>),
    Paths(Arc<Vec<String>>),
}

fn json_weight(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Null | serde_json::Value::Bool(_) => 8,
        serde_json::Value::Number(_) => 16,
        serde_json::Value::String(text) => 24 + text.len(),
        serde_json::Value::Array(items) => {
            24 + items.iter().map(json_weight).sum::<usize>()
        }
        serde_json::Value::Object(map) => {
            24 + map
                .iter()
                .map(|(key, item)| key.len() + json_weight(item))
                .sum::<usize>()
        }
    }
}

fn entry_weight(entry: &Entry) -> usize {
    let content = match &entry.content {
        EntryContent::Text(text) => text.len(),
        EntryContent::Json(value) => json_weight(value),
        EntryContent::Directory => 0,
    };
    32 + entry.path.len() + content
}

fn change_weight(change: &Change) -> usize {
    let content = match &change.content {
        crate::model::ChangeContent::UpsertJson(value) => json_weight(value),
        crate::model::ChangeContent::UpsertText(text) => text.len(),
        crate::model::ChangeContent::Remove => 0,
        crate::model::ChangeContent::Rename(path) => path.len(),
        crate::model::ChangeContent::ApplyJsonPatch(value) => json_weight(value),
        crate::model::ChangeContent::ApplyTextPatch(text) => text.len(),
    };
    32 + change.path.len() + content
}

impl Cached {
    fn weight(&self) -> usize {
        match self {
            Cached::Entries(entries) => entries.iter().map(entry_weight).sum(),
            Cached::ListEntries(entries) => {
                entries.iter().map(|e| 40 + e.path.len()).sum()
            }
            Cached::Commits(commits) => commits
                .iter()
                .map(|c| 96 + c.commit_message.summary.len())
                .sum(),
            Cached::Changes(changes) => changes.iter().map(change_weight).sum(),
            Cached::Paths(paths) => paths.iter().map(|p| 24 + p.len()).sum(),
        }
    }
}

pub(crate) struct RepoCache {
    inner: Cache<CacheKey, Cached>,
}

impl RepoCache {
    pub fn new(max_bytes: u64) -> RepoCache {
        RepoCache {
            inner: Cache::builder()
                .max_capacity(max_bytes)
                .weigher(|key: &CacheKey, value: &Cached| {
                    (64 + key.fingerprint.len() + value.weight()).min(u32::MAX as usize) as u32
                })
                .build(),
        }
    }

    /// Returns the cached value for `key`, running `build` at most once
    /// across concurrent callers when it is absent.
    pub async fn get_with<F>(&self, key: CacheKey, build: F) -> Result<Cached, Error>
    where
        F: Future<Output = Result<Cached, Error>>,
    {
        self.inner
            .try_get_with(key, build)
            .await
            .map_err(|e: Arc<Error>| (*e).clone())
    }
}
