//! Per-repository engine: the commit pipeline, the read-side query API, the
//! long-poll watch surface and the revision-keyed cache, all over one
//! content-addressed store (plus its rolling secondary, when one is active).

pub(crate) mod cache;
pub(crate) mod commit;
pub(crate) mod query;
pub(crate) mod tree;
pub(crate) mod watch;

use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    manager::{MetaStore, StorageConfig},
    model::{
        Author, Change, ChangeContent, Commit, CommitMessage, Entry, EntryContent, ListEntry,
        MergeQuery, MergedEntry, PushResult, Query, Revision, WatchFileResult, WatchRepoResult,
    },
    path,
    pattern::PathPattern,
    storage::{
        encryption::{EncryptedStore, Kms},
        plain::PlainStore,
        RepoStore,
    },
    Error,
};
use cache::{CacheKey, Cached, RepoCache};
use tree::{FlatTree, Node};
use watch::{WatchManager, WatchTarget};

/// Life-cycle state of a repository. Purged repositories no longer exist;
/// only a tombstone record with the generation counter survives them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepoState {
    Active,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SecondaryRecord {
    pub generation: u32,
    pub first_revision: i32,
    pub created_at: DateTime<Utc>,
}

/// The durable metadata record of one repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RepoRecord {
    pub creator: Author,
    pub created_at: DateTime<Utc>,
    pub state: RepoState,
    pub encrypted: bool,
    /// Generation of the current primary store.
    pub generation: u32,
    /// Next generation number to hand out; never reused.
    pub next_generation: u32,
    /// Oldest revision reachable through the primary.
    pub primary_base: i32,
    /// Generations whose rows still await deletion (crash recovery).
    pub removed_generations: Vec<u32>,
    pub secondary: Option<SecondaryRecord>,
    pub purged: bool,
}

impl RepoRecord {
    pub fn new(creator: Author, created_at: DateTime<Utc>, encrypted: bool) -> RepoRecord {
        RepoRecord {
            creator,
            created_at,
            state: RepoState::Active,
            encrypted,
            generation: 0,
            next_generation: 1,
            primary_base: 1,
            removed_generations: Vec::new(),
            secondary: None,
            purged: false,
        }
    }
}

/// Opens store generations for one repository, plaintext or encrypted.
pub(crate) struct StoreFactory {
    pub db: sled::Db,
    pub project: String,
    pub repo: String,
    pub encrypted: bool,
    pub kms: Option<Arc<dyn Kms>>,
}

impl StoreFactory {
    fn kms(&self) -> Result<Arc<dyn Kms>, Error> {
        self.kms.clone().ok_or_else(|| {
            Error::Storage(format!(
                "{}/{} is encrypted but no KMS provider is configured",
                self.project, self.repo
            ))
        })
    }

    pub fn open(&self, generation: u32) -> Result<Arc<dyn RepoStore>, Error> {
        if self.encrypted {
            Ok(Arc::new(EncryptedStore::open(
                &self.db,
                &self.project,
                &self.repo,
                generation,
                self.kms()?,
            )?))
        } else {
            Ok(Arc::new(PlainStore::new(
                &self.db,
                &self.project,
                &self.repo,
                generation,
            )))
        }
    }

    /// Opens the first generation of a brand-new repository incarnation,
    /// generating and persisting the WDEK when encryption is on.
    pub async fn create(&self, generation: u32) -> Result<Arc<dyn RepoStore>, Error> {
        if self.encrypted {
            Ok(Arc::new(
                EncryptedStore::create(&self.db, &self.project, &self.repo, generation, self.kms()?)
                    .await?,
            ))
        } else {
            Ok(Arc::new(PlainStore::new(
                &self.db,
                &self.project,
                &self.repo,
                generation,
            )))
        }
    }
}

struct Secondary {
    store: Arc<dyn RepoStore>,
    generation: u32,
    first_revision: i32,
    created_at: DateTime<Utc>,
}

struct StorePair {
    primary: Arc<dyn RepoStore>,
    secondary: Option<Secondary>,
}

/// One repository: a single line of history, a writer lock, a watch manager
/// and a result cache.
pub struct Repository {
    project: String,
    name: String,
    config: Arc<StorageConfig>,
    factory: StoreFactory,
    meta: MetaStore,
    record: std::sync::Mutex<RepoRecord>,
    stores: tokio::sync::RwLock<StorePair>,
    write_lock: tokio::sync::Mutex<()>,
    head: AtomicI32,
    watch: WatchManager,
    cache: RepoCache,
}

impl Repository {
    /// Attaches to an existing repository's stores, finishing any row
    /// deletion a crash interrupted mid-promotion.
    pub(crate) async fn attach(
        project: String,
        name: String,
        mut record: RepoRecord,
        factory: StoreFactory,
        meta: MetaStore,
        config: Arc<StorageConfig>,
    ) -> Result<Arc<Repository>, Error> {
        if !record.removed_generations.is_empty() {
            for generation in std::mem::take(&mut record.removed_generations) {
                factory.open(generation)?.purge().await?;
            }
            meta.save(&record)?;
        }

        let primary = factory.open(record.generation)?;
        let head = primary.head().await?.ok_or_else(|| {
            Error::Storage(format!("{}/{} has no HEAD", project, name))
        })?;
        let secondary = match &record.secondary {
            None => None,
            Some(s) => Some(Secondary {
                store: factory.open(s.generation)?,
                generation: s.generation,
                first_revision: s.first_revision,
                created_at: s.created_at,
            }),
        };

        Ok(Arc::new(Repository {
            project,
            name,
            cache: RepoCache::new(config.cache_capacity_bytes),
            config,
            factory,
            meta,
            record: std::sync::Mutex::new(record),
            stores: tokio::sync::RwLock::new(StorePair { primary, secondary }),
            write_lock: tokio::sync::Mutex::new(()),
            head: AtomicI32::new(head),
            watch: WatchManager::new(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// The wire-facing description of this repository.
    pub fn info(&self) -> crate::model::Repository {
        let record = self.record.lock().expect("poisoned");
        crate::model::Repository {
            name: self.name.clone(),
            creator: record.creator.clone(),
            head_revision: self.head_revision(),
            created_at: record.created_at,
        }
    }

    pub(crate) fn state(&self) -> RepoState {
        self.record.lock().expect("poisoned").state
    }

    pub(crate) fn set_state(&self, state: RepoState) -> Result<(), Error> {
        let mut record = self.record.lock().expect("poisoned");
        record.state = state;
        self.meta.save(&record)
    }

    pub fn head_revision(&self) -> Revision {
        Revision::from(self.head.load(Ordering::Acquire))
    }

    /// Resolves a relative revision against the current head and bounds
    /// checks absolute ones. Revision 0 is illegal everywhere.
    pub fn normalize_revision(&self, revision: Revision) -> Result<Revision, Error> {
        let head = self.head.load(Ordering::Acquire);
        let major = revision.major();
        if major == 0 {
            return Err(Error::InvalidParams("revision 0 is not allowed"));
        }
        let absolute = if major < 0 { head + major + 1 } else { major };
        if absolute < 1 || absolute > head {
            return Err(Error::RevisionNotFound(revision));
        }
        Ok(Revision::from(absolute))
    }

    async fn primary(&self) -> Arc<dyn RepoStore> {
        self.stores.read().await.primary.clone()
    }

    async fn flat_tree_at(
        &self,
        store: &Arc<dyn RepoStore>,
        revision: i32,
    ) -> Result<FlatTree, Error> {
        let commit = tree::commit_object_at(store.as_ref(), revision)
            .await?
            .ok_or(Error::RevisionNotFound(Revision::from(revision)))?;
        tree::load_tree(store.as_ref(), commit.tree).await
    }

    async fn load_entry(
        &self,
        store: &Arc<dyn RepoStore>,
        flat: &FlatTree,
        revision: Revision,
        file_path: &str,
    ) -> Result<Option<Entry>, Error> {
        let content = match flat.get(file_path) {
            None => return Ok(None),
            Some(Node::Directory) => EntryContent::Directory,
            Some(Node::File(id)) => {
                let bytes = tree::load_blob(store.as_ref(), *id).await?;
                query::parse_content(file_path, path::entry_type_of(file_path), &bytes)?
            }
        };
        Ok(Some(Entry {
            path: file_path.to_string(),
            content,
            revision,
        }))
    }

    /// File paths changed by the commit at `revision`, against its parent.
    async fn changed_paths_at(&self, revision: i32) -> Result<Arc<Vec<String>>, Error> {
        let store = self.primary().await;
        let key = CacheKey {
            op: "changes",
            revision,
            fingerprint: String::new(),
        };
        let cached = self
            .cache
            .get_with(key, async {
                let commit = tree::commit_object_at(store.as_ref(), revision)
                    .await?
                    .ok_or(Error::RevisionNotFound(Revision::from(revision)))?;
                let new_tree = tree::load_tree(store.as_ref(), commit.tree).await?;
                let old_tree = match commit.parent {
                    None => FlatTree::new(),
                    Some(parent_id) => {
                        let parent = tree::load_commit(store.as_ref(), parent_id).await?;
                        tree::load_tree(store.as_ref(), parent.tree).await?
                    }
                };
                Ok(Cached::Paths(Arc::new(tree::changed_paths(
                    &old_tree, &new_tree,
                ))))
            })
            .await?;
        match cached {
            Cached::Paths(paths) => Ok(paths),
            _ => Err(Error::Storage("cache value mismatch".to_string())),
        }
    }

    /// Retrieves the list of the files at the specified [`Revision`] matched
    /// by the path pattern.
    pub async fn list_files(
        &self,
        revision: Revision,
        path_pattern: &str,
    ) -> Result<Vec<ListEntry>, Error> {
        let revision = self.normalize_revision(revision)?;
        let pattern = PathPattern::compile(path_pattern)?;
        let store = self.primary().await;
        let key = CacheKey {
            op: "list",
            revision: revision.major(),
            fingerprint: pattern.as_str().to_string(),
        };
        let cached = self
            .cache
            .get_with(key, async {
                let flat = self.flat_tree_at(&store, revision.major()).await?;
                let entries: Vec<ListEntry> = flat
                    .iter()
                    .filter(|(entry_path, _)| pattern.matches(entry_path.as_str()))
                    .map(|(entry_path, node)| ListEntry {
                        path: entry_path.clone(),
                        r#type: match node {
                            Node::Directory => crate::model::EntryType::Directory,
                            Node::File(_) => path::entry_type_of(entry_path),
                        },
                    })
                    .collect();
                Ok(Cached::ListEntries(Arc::new(entries)))
            })
            .await?;
        match cached {
            Cached::ListEntries(entries) => Ok((*entries).clone()),
            _ => Err(Error::Storage("cache value mismatch".to_string())),
        }
    }

    /// Retrieves the files at the specified [`Revision`] matched by the path
    /// pattern, sorted by path.
    pub async fn get_files(
        &self,
        revision: Revision,
        path_pattern: &str,
    ) -> Result<Vec<Entry>, Error> {
        let revision = self.normalize_revision(revision)?;
        let pattern = PathPattern::compile(path_pattern)?;
        let store = self.primary().await;
        let key = CacheKey {
            op: "find",
            revision: revision.major(),
            fingerprint: pattern.as_str().to_string(),
        };
        let cached = self
            .cache
            .get_with(key, async {
                let flat = self.flat_tree_at(&store, revision.major()).await?;
                let mut entries = Vec::new();
                for (entry_path, _) in flat.iter().filter(|(p, _)| pattern.matches(p.as_str())) {
                    if let Some(entry) =
                        self.load_entry(&store, &flat, revision, entry_path).await?
                    {
                        entries.push(entry);
                    }
                }
                Ok(Cached::Entries(Arc::new(entries)))
            })
            .await?;
        match cached {
            Cached::Entries(entries) => Ok((*entries).clone()),
            _ => Err(Error::Storage("cache value mismatch".to_string())),
        }
    }

    /// Queries a file at the specified [`Revision`] with the specified
    /// [`Query`].
    pub async fn get_file(&self, revision: Revision, file_query: &Query) -> Result<Entry, Error> {
        let revision = self.normalize_revision(revision)?;
        let file_path = path::normalize_file_path(file_query.path())?;
        let store = self.primary().await;
        let key = CacheKey {
            op: "entry",
            revision: revision.major(),
            fingerprint: file_path.clone(),
        };
        let cached = self
            .cache
            .get_with(key, async {
                let flat = self.flat_tree_at(&store, revision.major()).await?;
                match self.load_entry(&store, &flat, revision, &file_path).await? {
                    Some(entry) => Ok(Cached::Entries(Arc::new(vec![entry]))),
                    None => Err(Error::EntryNotFound {
                        revision,
                        path: file_path.clone(),
                    }),
                }
            })
            .await?;
        let entry = match cached {
            Cached::Entries(entries) => entries
                .first()
                .cloned()
                .ok_or_else(|| Error::Storage("cache value mismatch".to_string()))?,
            _ => return Err(Error::Storage("cache value mismatch".to_string())),
        };
        query::apply_query(entry, file_query)
    }

    async fn entry_if_present(
        &self,
        revision: Revision,
        file_query: &Query,
    ) -> Result<Option<Entry>, Error> {
        match self.get_file(revision, file_query).await {
            Ok(entry) => Ok(Some(entry)),
            Err(Error::EntryNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Merges the given sources into one composite JSON document.
    pub async fn merge(
        &self,
        revision: Revision,
        merge_query: &MergeQuery,
    ) -> Result<MergedEntry, Error> {
        let revision = self.normalize_revision(revision)?;
        if merge_query.sources.is_empty() {
            return Err(Error::InvalidParams("a merge query needs at least one source"));
        }
        let mut merged: Option<serde_json::Value> = None;
        let mut contributed = Vec::new();
        for source in &merge_query.sources {
            let file_query = Query::identity(&source.path)
                .ok_or(Error::InvalidParams("merge source path cannot be empty"))?;
            let entry = match self.get_file(revision, &file_query).await {
                Ok(entry) => entry,
                Err(Error::EntryNotFound { .. }) if source.optional => continue,
                Err(e) => return Err(e),
            };
            let value = match entry.content {
                EntryContent::Json(value) => value,
                _ => {
                    return Err(Error::QueryExecution(format!(
                        "merge sources must be JSON: {}",
                        entry.path
                    )))
                }
            };
            contributed.push(entry.path);
            match merged.as_mut() {
                None => merged = Some(value),
                Some(base) => query::merge_values(base, &value),
            }
        }
        let mut content = merged.ok_or_else(|| Error::EntryNotFound {
            revision,
            path: merge_query
                .sources
                .iter()
                .map(|s| s.path.as_str())
                .collect::<Vec<_>>()
                .join(","),
        })?;
        for expr in &merge_query.expressions {
            content = query::eval_json_path(&content, expr)?;
        }
        Ok(MergedEntry {
            revision,
            paths: contributed,
            content,
        })
    }

    /// Retrieves the commits that touched the pattern between two
    /// [`Revision`]s, newest first, both ends inclusive. `max_commits` of 0
    /// means unlimited.
    pub async fn history(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
        max_commits: usize,
    ) -> Result<Vec<Commit>, Error> {
        let from = self.normalize_revision(from)?;
        let to = self.normalize_revision(to)?;
        let (low, high) = if from <= to { (from, to) } else { (to, from) };
        let pattern = PathPattern::compile(path_pattern)?;
        let store = self.primary().await;
        let key = CacheKey {
            op: "history",
            revision: high.major(),
            fingerprint: format!("{}|{}|{}", low, pattern.as_str(), max_commits),
        };
        let cached = self
            .cache
            .get_with(key, async {
                let mut commits = Vec::new();
                for revision in (low.major()..=high.major()).rev() {
                    if max_commits > 0 && commits.len() >= max_commits {
                        break;
                    }
                    let include = if pattern.matches_all() {
                        true
                    } else {
                        let changed = self.changed_paths_at(revision).await?;
                        changed.iter().any(|p| pattern.matches(p))
                    };
                    if include {
                        let commit = tree::commit_object_at(store.as_ref(), revision)
                            .await?
                            .ok_or(Error::RevisionNotFound(Revision::from(revision)))?;
                        commits.push(commit.to_commit());
                    }
                }
                Ok(Cached::Commits(Arc::new(commits)))
            })
            .await?;
        match cached {
            Cached::Commits(commits) => Ok((*commits).clone()),
            _ => Err(Error::Storage("cache value mismatch".to_string())),
        }
    }

    /// Returns the diff of one queried file between two [`Revision`]s.
    pub async fn diff(
        &self,
        from: Revision,
        to: Revision,
        file_query: &Query,
    ) -> Result<Change, Error> {
        let from = self.normalize_revision(from)?;
        let to = self.normalize_revision(to)?;
        let file_path = path::normalize_file_path(file_query.path())?;
        let old = self.entry_if_present(from, file_query).await?;
        let new = self.entry_if_present(to, file_query).await?;
        if old.is_none() && new.is_none() {
            return Err(Error::EntryNotFound {
                revision: to,
                path: file_path,
            });
        }
        let rendered = query::entry_diff(
            &file_path,
            old.as_ref().map(|e| &e.content),
            new.as_ref().map(|e| &e.content),
        )?;
        Ok(rendered.unwrap_or_else(|| {
            // Both sides exist and are identical; render the empty patch of
            // the matching flavor.
            let content = match new.as_ref().map(|e| &e.content) {
                Some(EntryContent::Json(_)) => {
                    ChangeContent::ApplyJsonPatch(serde_json::Value::Array(Vec::new()))
                }
                _ => ChangeContent::ApplyTextPatch(String::new()),
            };
            Change {
                path: file_path,
                content,
            }
        }))
    }

    /// Retrieves the diffs of the files matched by the given path pattern
    /// between two [`Revision`]s, sorted by path.
    pub async fn diffs(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
    ) -> Result<Vec<Change>, Error> {
        let from = self.normalize_revision(from)?;
        let to = self.normalize_revision(to)?;
        let pattern = PathPattern::compile(path_pattern)?;
        let store = self.primary().await;
        let key = CacheKey {
            op: "diffs",
            revision: to.major(),
            fingerprint: format!("{}|{}", from, pattern.as_str()),
        };
        let cached = self
            .cache
            .get_with(key, async {
                let old_tree = self.flat_tree_at(&store, from.major()).await?;
                let new_tree = self.flat_tree_at(&store, to.major()).await?;
                let old_files = tree::file_ids(&old_tree);
                let new_files = tree::file_ids(&new_tree);

                let mut paths: Vec<&String> = old_files
                    .keys()
                    .chain(new_files.keys())
                    .filter(|p| pattern.matches(p.as_str()))
                    .collect();
                paths.sort();
                paths.dedup();

                let mut changes = Vec::new();
                for file_path in paths {
                    if old_files.get(file_path) == new_files.get(file_path) {
                        continue;
                    }
                    let old = self.load_entry(&store, &old_tree, from, file_path).await?;
                    let new = self.load_entry(&store, &new_tree, to, file_path).await?;
                    if let Some(change) = query::entry_diff(
                        file_path,
                        old.as_ref().map(|e| &e.content),
                        new.as_ref().map(|e| &e.content),
                    )? {
                        changes.push(change);
                    }
                }
                Ok(Cached::Changes(Arc::new(changes)))
            })
            .await?;
        match cached {
            Cached::Changes(changes) => Ok((*changes).clone()),
            _ => Err(Error::Storage("cache value mismatch".to_string())),
        }
    }

    /// Runs the commit pipeline up to change computation without advancing
    /// HEAD.
    pub async fn preview_diffs(
        &self,
        base: Revision,
        changes: &[Change],
    ) -> Result<Vec<Change>, Error> {
        let base = self.normalize_revision(base)?;
        let store = self.primary().await;
        let flat = self.flat_tree_at(&store, base.major()).await?;
        commit::preview(store.as_ref(), &flat, changes).await
    }

    /// Pushes the specified [`Change`]s on top of `base`, producing the next
    /// revision. `base` must equal the current head.
    pub async fn commit(
        &self,
        base: Revision,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
        allow_empty: bool,
    ) -> Result<PushResult, Error> {
        if self.state() != RepoState::Active {
            return Err(Error::ReadOnly(format!("{}/{}", self.project, self.name)));
        }
        // Touch the store before taking the writer lock so a lazily
        // unwrapped DEK is resolved outside of it.
        self.primary().await.head().await?;

        let guard = self.write_lock.lock().await;
        let base = self.normalize_revision(base)?;
        let (primary, secondary) = {
            let pair = self.stores.read().await;
            (
                pair.primary.clone(),
                pair.secondary.as_ref().map(|s| s.store.clone()),
            )
        };
        let outcome = commit::execute(
            &primary,
            secondary.as_ref(),
            base,
            author,
            message,
            &changes,
            allow_empty,
        )
        .await?;
        self.head
            .store(outcome.result.revision.major(), Ordering::Release);
        if let Err(e) = self.maybe_roll(outcome.result.revision.major()).await {
            log::error!(
                "{}/{}: failed to start rolling secondary: {}",
                self.project,
                self.name,
                e
            );
        }
        drop(guard);

        // Fan-out happens outside the writer lock.
        self.watch
            .notify(outcome.result.revision, &outcome.changed_paths);
        Ok(outcome.result)
    }

    /// Starts a rolling secondary once the primary has accumulated enough
    /// commits. Called with the writer lock held.
    async fn maybe_roll(&self, head: i32) -> Result<(), Error> {
        if self.config.rolling_threshold == 0 {
            return Ok(());
        }
        let mut pair = self.stores.write().await;
        if pair.secondary.is_some() {
            return Ok(());
        }
        let primary_base = {
            let record = self.record.lock().expect("poisoned");
            record.primary_base
        };
        if head - primary_base < self.config.rolling_threshold as i32 {
            return Ok(());
        }

        let generation = {
            let mut record = self.record.lock().expect("poisoned");
            let generation = record.next_generation;
            record.next_generation += 1;
            self.meta.save(&record)?;
            generation
        };
        let store = self.factory.open(generation)?;
        commit::seed_generation(&pair.primary, &store, head).await?;
        let created_at = Utc::now();
        pair.secondary = Some(Secondary {
            store,
            generation,
            first_revision: head,
            created_at,
        });
        {
            let mut record = self.record.lock().expect("poisoned");
            record.secondary = Some(SecondaryRecord {
                generation,
                first_revision: head,
                created_at,
            });
            self.meta.save(&record)?;
        }
        log::info!(
            "{}/{}: rolling secondary (generation {}) started at revision {}",
            self.project,
            self.name,
            generation,
            head
        );
        Ok(())
    }

    /// Promotes the rolling secondary to primary, retires the old primary's
    /// rows and seeds a fresh secondary at HEAD. History older than the
    /// promoted store's base commit becomes unreachable.
    pub async fn promote_secondary(&self) -> Result<(), Error> {
        if self.state() != RepoState::Active {
            return Err(Error::ReadOnly(format!("{}/{}", self.project, self.name)));
        }
        let _guard = self.write_lock.lock().await;
        let mut pair = self.stores.write().await;
        let secondary = pair
            .secondary
            .take()
            .ok_or(Error::InvalidParams("repository has no rolling secondary"))?;
        let age = Utc::now()
            .signed_duration_since(secondary.created_at)
            .to_std()
            .unwrap_or_default();
        if age < self.config.min_secondary_age {
            pair.secondary = Some(secondary);
            return Err(Error::InvalidParams(
                "rolling secondary is too young to promote",
            ));
        }

        let old_primary = pair.primary.clone();
        let old_generation = {
            // The generation pointer is advanced durably before any old row
            // is touched; a crash leaves either store fully intact.
            let mut record = self.record.lock().expect("poisoned");
            let old_generation = record.generation;
            record.removed_generations.push(old_generation);
            record.generation = secondary.generation;
            record.primary_base = secondary.first_revision;
            record.secondary = None;
            self.meta.save(&record)?;
            old_generation
        };
        pair.primary = secondary.store.clone();
        log::info!(
            "{}/{}: promoted generation {} (oldest reachable revision {})",
            self.project,
            self.name,
            secondary.generation,
            secondary.first_revision
        );

        let head = self.head.load(Ordering::Acquire);
        let fresh_generation = {
            let mut record = self.record.lock().expect("poisoned");
            let generation = record.next_generation;
            record.next_generation += 1;
            self.meta.save(&record)?;
            generation
        };
        let fresh = self.factory.open(fresh_generation)?;
        commit::seed_generation(&pair.primary, &fresh, head).await?;
        let created_at = Utc::now();
        pair.secondary = Some(Secondary {
            store: fresh,
            generation: fresh_generation,
            first_revision: head,
            created_at,
        });
        {
            let mut record = self.record.lock().expect("poisoned");
            record.secondary = Some(SecondaryRecord {
                generation: fresh_generation,
                first_revision: head,
                created_at,
            });
            self.meta.save(&record)?;
        }
        drop(pair);

        old_primary.purge().await?;
        let mut record = self.record.lock().expect("poisoned");
        record.removed_generations.retain(|g| *g != old_generation);
        self.meta.save(&record)
    }

    /// Destroys every store generation of this repository, including the
    /// WDEK. Irreversible.
    pub(crate) async fn purge_stores(&self) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let pair = self.stores.read().await;
        pair.primary.purge().await?;
        if let Some(secondary) = &pair.secondary {
            secondary.store.purge().await?;
        }
        let leftover = {
            let record = self.record.lock().expect("poisoned");
            record.removed_generations.clone()
        };
        for generation in leftover {
            self.factory.open(generation)?.purge().await?;
        }
        pair.primary.delete_key_material().await?;
        let mut record = self.record.lock().expect("poisoned");
        record.purged = true;
        record.secondary = None;
        record.removed_generations.clear();
        self.meta.save(&record)
    }

    fn resolve_last_known(&self, last_known: Revision) -> Result<i32, Error> {
        let major = last_known.major();
        if major == 0 {
            return Err(Error::InvalidParams("revision 0 is not allowed"));
        }
        if major > 0 {
            // May exceed the current head: such a watch waits until the
            // repository actually reaches a newer revision.
            return Ok(major);
        }
        let head = self.head.load(Ordering::Acquire);
        let absolute = head + major + 1;
        if absolute < 1 {
            return Err(Error::RevisionNotFound(last_known));
        }
        Ok(absolute)
    }

    async fn first_match_after(
        &self,
        last_known: i32,
        target: &WatchTarget,
    ) -> Result<Option<Revision>, Error> {
        let head = self.head.load(Ordering::Acquire);
        for revision in (last_known + 1)..=head {
            let changed = self.changed_paths_at(revision).await?;
            if changed.iter().any(|p| target.matches(p)) {
                return Ok(Some(Revision::from(revision)));
            }
        }
        Ok(None)
    }

    async fn await_revision(
        &self,
        last_known: i32,
        target: WatchTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Revision>, Error> {
        if let Some(revision) = self.first_match_after(last_known, &target).await? {
            return Ok(Some(revision));
        }
        let (id, rx) = self.watch.register(last_known, target.clone());
        // A commit may have slipped in between the scan and the
        // registration; look once more now that the waiter is parked.
        if let Some(revision) = self.first_match_after(last_known, &target).await? {
            self.watch.deregister(id);
            return Ok(Some(revision));
        }
        let deadline = watch::effective_timeout(timeout, self.config.watch_slack);
        tokio::select! {
            fired = rx => match fired {
                Ok(revision) => Ok(Some(revision)),
                Err(_) => Err(Error::ShuttingDown),
            },
            _ = tokio::time::sleep(deadline) => {
                self.watch.deregister(id);
                Ok(None)
            }
            _ = cancel.cancelled() => {
                self.watch.deregister(id);
                Err(Error::Cancelled)
            }
        }
    }

    /// Awaits a revision newer than `last_known` that changed at least one
    /// path matching the pattern. Returns `None` when the deadline elapses
    /// first.
    pub async fn watch_repo(
        &self,
        last_known: Revision,
        path_pattern: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<WatchRepoResult>, Error> {
        let last_known = self.resolve_last_known(last_known)?;
        let pattern = PathPattern::compile(path_pattern)?;
        let revision = self
            .await_revision(last_known, WatchTarget::Pattern(pattern), timeout, cancel)
            .await?;
        Ok(revision.map(|revision| WatchRepoResult { revision }))
    }

    /// Awaits a change of the queried file and returns its new content.
    /// Fails with [`Error::EntryNotFound`] when the change that woke the
    /// watch removed the file.
    pub async fn watch_file(
        &self,
        last_known: Revision,
        file_query: &Query,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<WatchFileResult>, Error> {
        let last_known = self.resolve_last_known(last_known)?;
        let file_path = path::normalize_file_path(file_query.path())?;
        let revision = self
            .await_revision(last_known, WatchTarget::File(file_path), timeout, cancel)
            .await?;
        match revision {
            None => Ok(None),
            Some(revision) => {
                let entry = self.get_file(revision, file_query).await?;
                Ok(Some(WatchFileResult { revision, entry }))
            }
        }
    }

    /// Returns a stream which outputs a [`WatchRepoResult`] whenever the
    /// repository has a new commit matching the given `path_pattern`.
    pub fn watch_repo_stream(
        self: Arc<Self>,
        path_pattern: &str,
    ) -> Pin<Box<dyn Stream<Item = WatchRepoResult> + Send>> {
        watch::watch_repo_stream(self, path_pattern.to_string())
    }

    /// Returns a stream which outputs a [`WatchFileResult`] whenever the
    /// result of the given [`Query`] changes.
    pub fn watch_file_stream(
        self: Arc<Self>,
        file_query: &Query,
    ) -> Pin<Box<dyn Stream<Item = WatchFileResult> + Send>> {
        watch::watch_file_stream(self, file_query.clone())
    }
}
