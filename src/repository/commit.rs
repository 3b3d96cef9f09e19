//! The commit pipeline: turns a batch of path-scoped edits into exactly one
//! new revision.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::{
    model::{Author, Change, ChangeContent, CommitMessage, EntryContent, EntryType, PushResult, Revision},
    path,
    repository::query,
    repository::tree::{self, FlatTree, Node},
    storage::object::{frame, CommitObject, ObjectId, ObjectKind},
    storage::RepoStore,
    Error,
};

const MAX_ADVANCE_RETRIES: usize = 3;

/// One file of the staged tree.
#[derive(Debug, Clone)]
pub(crate) enum Staged {
    /// Unchanged (or renamed) blob carried over from the base tree.
    Keep(ObjectId),
    /// New or rewritten content, not yet stored.
    Put(Vec<u8>),
}

/// The result of applying a batch over a base tree, before anything is
/// written.
pub(crate) struct StagedTree {
    /// The complete file set of the would-be new revision.
    pub files: BTreeMap<String, Staged>,
    /// Paths whose content actually differs from the base tree, sorted.
    pub touched: Vec<String>,
}

async fn base_content(
    store: &dyn RepoStore,
    base: &FlatTree,
    staged: &BTreeMap<String, Staged>,
    path: &str,
) -> Result<Option<Vec<u8>>, Error> {
    match staged.get(path) {
        Some(Staged::Put(bytes)) => Ok(Some(bytes.clone())),
        Some(Staged::Keep(id)) => Ok(Some(tree::load_blob(store, *id).await?)),
        None => match base.get(path) {
            Some(Node::File(id)) => Ok(Some(tree::load_blob(store, *id).await?)),
            _ => Ok(None),
        },
    }
}

fn structured_upsert(value: &serde_json::Value) -> Result<Vec<u8>, Error> {
    Ok(query::normalize_json(value)?.into_bytes())
}

fn text_upsert(path: &str, text: &str) -> Result<Vec<u8>, Error> {
    let normalized = query::normalize_text(text);
    match path::entry_type_of(path) {
        EntryType::Json => {
            // A structured path must hold a parseable document. JSON files
            // are canonicalized; YAML files keep their textual form.
            if path.to_lowercase().ends_with(".json") {
                let value: serde_json::Value = serde_json::from_str(&normalized)
                    .map_err(|e| Error::ChangeConflict(format!("{}: invalid JSON: {}", path, e)))?;
                structured_upsert(&value)
            } else {
                serde_yaml::from_str::<serde_json::Value>(&normalized)
                    .map_err(|e| Error::ChangeConflict(format!("{}: invalid YAML: {}", path, e)))?;
                Ok(normalized.into_bytes())
            }
        }
        _ => Ok(normalized.into_bytes()),
    }
}

/// Applies every edit of a batch over the base tree, validating as it goes.
/// Nothing is written; the staged tree is pure bookkeeping.
pub(crate) async fn stage(
    store: &dyn RepoStore,
    base: &FlatTree,
    changes: &[Change],
) -> Result<StagedTree, Error> {
    let mut files: BTreeMap<String, Staged> = tree::file_ids(base)
        .into_iter()
        .map(|(path, id)| (path, Staged::Keep(id)))
        .collect();
    let mut batch_paths: HashSet<String> = HashSet::new();
    let mut claim = |path: &str| -> Result<(), Error> {
        if !batch_paths.insert(path.to_string()) {
            return Err(Error::ChangeConflict(format!(
                "duplicate path in one batch: {}",
                path
            )));
        }
        Ok(())
    };

    for change in changes {
        let file_path = path::normalize_file_path(&change.path)?;
        claim(&file_path)?;
        match &change.content {
            ChangeContent::UpsertJson(value) => {
                if path::entry_type_of(&file_path) != EntryType::Json {
                    return Err(Error::ChangeConflict(format!(
                        "{} is not a structured file",
                        file_path
                    )));
                }
                let bytes = structured_upsert(value)?;
                files.insert(file_path, Staged::Put(bytes));
            }
            ChangeContent::UpsertText(text) => {
                let bytes = text_upsert(&file_path, text)?;
                files.insert(file_path, Staged::Put(bytes));
            }
            ChangeContent::Remove => {
                if files.remove(&file_path).is_none() {
                    return Err(Error::ChangeConflict(format!(
                        "cannot remove non-existent file: {}",
                        file_path
                    )));
                }
            }
            ChangeContent::Rename(new_path) => {
                let new_path = path::normalize_file_path(new_path)?;
                claim(&new_path)?;
                if files.contains_key(&new_path) {
                    return Err(Error::ChangeConflict(format!(
                        "rename target already exists: {}",
                        new_path
                    )));
                }
                match files.remove(&file_path) {
                    Some(staged) => {
                        files.insert(new_path, staged);
                    }
                    None => {
                        return Err(Error::ChangeConflict(format!(
                            "cannot rename non-existent file: {}",
                            file_path
                        )))
                    }
                }
            }
            ChangeContent::ApplyJsonPatch(patch_value) => {
                let current = base_content(store, base, &files, &file_path)
                    .await?
                    .ok_or_else(|| {
                        Error::ChangeConflict(format!(
                            "cannot patch non-existent file: {}",
                            file_path
                        ))
                    })?;
                let content =
                    query::parse_content(&file_path, EntryType::Json, &current)?;
                let mut document = match content {
                    EntryContent::Json(value) => value,
                    _ => {
                        return Err(Error::ChangeConflict(format!(
                            "{} is not a structured file",
                            file_path
                        )))
                    }
                };
                let patch: json_patch::Patch = serde_json::from_value(patch_value.clone())
                    .map_err(|e| {
                        Error::ChangeConflict(format!("{}: malformed JSON patch: {}", file_path, e))
                    })?;
                json_patch::patch(&mut document, &patch).map_err(|e| {
                    Error::ChangeConflict(format!("{}: JSON patch failed: {}", file_path, e))
                })?;
                let bytes = structured_upsert(&document)?;
                files.insert(file_path, Staged::Put(bytes));
            }
            ChangeContent::ApplyTextPatch(unified) => {
                let current = base_content(store, base, &files, &file_path)
                    .await?
                    .ok_or_else(|| {
                        Error::ChangeConflict(format!(
                            "cannot patch non-existent file: {}",
                            file_path
                        ))
                    })?;
                let current = String::from_utf8(current)
                    .map_err(|_| Error::Storage(format!("{} is not valid UTF-8", file_path)))?;
                let patch = diffy::Patch::from_str(unified).map_err(|e| {
                    Error::ChangeConflict(format!("{}: malformed text patch: {}", file_path, e))
                })?;
                let applied = diffy::apply(&current, &patch).map_err(|e| {
                    Error::ChangeConflict(format!("{}: text patch failed: {}", file_path, e))
                })?;
                files.insert(
                    file_path,
                    Staged::Put(query::normalize_text(&applied).into_bytes()),
                );
            }
        }
    }

    // Work out which paths effectively changed; an upsert that reproduces
    // the existing bytes reverts to a carry-over so redundant batches are
    // detected before anything is written.
    let base_files = tree::file_ids(base);
    let mut touched = Vec::new();
    let mut reverted: Vec<(String, ObjectId)> = Vec::new();
    for (file_path, staged) in &files {
        match (base_files.get(file_path), staged) {
            (Some(old_id), Staged::Keep(id)) if old_id == id => {}
            (Some(old_id), Staged::Put(bytes)) => {
                let old_bytes = tree::load_blob(store, *old_id).await?;
                if old_bytes == *bytes {
                    reverted.push((file_path.clone(), *old_id));
                } else {
                    touched.push(file_path.clone());
                }
            }
            _ => touched.push(file_path.clone()),
        }
    }
    for file_path in base_files.keys() {
        if !files.contains_key(file_path) {
            touched.push(file_path.clone());
        }
    }
    for (file_path, id) in reverted {
        files.insert(file_path, Staged::Keep(id));
    }
    touched.sort();
    touched.dedup();

    Ok(StagedTree { files, touched })
}

/// Materializes entry content of one side of a staged path for previews.
async fn staged_entry_content(
    store: &dyn RepoStore,
    bytes: Option<Vec<u8>>,
    file_path: &str,
) -> Result<Option<EntryContent>, Error> {
    match bytes {
        None => Ok(None),
        Some(bytes) => Ok(Some(query::parse_content(
            file_path,
            path::entry_type_of(file_path),
            &bytes,
        )?)),
    }
}

/// Runs the pipeline up to change computation, without writing anything.
pub(crate) async fn preview(
    store: &dyn RepoStore,
    base: &FlatTree,
    changes: &[Change],
) -> Result<Vec<Change>, Error> {
    let staged = stage(store, base, changes).await?;
    let base_files = tree::file_ids(base);
    let mut diffs = Vec::new();
    for file_path in &staged.touched {
        let old = match base_files.get(file_path) {
            Some(id) => Some(tree::load_blob(store, *id).await?),
            None => None,
        };
        let new = match staged.files.get(file_path) {
            Some(Staged::Put(bytes)) => Some(bytes.clone()),
            Some(Staged::Keep(id)) => Some(tree::load_blob(store, *id).await?),
            None => None,
        };
        let old = staged_entry_content(store, old, file_path).await?;
        let new = staged_entry_content(store, new, file_path).await?;
        if let Some(change) = query::entry_diff(file_path, old.as_ref(), new.as_ref())? {
            diffs.push(change);
        }
    }
    Ok(diffs)
}

pub(crate) struct CommitOutcome {
    pub result: PushResult,
    pub changed_paths: Vec<String>,
}

/// Commits a staged batch on top of `base`. The caller holds the repository
/// writer lock; the compare-and-swap retry loop below only matters when the
/// lock is external and another member races the advance.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute(
    primary: &Arc<dyn RepoStore>,
    secondary: Option<&Arc<dyn RepoStore>>,
    base: Revision,
    author: Author,
    message: CommitMessage,
    changes: &[Change],
    allow_empty: bool,
) -> Result<CommitOutcome, Error> {
    if message.summary.is_empty() {
        return Err(Error::InvalidParams("summary of commit message cannot be empty"));
    }

    let mut attempts = 0;
    loop {
        let head = primary
            .head()
            .await?
            .ok_or_else(|| Error::Storage("repository has no HEAD".to_string()))?;
        if base.major() != head {
            return Err(Error::ChangeConflict(format!(
                "base revision {} does not match HEAD {}",
                base, head
            )));
        }

        let head_commit = tree::commit_object_at(primary.as_ref(), head)
            .await?
            .ok_or(Error::RevisionNotFound(Revision::from(head)))?;
        let base_tree = tree::load_tree(primary.as_ref(), head_commit.tree).await?;
        let staged = stage(primary.as_ref(), &base_tree, changes).await?;
        if staged.touched.is_empty() && !allow_empty {
            return Err(Error::RedundantChange);
        }

        let mut stores: Vec<Arc<dyn RepoStore>> = vec![primary.clone()];
        if let Some(secondary) = secondary {
            stores.push(secondary.clone());
        }

        let mut file_ids: BTreeMap<String, ObjectId> = BTreeMap::new();
        for (file_path, staged_file) in &staged.files {
            let id = match staged_file {
                Staged::Keep(id) => {
                    // A shadowing secondary holds every object reachable from
                    // its base commit, so carried-over blobs are present there
                    // already.
                    *id
                }
                Staged::Put(bytes) => {
                    tree::put_all(&stores, frame(ObjectKind::Blob, bytes)).await?
                }
            };
            file_ids.insert(file_path.clone(), id);
        }
        let root = tree::build_root(&stores, &file_ids).await?;
        if root == head_commit.tree && !allow_empty {
            return Err(Error::RedundantChange);
        }

        let new_revision = Revision::from(head + 1);
        let now = Utc::now();
        let parent = primary
            .revision_get(head)
            .await?
            .ok_or(Error::RevisionNotFound(Revision::from(head)))?;
        let commit = CommitObject::new(
            new_revision,
            author.clone(),
            now,
            message.clone(),
            root,
            Some(parent),
        );
        let commit_id = primary
            .put_object(frame(ObjectKind::Commit, &commit.to_payload()?))
            .await?;

        if !primary.advance(Some(head), new_revision.major(), commit_id).await? {
            attempts += 1;
            if attempts > MAX_ADVANCE_RETRIES {
                return Err(Error::Storage(format!(
                    "could not advance HEAD past revision {} after {} attempts",
                    head, attempts
                )));
            }
            log::warn!(
                "HEAD advance from {} raced, retrying (attempt {})",
                head,
                attempts
            );
            let jitter = Duration::from_millis(10 + (fastrand::f32() * 40.0) as u64);
            tokio::time::sleep(jitter).await;
            continue;
        }

        if let Some(secondary) = secondary {
            shadow_commit(secondary, head, &commit).await?;
        }

        return Ok(CommitOutcome {
            result: PushResult {
                revision: new_revision,
                pushed_at: commit.pushed_at(),
            },
            changed_paths: staged.touched,
        });
    }
}

/// Mirrors a freshly committed revision into the rolling secondary. The
/// secondary's parent chain starts at its own base commit, so the commit
/// object differs from the primary's even though the tree is shared.
async fn shadow_commit(
    secondary: &Arc<dyn RepoStore>,
    head: i32,
    commit: &CommitObject,
) -> Result<(), Error> {
    let parent = secondary
        .revision_get(head)
        .await?
        .ok_or_else(|| Error::Storage(format!("secondary store is missing revision {}", head)))?;
    let shadowed = CommitObject {
        parent: Some(parent),
        ..commit.clone()
    };
    let shadowed_id = secondary
        .put_object(frame(ObjectKind::Commit, &shadowed.to_payload()?))
        .await?;
    if !secondary
        .advance(Some(head), commit.revision.major(), shadowed_id)
        .await?
    {
        return Err(Error::Storage(format!(
            "secondary store diverged at revision {}",
            head
        )));
    }
    Ok(())
}

/// Writes the initial empty commit of a brand-new repository store.
pub(crate) async fn write_initial_commit(
    store: &Arc<dyn RepoStore>,
    created_at: DateTime<Utc>,
) -> Result<(), Error> {
    let stores = [store.clone()];
    let empty_root = tree::build_root(&stores, &BTreeMap::new()).await?;
    let commit = CommitObject::new(
        Revision::INIT,
        Author::system(),
        created_at,
        CommitMessage::only_summary("Create a new repository"),
        empty_root,
        None,
    );
    let commit_id = store
        .put_object(frame(ObjectKind::Commit, &commit.to_payload()?))
        .await?;
    if !store.advance(None, Revision::INIT.major(), commit_id).await? {
        return Err(Error::Storage("repository store already initialized".to_string()));
    }
    Ok(())
}

/// Seeds a new store generation with the tree at `head` and a parentless
/// base commit, the starting point of a rolling secondary.
pub(crate) async fn seed_generation(
    from: &Arc<dyn RepoStore>,
    to: &Arc<dyn RepoStore>,
    head: i32,
) -> Result<(), Error> {
    let head_commit = tree::commit_object_at(from.as_ref(), head)
        .await?
        .ok_or(Error::RevisionNotFound(Revision::from(head)))?;
    tree::copy_objects(from.as_ref(), to, head_commit.tree).await?;
    let base = CommitObject::new(
        Revision::from(head),
        Author::system(),
        Utc::now(),
        CommitMessage::only_summary(&format!("Begin new history at revision {}", head)),
        head_commit.tree,
        None,
    );
    let base_id = to
        .put_object(frame(ObjectKind::Commit, &base.to_payload()?))
        .await?;
    if !to.advance(None, head, base_id).await? {
        return Err(Error::Storage("secondary store already initialized".to_string()));
    }
    Ok(())
}
