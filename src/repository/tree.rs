//! Flattened tree views.
//!
//! The commit pipeline and the query engine both work on a flattened view
//! of a revision's tree: a sorted map from absolute path to node. Directory
//! nodes are carried alongside files so that listings can show them, but
//! only file nodes take part in diffs; directories exist exactly when they
//! have files below them.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    storage::object::{
        frame, unframe, CommitObject, EntryMode, ObjectId, ObjectKind, TreeChild, TreeObject,
    },
    storage::RepoStore,
    Error,
};

/// One node of a flattened tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Node {
    File(ObjectId),
    Directory,
}

/// Absolute path (no trailing slash) to node, sorted by path.
pub(crate) type FlatTree = BTreeMap<String, Node>;

/// Loads the commit object recorded for a revision.
pub(crate) async fn commit_object_at(
    store: &dyn RepoStore,
    revision: i32,
) -> Result<Option<CommitObject>, Error> {
    let id = match store.revision_get(revision).await? {
        None => return Ok(None),
        Some(id) => id,
    };
    let commit = load_commit(store, id).await?;
    Ok(Some(commit))
}

pub(crate) async fn load_commit(
    store: &dyn RepoStore,
    id: ObjectId,
) -> Result<CommitObject, Error> {
    let framed = store
        .object(id)
        .await?
        .ok_or_else(|| Error::Storage(format!("missing commit object {}", id)))?;
    let (kind, payload) = unframe(&framed)?;
    if kind != ObjectKind::Commit {
        return Err(Error::Storage(format!("{} is not a commit object", id)));
    }
    CommitObject::from_payload(payload)
}

/// Loads and flattens the whole tree below `root`.
pub(crate) async fn load_tree(store: &dyn RepoStore, root: ObjectId) -> Result<FlatTree, Error> {
    let mut flat = FlatTree::new();
    let mut pending: Vec<(ObjectId, String)> = vec![(root, String::new())];
    while let Some((id, prefix)) = pending.pop() {
        let framed = store
            .object(id)
            .await?
            .ok_or_else(|| Error::Storage(format!("missing tree object {}", id)))?;
        let (kind, payload) = unframe(&framed)?;
        if kind != ObjectKind::Tree {
            return Err(Error::Storage(format!("{} is not a tree object", id)));
        }
        let tree = TreeObject::from_payload(payload)?;
        for child in tree.children {
            let path = format!("{}/{}", prefix, child.name);
            match child.mode {
                EntryMode::File => {
                    flat.insert(path, Node::File(child.id));
                }
                EntryMode::Subtree => {
                    flat.insert(path.clone(), Node::Directory);
                    pending.push((child.id, path));
                }
            }
        }
    }
    Ok(flat)
}

/// Reads a blob's raw bytes.
pub(crate) async fn load_blob(store: &dyn RepoStore, id: ObjectId) -> Result<Vec<u8>, Error> {
    let framed = store
        .object(id)
        .await?
        .ok_or_else(|| Error::Storage(format!("missing blob object {}", id)))?;
    let (kind, payload) = unframe(&framed)?;
    if kind != ObjectKind::Blob {
        return Err(Error::Storage(format!("{} is not a blob object", id)));
    }
    Ok(payload.to_vec())
}

/// Writes a framed object into every target store. Content addressing makes
/// the id independent of the target.
pub(crate) async fn put_all(
    stores: &[Arc<dyn RepoStore>],
    framed: Vec<u8>,
) -> Result<ObjectId, Error> {
    let mut id = None;
    for store in stores {
        id = Some(store.put_object(framed.clone()).await?);
    }
    id.ok_or_else(|| Error::Storage("no store to write to".to_string()))
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "",
        Some(i) => &path[..i],
    }
}

fn name_of(path: &str) -> &str {
    match path.rfind('/') {
        None => path,
        Some(i) => &path[i + 1..],
    }
}

/// Builds tree objects bottom-up from a file map and returns the root id.
///
/// `files` maps absolute file paths to already-stored blob ids; intermediate
/// directories are derived, never stored explicitly.
pub(crate) async fn build_root(
    stores: &[Arc<dyn RepoStore>],
    files: &BTreeMap<String, ObjectId>,
) -> Result<ObjectId, Error> {
    // "" is the root directory; every ancestor gets a child list.
    let mut children: BTreeMap<String, Vec<TreeChild>> = BTreeMap::new();
    children.insert(String::new(), Vec::new());
    for path in files.keys() {
        let mut dir = parent_of(path);
        while !dir.is_empty() {
            children.entry(dir.to_string()).or_default();
            dir = parent_of(dir);
        }
    }
    for (path, id) in files {
        children
            .get_mut(parent_of(path))
            .expect("parent registered above")
            .push(TreeChild {
                mode: EntryMode::File,
                name: name_of(path).to_string(),
                id: *id,
            });
    }

    // Deepest directories first so every subtree id exists before its
    // parent's child list is sealed.
    let mut dirs: Vec<String> = children.keys().filter(|d| !d.is_empty()).cloned().collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));

    for dir in dirs {
        let tree = TreeObject::new(children.remove(&dir).unwrap_or_default());
        let framed = frame(ObjectKind::Tree, &tree.to_payload()?);
        let id = put_all(stores, framed).await?;
        children
            .get_mut(parent_of(&dir))
            .expect("parent registered above")
            .push(TreeChild {
                mode: EntryMode::Subtree,
                name: name_of(&dir).to_string(),
                id,
            });
    }

    let root = TreeObject::new(children.remove("").unwrap_or_default());
    let framed = frame(ObjectKind::Tree, &root.to_payload()?);
    put_all(stores, framed).await
}

/// Copies every object reachable from `root` (trees and blobs) into `to`.
/// Content addressing keeps ids stable across stores, so the copy is a plain
/// closure walk.
pub(crate) async fn copy_objects(
    from: &dyn RepoStore,
    to: &Arc<dyn RepoStore>,
    root: ObjectId,
) -> Result<(), Error> {
    let mut pending = vec![root];
    while let Some(id) = pending.pop() {
        let framed = from
            .object(id)
            .await?
            .ok_or_else(|| Error::Storage(format!("missing object {}", id)))?;
        {
            let (kind, payload) = unframe(&framed)?;
            if kind == ObjectKind::Tree {
                let tree = TreeObject::from_payload(payload)?;
                pending.extend(tree.children.iter().map(|child| child.id));
            }
        }
        to.put_object(framed).await?;
    }
    Ok(())
}

/// File paths whose blob differs between the two trees, sorted.
pub(crate) fn changed_paths(old: &FlatTree, new: &FlatTree) -> Vec<String> {
    let mut changed = Vec::new();
    for (path, node) in old {
        if let Node::File(old_id) = node {
            match new.get(path) {
                Some(Node::File(new_id)) if new_id == old_id => {}
                _ => changed.push(path.clone()),
            }
        }
    }
    for (path, node) in new {
        if let Node::File(_) = node {
            if !matches!(old.get(path), Some(Node::File(_))) {
                changed.push(path.clone());
            }
        }
    }
    changed.sort();
    changed.dedup();
    changed
}

/// The file-only projection of a flattened tree.
pub(crate) fn file_ids(tree: &FlatTree) -> BTreeMap<String, ObjectId> {
    tree.iter()
        .filter_map(|(path, node)| match node {
            Node::File(id) => Some((path.clone(), *id)),
            Node::Directory => None,
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::plain::PlainStore;

    fn stores() -> (sled::Db, Vec<Arc<dyn RepoStore>>) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store: Arc<dyn RepoStore> = Arc::new(PlainStore::new(&db, "p", "r", 0));
        (db, vec![store])
    }

    async fn blob(stores: &[Arc<dyn RepoStore>], content: &[u8]) -> ObjectId {
        put_all(stores, frame(ObjectKind::Blob, content)).await.unwrap()
    }

    #[tokio::test]
    async fn test_build_and_load_roundtrip() {
        let (_db, stores) = stores();
        let a = blob(&stores, b"a\n").await;
        let b = blob(&stores, b"b\n").await;

        let mut files = BTreeMap::new();
        files.insert("/a.txt".to_string(), a);
        files.insert("/sub/dir/b.txt".to_string(), b);
        let root = build_root(&stores, &files).await.unwrap();

        let flat = load_tree(stores[0].as_ref(), root).await.unwrap();
        assert_eq!(flat.get("/a.txt"), Some(&Node::File(a)));
        assert_eq!(flat.get("/sub"), Some(&Node::Directory));
        assert_eq!(flat.get("/sub/dir"), Some(&Node::Directory));
        assert_eq!(flat.get("/sub/dir/b.txt"), Some(&Node::File(b)));
        assert_eq!(file_ids(&flat).len(), 2);
    }

    #[tokio::test]
    async fn test_same_files_same_root() {
        let (_db, stores) = stores();
        let a = blob(&stores, b"a\n").await;
        let mut files = BTreeMap::new();
        files.insert("/x/a.txt".to_string(), a);

        let first = build_root(&stores, &files).await.unwrap();
        let second = build_root(&stores, &files).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_changed_paths() {
        let (_db, stores) = stores();
        let a = blob(&stores, b"a\n").await;
        let b = blob(&stores, b"b\n").await;

        let mut old = FlatTree::new();
        old.insert("/same.txt".to_string(), Node::File(a));
        old.insert("/edited.txt".to_string(), Node::File(a));
        old.insert("/removed.txt".to_string(), Node::File(a));

        let mut new = FlatTree::new();
        new.insert("/same.txt".to_string(), Node::File(a));
        new.insert("/edited.txt".to_string(), Node::File(b));
        new.insert("/added.txt".to_string(), Node::File(b));

        assert_eq!(
            changed_paths(&old, &new),
            vec!["/added.txt", "/edited.txt", "/removed.txt"]
        );
    }
}
