//! Object shapes of the content-addressed store.
//!
//! Every persisted value is an immutable object: a blob holding raw file
//! bytes, a tree holding a name-sorted list of children, or a commit tying a
//! revision to a tree. Objects are keyed by the SHA-1 of their canonical
//! byte form `"<kind> <len>\0" + payload`; identical bytes always yield the
//! identical id, which is what makes puts idempotent and lets unchanged
//! subtrees share storage across revisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::{
    model::{Author, Commit, CommitMessage, Revision},
    Error,
};

pub(crate) const OBJECT_ID_LEN: usize = 20;

/// A 20-byte SHA-1 object id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OBJECT_ID_LEN]);

impl ObjectId {
    pub fn from_bytes(bytes: &[u8]) -> Result<ObjectId, Error> {
        if bytes.len() != OBJECT_ID_LEN {
            return Err(Error::Storage(format!(
                "object id must be {} bytes, got {}",
                OBJECT_ID_LEN,
                bytes.len()
            )));
        }
        let mut id = [0u8; OBJECT_ID_LEN];
        id.copy_from_slice(bytes);
        Ok(ObjectId(id))
    }

    pub fn from_hex(text: &str) -> Result<ObjectId, Error> {
        let bytes = hex::decode(text).map_err(|e| Error::Storage(e.to_string()))?;
        ObjectId::from_bytes(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectId({})", self.to_hex())
    }
}

impl Serialize for ObjectId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        ObjectId::from_hex(&text).map_err(serde::de::Error::custom)
    }
}

/// The kind tag of a stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

impl ObjectKind {
    fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    fn parse(text: &str) -> Result<ObjectKind, Error> {
        match text {
            "blob" => Ok(ObjectKind::Blob),
            "tree" => Ok(ObjectKind::Tree),
            "commit" => Ok(ObjectKind::Commit),
            other => Err(Error::Storage(format!("unknown object kind: {}", other))),
        }
    }
}

/// Wraps a payload in its canonical framed byte form.
pub fn frame(kind: ObjectKind, payload: &[u8]) -> Vec<u8> {
    let header = format!("{} {}\0", kind.as_str(), payload.len());
    let mut bytes = Vec::with_capacity(header.len() + payload.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

/// Splits a framed object back into its kind and payload.
pub fn unframe(bytes: &[u8]) -> Result<(ObjectKind, &[u8]), Error> {
    let nul = bytes
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Storage("malformed object: missing header".to_string()))?;
    let header = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| Error::Storage("malformed object header".to_string()))?;
    let (kind, len) = header
        .split_once(' ')
        .ok_or_else(|| Error::Storage("malformed object header".to_string()))?;
    let kind = ObjectKind::parse(kind)?;
    let payload = &bytes[nul + 1..];
    let declared: usize = len
        .parse()
        .map_err(|_| Error::Storage("malformed object length".to_string()))?;
    if declared != payload.len() {
        return Err(Error::Storage(format!(
            "object length mismatch: declared {}, actual {}",
            declared,
            payload.len()
        )));
    }
    Ok((kind, payload))
}

/// SHA-1 of the framed byte form.
pub fn hash_of(framed: &[u8]) -> ObjectId {
    let mut hasher = Sha1::new();
    hasher.update(framed);
    let digest = hasher.finalize();
    ObjectId::from_bytes(&digest).expect("SHA-1 digest is 20 bytes")
}

/// Distinguishes files from subtrees within a [`TreeObject`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryMode {
    File,
    Subtree,
}

/// One child of a tree, named relative to its parent.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TreeChild {
    pub mode: EntryMode,
    pub name: String,
    pub id: ObjectId,
}

/// A directory object: children sorted lexicographically by name so that the
/// canonical byte form is deterministic.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct TreeObject {
    pub children: Vec<TreeChild>,
}

impl TreeObject {
    pub fn new(mut children: Vec<TreeChild>) -> TreeObject {
        children.sort_by(|a, b| a.name.cmp(&b.name));
        TreeObject { children }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<TreeObject, Error> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// A commit object: the durable record behind one revision.
///
/// `pushed_at_ms` is truncated to whole seconds before hashing so that the
/// canonical form never depends on sub-second clock precision.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CommitObject {
    pub revision: Revision,
    pub author: Author,
    pub pushed_at_ms: i64,
    pub message: CommitMessage,
    pub tree: ObjectId,
    pub parent: Option<ObjectId>,
}

impl CommitObject {
    pub fn new(
        revision: Revision,
        author: Author,
        pushed_at: DateTime<Utc>,
        message: CommitMessage,
        tree: ObjectId,
        parent: Option<ObjectId>,
    ) -> CommitObject {
        CommitObject {
            revision,
            author,
            pushed_at_ms: pushed_at.timestamp() * 1000,
            message,
            tree,
            parent,
        }
    }

    pub fn pushed_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.pushed_at_ms / 1000, 0).unwrap_or_default()
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<CommitObject, Error> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// The wire-facing view of this commit.
    pub fn to_commit(&self) -> Commit {
        Commit {
            revision: self.revision,
            author: self.author.clone(),
            commit_message: self.message.clone(),
            pushed_at: self.pushed_at(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let framed = frame(ObjectKind::Blob, b"hello\n");
        let (kind, payload) = unframe(&framed).unwrap();
        assert_eq!(kind, ObjectKind::Blob);
        assert_eq!(payload, b"hello\n");
    }

    #[test]
    fn test_identical_bytes_identical_ids() {
        let a = hash_of(&frame(ObjectKind::Blob, b"x"));
        let b = hash_of(&frame(ObjectKind::Blob, b"x"));
        let c = hash_of(&frame(ObjectKind::Blob, b"y"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_kind_is_part_of_identity() {
        let blob = hash_of(&frame(ObjectKind::Blob, b"x"));
        let tree = hash_of(&frame(ObjectKind::Tree, b"x"));
        assert_ne!(blob, tree);
    }

    #[test]
    fn test_tree_children_sorted() {
        let id = hash_of(&frame(ObjectKind::Blob, b""));
        let tree = TreeObject::new(vec![
            TreeChild {
                mode: EntryMode::File,
                name: "b".to_string(),
                id,
            },
            TreeChild {
                mode: EntryMode::File,
                name: "a".to_string(),
                id,
            },
        ]);
        let names: Vec<&str> = tree.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);

        let reparsed = TreeObject::from_payload(&tree.to_payload().unwrap()).unwrap();
        assert_eq!(reparsed, tree);
    }

    #[test]
    fn test_commit_payload_roundtrip() {
        let tree = hash_of(&frame(ObjectKind::Tree, b"{}"));
        let commit = CommitObject::new(
            Revision::INIT,
            Author::system(),
            Utc::now(),
            CommitMessage::only_summary("Create a new repository"),
            tree,
            None,
        );
        assert_eq!(commit.pushed_at_ms % 1000, 0);
        let reparsed = CommitObject::from_payload(&commit.to_payload().unwrap()).unwrap();
        assert_eq!(reparsed, commit);
    }

    #[test]
    fn test_object_id_hex_roundtrip() {
        let id = hash_of(&frame(ObjectKind::Blob, b"z"));
        assert_eq!(ObjectId::from_hex(&id.to_hex()).unwrap(), id);
    }
}
