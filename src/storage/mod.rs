//! Persistence layer: one embedded key-value store holding every
//! repository's objects, refs and revision index.
//!
//! Keys are prefixed with `"<project>/<repo>/"` so that a repository can be
//! purged with a prefix scan. Object keys end with the raw 20-byte SHA-1,
//! the `HEAD` ref key is literal, and revision-to-commit keys carry the
//! 4-byte big-endian major revision.

pub mod encryption;
pub mod object;
pub(crate) mod plain;

use async_trait::async_trait;

use crate::Error;
use object::ObjectId;

/// Column family names of the embedded store. Plaintext repositories live in
/// the default tree; encrypted repositories use the remaining four.
pub(crate) mod cf {
    pub const WDEK: &str = "wdek";
    pub const ENCRYPTION_METADATA: &str = "encryption_metadata";
    pub const ENCRYPTED_OBJECT: &str = "encrypted_object";
    pub const ENCRYPTED_OBJECT_ID: &str = "encrypted_object_id";
}

pub(crate) const HEAD_REF: &str = "HEAD";

/// The key space of one repository store generation.
///
/// Generation 0 uses the bare `"<project>/<repo>/"` prefix; rolling
/// secondaries and post-purge re-creations get their own `gen-<n>/` segment
/// so that stale rows can never shadow fresh ones.
#[derive(Debug, Clone)]
pub(crate) struct KeySpace {
    prefix: Vec<u8>,
}

impl KeySpace {
    pub fn new(project: &str, repo: &str, generation: u32) -> KeySpace {
        let prefix = if generation == 0 {
            format!("{}/{}/", project, repo)
        } else {
            format!("{}/{}/gen-{}/", project, repo, generation)
        };
        KeySpace {
            prefix: prefix.into_bytes(),
        }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    /// `<prefix>objs/<20-byte sha>`
    pub fn object_key(&self, id: ObjectId) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(b"objs/");
        key.extend_from_slice(id.as_bytes());
        key
    }

    /// `<prefix><ref name>`
    pub fn ref_key(&self, name: &str) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(name.as_bytes());
        key
    }

    /// `<prefix>revs/<4-byte big-endian major>`
    pub fn revision_key(&self, revision: i32) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(b"revs/");
        key.extend_from_slice(&(revision as u32).to_be_bytes());
        key
    }
}

/// One repository's durable store: content-addressed objects plus the ref
/// and revision index. Implemented in plaintext over the default column
/// family and, transparently, over the encrypted column families.
#[async_trait]
pub(crate) trait RepoStore: Send + Sync {
    /// Stores a framed object; idempotent, durable before returning.
    async fn put_object(&self, framed: Vec<u8>) -> Result<ObjectId, Error>;

    /// Loads a framed object by id.
    async fn object(&self, id: ObjectId) -> Result<Option<Vec<u8>>, Error>;

    async fn contains(&self, id: ObjectId) -> Result<bool, Error>;

    /// Reads a ref's current value.
    async fn ref_get(&self, name: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Atomically replaces a ref value, expecting the current value to match
    /// `expected` (`None` = the ref must not exist). Returns false when the
    /// expectation does not hold.
    async fn ref_cas(
        &self,
        name: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool, Error>;

    async fn revision_put(&self, revision: i32, id: ObjectId) -> Result<(), Error>;

    async fn revision_get(&self, revision: i32) -> Result<Option<ObjectId>, Error>;

    /// Deletes every row of this store generation. Key material is left
    /// alone so other generations of the same repository stay readable.
    async fn purge(&self) -> Result<(), Error>;

    /// Destroys the repository's key material, if any. Called once, after
    /// the last generation is purged.
    async fn delete_key_material(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error>;

    /// The head revision recorded in the `HEAD` ref.
    async fn head(&self) -> Result<Option<i32>, Error> {
        match self.ref_get(HEAD_REF).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(decode_revision(&bytes)?)),
        }
    }

    /// Advances `HEAD` from `from` to `to`, recording the commit id for
    /// `to` first so a reader that observes the new head always finds its
    /// commit. Durable before returning true.
    async fn advance(
        &self,
        from: Option<i32>,
        to: i32,
        id: ObjectId,
    ) -> Result<bool, Error> {
        self.revision_put(to, id).await?;
        let expected = from.map(encode_revision);
        let advanced = self.ref_cas(HEAD_REF, expected, encode_revision(to)).await?;
        if advanced {
            self.flush().await?;
        }
        Ok(advanced)
    }
}

pub(crate) fn encode_revision(revision: i32) -> Vec<u8> {
    (revision as u32).to_be_bytes().to_vec()
}

pub(crate) fn decode_revision(bytes: &[u8]) -> Result<i32, Error> {
    if bytes.len() != 4 {
        return Err(Error::Storage(format!(
            "ref value must be 4 bytes, got {}",
            bytes.len()
        )));
    }
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(buf) as i32)
}
