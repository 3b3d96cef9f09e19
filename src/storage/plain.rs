//! Plaintext repository store over the default column family.

use async_trait::async_trait;

use super::{object, object::ObjectId, KeySpace, RepoStore};
use crate::Error;

pub(crate) struct PlainStore {
    tree: sled::Tree,
    keys: KeySpace,
}

impl PlainStore {
    pub fn new(db: &sled::Db, project: &str, repo: &str, generation: u32) -> PlainStore {
        PlainStore {
            // The default tree; sled's Db is itself the default column family.
            tree: (**db).clone(),
            keys: KeySpace::new(project, repo, generation),
        }
    }
}

#[async_trait]
impl RepoStore for PlainStore {
    async fn put_object(&self, framed: Vec<u8>) -> Result<ObjectId, Error> {
        let id = object::hash_of(&framed);
        self.tree.insert(self.keys.object_key(id), framed)?;
        self.tree.flush_async().await?;
        Ok(id)
    }

    async fn object(&self, id: ObjectId) -> Result<Option<Vec<u8>>, Error> {
        Ok(self
            .tree
            .get(self.keys.object_key(id))?
            .map(|v| v.to_vec()))
    }

    async fn contains(&self, id: ObjectId) -> Result<bool, Error> {
        Ok(self.tree.contains_key(self.keys.object_key(id))?)
    }

    async fn ref_get(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.tree.get(self.keys.ref_key(name))?.map(|v| v.to_vec()))
    }

    async fn ref_cas(
        &self,
        name: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool, Error> {
        let outcome = self
            .tree
            .compare_and_swap(self.keys.ref_key(name), expected, Some(new))?;
        Ok(outcome.is_ok())
    }

    async fn revision_put(&self, revision: i32, id: ObjectId) -> Result<(), Error> {
        self.tree
            .insert(self.keys.revision_key(revision), id.as_bytes())?;
        Ok(())
    }

    async fn revision_get(&self, revision: i32) -> Result<Option<ObjectId>, Error> {
        match self.tree.get(self.keys.revision_key(revision))? {
            None => Ok(None),
            Some(bytes) => Ok(Some(ObjectId::from_bytes(&bytes)?)),
        }
    }

    async fn purge(&self) -> Result<(), Error> {
        let tree = self.tree.clone();
        let prefix = self.keys.prefix().to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            for row in tree.scan_prefix(&prefix) {
                let (key, _) = row?;
                tree.remove(key)?;
            }
            Ok(())
        })
        .await??;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        self.tree.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::{object::ObjectKind, HEAD_REF};

    fn store() -> (sled::Db, PlainStore) {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = PlainStore::new(&db, "foo", "bar", 0);
        (db, store)
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (_db, store) = store();
        let framed = object::frame(ObjectKind::Blob, b"hello\n");
        let a = store.put_object(framed.clone()).await.unwrap();
        let b = store.put_object(framed.clone()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.object(a).await.unwrap().unwrap(), framed);
        assert!(store.contains(a).await.unwrap());
    }

    #[tokio::test]
    async fn test_advance_expectation() {
        let (_db, store) = store();
        let id = store
            .put_object(object::frame(ObjectKind::Commit, b"{}"))
            .await
            .unwrap();
        assert!(store.advance(None, 1, id).await.unwrap());
        assert_eq!(store.head().await.unwrap(), Some(1));
        assert_eq!(store.revision_get(1).await.unwrap(), Some(id));

        // A stale expectation must not advance.
        assert!(!store.advance(None, 1, id).await.unwrap());
        assert!(!store.advance(Some(2), 3, id).await.unwrap());
        assert!(store.advance(Some(1), 2, id).await.unwrap());
        assert_eq!(store.head().await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_purge_clears_only_own_prefix() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let ours = PlainStore::new(&db, "foo", "bar", 0);
        let theirs = PlainStore::new(&db, "foo", "baz", 0);

        let id = ours
            .put_object(object::frame(ObjectKind::Blob, b"a"))
            .await
            .unwrap();
        ours.advance(None, 1, id).await.unwrap();
        let other_id = theirs
            .put_object(object::frame(ObjectKind::Blob, b"b"))
            .await
            .unwrap();

        ours.purge().await.unwrap();
        assert!(!ours.contains(id).await.unwrap());
        assert_eq!(ours.ref_get(HEAD_REF).await.unwrap(), None);
        assert!(theirs.contains(other_id).await.unwrap());
    }
}
