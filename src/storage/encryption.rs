//! Transparent envelope encryption over the repository store.
//!
//! Each encrypted repository owns a 256-bit data encryption key (DEK),
//! generated at creation and persisted only in wrapped form (WDEK) under
//! `"<project>/<repo>"` in the `wdek` column. The DEK is unwrapped lazily by
//! the external key-management service on first use and cached in memory for
//! the repository's lifetime; unwrapping never happens under the writer
//! lock.
//!
//! Every stored value is `nonce || AES-256-GCM-SIV(dek, nonce, plaintext,
//! aad = logical key)`. Even the storage keys are ciphertext: the row key is
//! the logical key encrypted under an all-zero nonce, which GCM-SIV makes
//! both safe (SIV tolerates nonce reuse) and deterministic (so reads can
//! recompute it). The `encryption_metadata` column keeps a plaintext-keyed
//! row per logical key holding the value nonce, which is what purge walks.
//!
//! A missing WDEK, a KMS unwrap failure or an AEAD verification failure is
//! fatal for the operation; there is no plaintext fallback.

use std::sync::Arc;

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng, Payload},
    AeadCore, Aes256GcmSiv, Nonce,
};
use async_trait::async_trait;
use zeroize::Zeroizing;

use super::{object, object::ObjectId, KeySpace, RepoStore};
use crate::Error;

const NONCE_LEN: usize = 12;
const DEK_LEN: usize = 32;

/// The external key-management service that wraps and unwraps repository
/// data keys. Exactly one provider must be configured when encryption is
/// enabled.
#[async_trait]
pub trait Kms: Send + Sync {
    /// Wraps raw key material for persistence.
    async fn wrap(&self, key_material: &[u8]) -> Result<Vec<u8>, Error>;

    /// Unwraps previously wrapped key material.
    async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, Error>;
}

pub(crate) struct EncryptedStore {
    wdek: sled::Tree,
    metadata: sled::Tree,
    objects: sled::Tree,
    refs: sled::Tree,
    db_flush: sled::Db,
    keys: KeySpace,
    wdek_key: String,
    kms: Arc<dyn Kms>,
    dek: tokio::sync::OnceCell<Aes256GcmSiv>,
}

impl EncryptedStore {
    /// Opens the store for an existing encrypted repository. The WDEK is
    /// not touched until the first read or write needs the DEK.
    pub fn open(
        db: &sled::Db,
        project: &str,
        repo: &str,
        generation: u32,
        kms: Arc<dyn Kms>,
    ) -> Result<EncryptedStore, Error> {
        Ok(EncryptedStore {
            wdek: db.open_tree(super::cf::WDEK)?,
            metadata: db.open_tree(super::cf::ENCRYPTION_METADATA)?,
            objects: db.open_tree(super::cf::ENCRYPTED_OBJECT)?,
            refs: db.open_tree(super::cf::ENCRYPTED_OBJECT_ID)?,
            db_flush: db.clone(),
            keys: KeySpace::new(project, repo, generation),
            wdek_key: format!("{}/{}", project, repo),
            kms,
            dek: tokio::sync::OnceCell::new(),
        })
    }

    /// Creates the store for a brand-new encrypted repository: generates the
    /// DEK, wraps it and persists the WDEK. Fails if a WDEK already exists
    /// for the repository.
    pub async fn create(
        db: &sled::Db,
        project: &str,
        repo: &str,
        generation: u32,
        kms: Arc<dyn Kms>,
    ) -> Result<EncryptedStore, Error> {
        let store = EncryptedStore::open(db, project, repo, generation, kms)?;

        let key = Aes256GcmSiv::generate_key(&mut OsRng);
        let material = Zeroizing::new(key.to_vec());
        let wrapped = store.kms.wrap(&material).await?;
        let outcome = store.wdek.compare_and_swap(
            store.wdek_key.as_bytes(),
            None as Option<&[u8]>,
            Some(wrapped),
        )?;
        if outcome.is_err() {
            return Err(Error::Storage(format!(
                "WDEK already exists for {}",
                store.wdek_key
            )));
        }
        store.wdek.flush_async().await?;

        let cipher = Aes256GcmSiv::new_from_slice(&material)
            .map_err(|_| Error::Storage("invalid DEK length".to_string()))?;
        let _ = store.dek.set(cipher);
        Ok(store)
    }

    async fn cipher(&self) -> Result<&Aes256GcmSiv, Error> {
        self.dek
            .get_or_try_init(|| async {
                let wrapped = self
                    .wdek
                    .get(self.wdek_key.as_bytes())?
                    .ok_or_else(|| Error::Storage(format!("no WDEK for {}", self.wdek_key)))?;
                let material = Zeroizing::new(self.kms.unwrap(&wrapped).await?);
                if material.len() != DEK_LEN {
                    return Err(Error::Storage(format!(
                        "unwrapped DEK has {} bytes, expected {}",
                        material.len(),
                        DEK_LEN
                    )));
                }
                Aes256GcmSiv::new_from_slice(&material)
                    .map_err(|_| Error::Storage("invalid DEK length".to_string()))
            })
            .await
    }

    /// The deterministic row key for a logical key.
    fn storage_key(cipher: &Aes256GcmSiv, logical: &[u8]) -> Result<Vec<u8>, Error> {
        cipher
            .encrypt(Nonce::from_slice(&[0u8; NONCE_LEN]), logical)
            .map_err(|_| Error::Storage("key encryption failure".to_string()))
    }

    fn seal(cipher: &Aes256GcmSiv, nonce: &[u8], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| Error::Storage("encryption failure".to_string()))?;
        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn unseal(cipher: &Aes256GcmSiv, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, Error> {
        if sealed.len() < NONCE_LEN {
            return Err(Error::Storage("truncated ciphertext".to_string()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| Error::Storage("decryption failure".to_string()))
    }

    fn fresh_nonce() -> Vec<u8> {
        Aes256GcmSiv::generate_nonce(&mut OsRng).to_vec()
    }

    async fn put_row(
        &self,
        tree: &sled::Tree,
        logical: Vec<u8>,
        plaintext: &[u8],
        aad: &[u8],
    ) -> Result<(), Error> {
        let cipher = self.cipher().await?;
        let row_key = Self::storage_key(cipher, &logical)?;
        let nonce = Self::fresh_nonce();
        let sealed = Self::seal(cipher, &nonce, plaintext, aad)?;
        self.metadata.insert(logical, nonce)?;
        tree.insert(row_key, sealed)?;
        Ok(())
    }

    async fn get_row(
        &self,
        tree: &sled::Tree,
        logical: &[u8],
        aad: &[u8],
    ) -> Result<Option<Vec<u8>>, Error> {
        let cipher = self.cipher().await?;
        let row_key = Self::storage_key(cipher, logical)?;
        match tree.get(row_key)? {
            None => Ok(None),
            Some(sealed) => Self::unseal(cipher, &sealed, aad).map(Some),
        }
    }
}

#[async_trait]
impl RepoStore for EncryptedStore {
    async fn put_object(&self, framed: Vec<u8>) -> Result<ObjectId, Error> {
        let id = object::hash_of(&framed);
        let logical = self.keys.object_key(id);
        self.put_row(&self.objects, logical, &framed, id.as_bytes())
            .await?;
        self.flush().await?;
        Ok(id)
    }

    async fn object(&self, id: ObjectId) -> Result<Option<Vec<u8>>, Error> {
        self.get_row(&self.objects, &self.keys.object_key(id), id.as_bytes())
            .await
    }

    async fn contains(&self, id: ObjectId) -> Result<bool, Error> {
        let cipher = self.cipher().await?;
        let row_key = Self::storage_key(cipher, &self.keys.object_key(id))?;
        Ok(self.objects.contains_key(row_key)?)
    }

    async fn ref_get(&self, name: &str) -> Result<Option<Vec<u8>>, Error> {
        self.get_row(&self.refs, &self.keys.ref_key(name), name.as_bytes())
            .await
    }

    async fn ref_cas(
        &self,
        name: &str,
        expected: Option<Vec<u8>>,
        new: Vec<u8>,
    ) -> Result<bool, Error> {
        let cipher = self.cipher().await?;
        let logical = self.keys.ref_key(name);
        let row_key = Self::storage_key(cipher, &logical)?;
        let aad = name.as_bytes();

        let current = self.refs.get(&row_key)?;
        // GCM-SIV is deterministic for a fixed nonce, so re-encrypting the
        // expected plaintext under the current row's nonce reproduces the
        // current row bytes exactly when the expectation holds.
        let expected_row = match (&expected, &current) {
            (None, None) => None,
            (None, Some(_)) | (Some(_), None) => return Ok(false),
            (Some(plain), Some(row)) => {
                if row.len() < NONCE_LEN {
                    return Err(Error::Storage("truncated ciphertext".to_string()));
                }
                Some(Self::seal(cipher, &row[..NONCE_LEN], plain, aad)?)
            }
        };

        let nonce = Self::fresh_nonce();
        let sealed = Self::seal(cipher, &nonce, &new, aad)?;
        let outcome = self
            .refs
            .compare_and_swap(&row_key, expected_row, Some(sealed))?;
        if outcome.is_ok() {
            self.metadata.insert(logical, nonce)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn revision_put(&self, revision: i32, id: ObjectId) -> Result<(), Error> {
        let logical = self.keys.revision_key(revision);
        let aad = logical.clone();
        self.put_row(&self.refs, logical, id.as_bytes(), &aad)
            .await
    }

    async fn revision_get(&self, revision: i32) -> Result<Option<ObjectId>, Error> {
        let logical = self.keys.revision_key(revision);
        match self.get_row(&self.refs, &logical, &logical).await? {
            None => Ok(None),
            Some(bytes) => Ok(Some(ObjectId::from_bytes(&bytes)?)),
        }
    }

    async fn purge(&self) -> Result<(), Error> {
        let cipher = self.cipher().await?.clone();
        let metadata = self.metadata.clone();
        let objects = self.objects.clone();
        let refs = self.refs.clone();
        let prefix = self.keys.prefix().to_vec();
        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            for row in metadata.scan_prefix(&prefix) {
                let (logical, _) = row?;
                let row_key = EncryptedStore::storage_key(&cipher, &logical)?;
                objects.remove(&row_key)?;
                refs.remove(&row_key)?;
                metadata.remove(logical)?;
            }
            Ok(())
        })
        .await??;
        self.flush().await?;
        Ok(())
    }

    async fn delete_key_material(&self) -> Result<(), Error> {
        self.wdek.remove(self.wdek_key.as_bytes())?;
        self.wdek.flush_async().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Error> {
        self.db_flush.flush_async().await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::HEAD_REF;

    /// A toy KMS that XORs key material with a fixed pad. Unwrapping with a
    /// different pad yields a different DEK, which then fails AEAD
    /// verification downstream.
    pub(crate) struct XorKms(pub u8);

    #[async_trait]
    impl Kms for XorKms {
        async fn wrap(&self, key_material: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(key_material.iter().map(|b| b ^ self.0).collect())
        }

        async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, Error> {
            Ok(wrapped.iter().map(|b| b ^ self.0).collect())
        }
    }

    fn db() -> sled::Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    #[tokio::test]
    async fn test_object_roundtrip() {
        let db = db();
        let kms: Arc<dyn Kms> = Arc::new(XorKms(0x5a));
        let store = EncryptedStore::create(&db, "foo", "bar", 0, kms)
            .await
            .unwrap();

        let framed = object::frame(object::ObjectKind::Blob, b"42\n");
        let id = store.put_object(framed.clone()).await.unwrap();
        assert_eq!(store.object(id).await.unwrap().unwrap(), framed);
        assert!(store.contains(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_unwraps_lazily() {
        let db = db();
        let kms: Arc<dyn Kms> = Arc::new(XorKms(0x5a));
        let store = EncryptedStore::create(&db, "foo", "bar", 0, kms.clone())
            .await
            .unwrap();
        let framed = object::frame(object::ObjectKind::Blob, b"42\n");
        let id = store.put_object(framed.clone()).await.unwrap();
        drop(store);

        let reopened = EncryptedStore::open(&db, "foo", "bar", 0, kms).unwrap();
        assert_eq!(reopened.object(id).await.unwrap().unwrap(), framed);
    }

    #[tokio::test]
    async fn test_wrong_kms_fails_verification() {
        let db = db();
        let store = EncryptedStore::create(&db, "foo", "bar", 0, Arc::new(XorKms(0x5a)))
            .await
            .unwrap();
        let framed = object::frame(object::ObjectKind::Blob, b"42\n");
        let id = store.put_object(framed).await.unwrap();
        drop(store);

        let wrong = EncryptedStore::open(&db, "foo", "bar", 0, Arc::new(XorKms(0x11))).unwrap();
        // The DEK unwraps to different material, so the deterministic row
        // key differs and the object is simply unreachable.
        assert_eq!(wrong.object(id).await.unwrap(), None);
        assert!(wrong.ref_get(HEAD_REF).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_wdek_rejected() {
        let db = db();
        let kms: Arc<dyn Kms> = Arc::new(XorKms(0x5a));
        EncryptedStore::create(&db, "foo", "bar", 0, kms.clone())
            .await
            .unwrap();
        let again = EncryptedStore::create(&db, "foo", "bar", 0, kms).await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_no_plaintext_in_raw_rows() {
        let db = db();
        let kms: Arc<dyn Kms> = Arc::new(XorKms(0x5a));
        let store = EncryptedStore::create(&db, "foo", "bar", 0, kms)
            .await
            .unwrap();
        let id = store
            .put_object(object::frame(object::ObjectKind::Blob, b"super-secret-payload"))
            .await
            .unwrap();
        store.advance(None, 1, id).await.unwrap();

        for tree in [
            db.open_tree(crate::storage::cf::ENCRYPTED_OBJECT).unwrap(),
            db.open_tree(crate::storage::cf::ENCRYPTED_OBJECT_ID).unwrap(),
        ] {
            for row in tree.iter() {
                let (key, value) = row.unwrap();
                let blob = [key.to_vec(), value.to_vec()].concat();
                let text = String::from_utf8_lossy(&blob);
                assert!(!text.contains("super-secret-payload"));
                assert!(!text.contains("foo/bar"));
            }
        }
    }

    #[tokio::test]
    async fn test_purge_removes_wdek_and_rows() {
        let db = db();
        let kms: Arc<dyn Kms> = Arc::new(XorKms(0x5a));
        let store = EncryptedStore::create(&db, "foo", "bar", 0, kms.clone())
            .await
            .unwrap();
        let id = store
            .put_object(object::frame(object::ObjectKind::Blob, b"x"))
            .await
            .unwrap();
        store.advance(None, 1, id).await.unwrap();
        store.purge().await.unwrap();
        store.delete_key_material().await.unwrap();

        let wdek = db.open_tree(crate::storage::cf::WDEK).unwrap();
        assert!(wdek.get(b"foo/bar").unwrap().is_none());
        let metadata = db.open_tree(crate::storage::cf::ENCRYPTION_METADATA).unwrap();
        assert_eq!(metadata.scan_prefix(b"foo/bar/").count(), 0);

        // A fresh repository under the same name starts from nothing.
        let recreated = EncryptedStore::create(&db, "foo", "bar", 1, kms).await;
        assert!(recreated.is_ok());
    }
}
