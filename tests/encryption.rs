#[macro_use]
mod utils;

use centraldogma_storage as cd;

use cd::model::{Author, Change, CommitMessage, EntryContent, Query, Revision};
use cd::{Kms, StorageConfig, StorageEngine};

use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;

/// A stand-in KMS: wraps key material by XOR-ing it with a fixed pad.
struct TestKms(u8);

#[async_trait]
impl Kms for TestKms {
    async fn wrap(&self, key_material: &[u8]) -> Result<Vec<u8>, cd::Error> {
        Ok(key_material.iter().map(|b| b ^ self.0).collect())
    }

    async fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>, cd::Error> {
        Ok(wrapped.iter().map(|b| b ^ self.0).collect())
    }
}

fn encrypted_config(dir: &tempfile::TempDir) -> StorageConfig {
    let mut config = StorageConfig::new(dir.path());
    config.encrypt_new_repositories = true;
    config
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[tokio::test]
async fn test_encrypted_repo_survives_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let engine =
            StorageEngine::open_with_kms(encrypted_config(&dir), Arc::new(TestKms(0x42))).await?;
        engine.create_project("foo", Author::default()).await?;
        engine
            .project("foo")?
            .create_repo("bar", Author::default())
            .await?;
        let repo = engine.project("foo")?.repo("bar")?;
        repo.commit(
            Revision::HEAD,
            Author::default(),
            CommitMessage::only_summary("Add secret"),
            vec![Change::upsert_text("/secret", "42")],
            false,
        )
        .await?;
        // The engine (and with it the store) shuts down here.
    }

    let engine =
        StorageEngine::open_with_kms(encrypted_config(&dir), Arc::new(TestKms(0x42))).await?;
    let repo = engine.project("foo")?.repo("bar")?;
    let entry = repo
        .get_file(Revision::HEAD, &Query::identity("/secret").unwrap())
        .await
        .context("Failed to read the secret back after reopen")?;
    ensure!(
        entry.content == EntryContent::Text("42\n".to_string()),
        here!("Secret content mismatch after reopen")
    );
    drop(engine);

    // The raw key-value store must not contain the path or the content in
    // the clear.
    let db = sled::open(dir.path())?;
    let mut rows: Vec<(sled::IVec, sled::IVec)> = Vec::new();
    for row in db.iter() {
        rows.push(row?);
    }
    for name in db.tree_names() {
        if name.starts_with(b"__sled__") {
            continue;
        }
        for row in db.open_tree(&name)?.iter() {
            rows.push(row?);
        }
    }
    ensure!(!rows.is_empty(), here!("Raw store is unexpectedly empty"));
    for (key, value) in rows {
        ensure!(
            !contains_subslice(&key, b"/secret") && !contains_subslice(&value, b"/secret"),
            here!("Raw store leaks the file path")
        );
        ensure!(
            !contains_subslice(&value, b"42\n"),
            here!("Raw store leaks the file content")
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_wrong_kms_cannot_read() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let engine =
            StorageEngine::open_with_kms(encrypted_config(&dir), Arc::new(TestKms(0x42))).await?;
        engine.create_project("foo", Author::default()).await?;
        engine
            .project("foo")?
            .create_repo("bar", Author::default())
            .await?;
    }

    // A provider unwrapping to different key material must not decrypt
    // anything, let alone fall back to plaintext.
    let outcome =
        StorageEngine::open_with_kms(encrypted_config(&dir), Arc::new(TestKms(0x1))).await;
    ensure!(
        outcome.is_err(),
        here!("Opening with the wrong key material must fail")
    );
    Ok(())
}

#[tokio::test]
async fn test_purge_destroys_key_material() -> Result<()> {
    let dir = tempfile::tempdir()?;
    {
        let engine =
            StorageEngine::open_with_kms(encrypted_config(&dir), Arc::new(TestKms(0x42))).await?;
        engine.create_project("foo", Author::default()).await?;
        let project = engine.project("foo")?;
        project.create_repo("bar", Author::default()).await?;
        project.repo("bar")?.commit(
            Revision::HEAD,
            Author::default(),
            CommitMessage::only_summary("Add secret"),
            vec![Change::upsert_text("/secret", "42")],
            false,
        )
        .await?;

        project.remove_repo("bar")?;
        project.purge_repo("bar").await?;

        // The name can be reused; history starts over at revision 1.
        let info = project.create_repo("bar", Author::default()).await?;
        ensure!(
            info.head_revision == Revision::INIT,
            here!("A re-created repository must start from scratch")
        );
        let read = project
            .repo("bar")?
            .get_file(Revision::HEAD, &Query::identity("/secret").unwrap())
            .await;
        ensure!(
            matches!(read, Err(cd::Error::EntryNotFound { .. })),
            here!("Pre-purge revisions must not resurface")
        );
    }

    let db = sled::open(dir.path())?;
    let wdek_count = db.open_tree("wdek")?.len();
    ensure!(
        wdek_count == 1,
        here!("Exactly the re-created repository's WDEK may remain")
    );
    Ok(())
}
