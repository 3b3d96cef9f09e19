#[macro_use]
mod utils;

use centraldogma_storage as cd;

use cd::model::Author;
use cd::{StorageConfig, StorageEngine};

use anyhow::{ensure, Result};

#[tokio::test]
async fn test_projects_survive_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let engine = StorageEngine::open(StorageConfig::new(dir.path())).await?;
        engine.create_project("alpha", Author::default()).await?;
        engine.create_project("beta", Author::default()).await?;
        engine.remove_project("beta")?;
    }

    let engine = StorageEngine::open(StorageConfig::new(dir.path())).await?;
    let names: Vec<String> = engine
        .list_projects()
        .into_iter()
        .map(|p| p.name)
        .collect();
    ensure!(names == vec!["alpha"], here!("Live project list mismatch"));
    ensure!(
        engine.list_removed_projects() == vec!["beta"],
        here!("Removed project list mismatch")
    );

    // A removed project can still be unremoved after a restart.
    let restored = engine.unremove_project("beta")?;
    ensure!(restored.name == "beta", here!("Unremove failed after reopen"));
    Ok(())
}

#[tokio::test]
async fn test_purged_project_is_gone_after_reopen() -> Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let engine = StorageEngine::open(StorageConfig::new(dir.path())).await?;
        engine.create_project("alpha", Author::default()).await?;
        engine
            .project("alpha")?
            .create_repo("repo", Author::default())
            .await?;
        engine.remove_project("alpha")?;
        engine.purge_project("alpha").await?;
    }

    let engine = StorageEngine::open(StorageConfig::new(dir.path())).await?;
    ensure!(
        engine.list_projects().is_empty() && engine.list_removed_projects().is_empty(),
        here!("A purged project must not come back")
    );
    Ok(())
}
