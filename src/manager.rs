//! Engine entry point: project and repository life-cycle.
//!
//! Projects are namespaces of repositories. Removal is a metadata flag and
//! reversible; purging destroys durable data (including key material) and
//! leaves only a tombstone record, so a name can be re-created without ever
//! resurrecting pre-purge revisions. Every incarnation gets a fresh store
//! generation.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    model::{Author, Project},
    repository::{commit, RepoRecord, RepoState, Repository, StoreFactory},
    storage::encryption::Kms,
    Error,
};

const PROJECT_META_PREFIX: &str = "meta/projects/";
const REPO_META_PREFIX: &str = "meta/repos/";

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory of the embedded key-value store.
    pub root: PathBuf,
    /// Byte budget of each repository's result cache.
    pub cache_capacity_bytes: u64,
    /// Commits a primary may accumulate before a rolling secondary starts.
    /// 0 disables rolling.
    pub rolling_threshold: u32,
    /// Minimum age of a rolling secondary before it may be promoted.
    pub min_secondary_age: Duration,
    /// Slack added on top of a watch's rounded-up deadline.
    pub watch_slack: Duration,
    /// Encrypt newly created repositories. Requires a KMS provider.
    pub encrypt_new_repositories: bool,
}

impl StorageConfig {
    pub fn new(root: impl AsRef<Path>) -> StorageConfig {
        StorageConfig {
            root: root.as_ref().to_path_buf(),
            cache_capacity_bytes: 64 << 20,
            rolling_threshold: 0,
            min_secondary_age: Duration::from_secs(10 * 60),
            watch_slack: Duration::from_secs(1),
            encrypt_new_repositories: false,
        }
    }
}

/// Persists one repository's metadata record in the default column family.
pub(crate) struct MetaStore {
    tree: sled::Tree,
    key: String,
}

impl MetaStore {
    fn new(db: &sled::Db, project: &str, repo: &str) -> MetaStore {
        MetaStore {
            tree: (**db).clone(),
            key: format!("{}{}/{}", REPO_META_PREFIX, project, repo),
        }
    }

    pub fn save(&self, record: &RepoRecord) -> Result<(), Error> {
        self.tree
            .insert(self.key.as_bytes(), serde_json::to_vec(record)?)?;
        self.tree.flush()?;
        Ok(())
    }

    fn load(&self) -> Result<Option<RepoRecord>, Error> {
        match self.tree.get(self.key.as_bytes())? {
            None => Ok(None),
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProjectRecord {
    creator: Author,
    created_at: DateTime<Utc>,
    removed: bool,
}

struct ProjectState {
    name: String,
    record: std::sync::Mutex<ProjectRecord>,
    repos: std::sync::RwLock<HashMap<String, Arc<Repository>>>,
    /// Serializes repository creation and purge within the project.
    alter_lock: tokio::sync::Mutex<()>,
}

impl ProjectState {
    fn removed(&self) -> bool {
        self.record.lock().expect("poisoned").removed
    }

    fn to_project(&self) -> Project {
        let record = self.record.lock().expect("poisoned");
        Project {
            name: self.name.clone(),
            creator: record.creator.clone(),
            created_at: record.created_at,
        }
    }
}

fn validate_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidParams(
            "names may only contain alphanumerics, '-', '_' and '.'",
        ))
    }
}

/// The storage engine: one embedded store, many projects.
pub struct StorageEngine {
    db: sled::Db,
    config: Arc<StorageConfig>,
    kms: Option<Arc<dyn Kms>>,
    projects: std::sync::RwLock<HashMap<String, Arc<ProjectState>>>,
}

impl StorageEngine {
    /// Opens (or creates) the engine at the configured root, re-attaching
    /// every surviving project and repository.
    pub async fn open(config: StorageConfig) -> Result<StorageEngine, Error> {
        StorageEngine::open_inner(config, None).await
    }

    /// Like [`open`](Self::open), with a KMS provider for encrypted
    /// repositories. Required when any repository is (or will be) encrypted.
    pub async fn open_with_kms(
        config: StorageConfig,
        kms: Arc<dyn Kms>,
    ) -> Result<StorageEngine, Error> {
        StorageEngine::open_inner(config, Some(kms)).await
    }

    async fn open_inner(
        config: StorageConfig,
        kms: Option<Arc<dyn Kms>>,
    ) -> Result<StorageEngine, Error> {
        if config.encrypt_new_repositories && kms.is_none() {
            return Err(Error::Storage(
                "encryption is enabled but no KMS provider is configured".to_string(),
            ));
        }
        let db = sled::open(&config.root)?;
        let engine = StorageEngine {
            db,
            config: Arc::new(config),
            kms,
            projects: std::sync::RwLock::new(HashMap::new()),
        };
        engine.hydrate().await?;
        Ok(engine)
    }

    /// Reloads project and repository metadata from disk.
    async fn hydrate(&self) -> Result<(), Error> {
        let mut projects = HashMap::new();
        for row in self.db.scan_prefix(PROJECT_META_PREFIX.as_bytes()) {
            let (key, value) = row?;
            let name = String::from_utf8_lossy(&key[PROJECT_META_PREFIX.len()..]).to_string();
            let record: ProjectRecord = serde_json::from_slice(&value)?;
            projects.insert(
                name.clone(),
                Arc::new(ProjectState {
                    name,
                    record: std::sync::Mutex::new(record),
                    repos: std::sync::RwLock::new(HashMap::new()),
                    alter_lock: tokio::sync::Mutex::new(()),
                }),
            );
        }

        for row in self.db.scan_prefix(REPO_META_PREFIX.as_bytes()) {
            let (key, value) = row?;
            let suffix = String::from_utf8_lossy(&key[REPO_META_PREFIX.len()..]).to_string();
            let (project_name, repo_name) = match suffix.split_once('/') {
                Some(parts) => parts,
                None => continue,
            };
            let record: RepoRecord = serde_json::from_slice(&value)?;
            if record.purged {
                continue;
            }
            let project = match projects.get(project_name) {
                Some(project) => project.clone(),
                None => {
                    log::warn!("repository {} belongs to no project, skipping", suffix);
                    continue;
                }
            };
            let encrypted = record.encrypted;
            let repo = Repository::attach(
                project_name.to_string(),
                repo_name.to_string(),
                record,
                self.store_factory(project_name, repo_name, encrypted),
                MetaStore::new(&self.db, project_name, repo_name),
                self.config.clone(),
            )
            .await?;
            project
                .repos
                .write()
                .expect("poisoned")
                .insert(repo_name.to_string(), repo);
        }

        *self.projects.write().expect("poisoned") = projects;
        Ok(())
    }

    fn store_factory(&self, project: &str, repo: &str, encrypted: bool) -> StoreFactory {
        StoreFactory {
            db: self.db.clone(),
            project: project.to_string(),
            repo: repo.to_string(),
            encrypted,
            kms: self.kms.clone(),
        }
    }

    fn save_project(&self, name: &str, record: &ProjectRecord) -> Result<(), Error> {
        self.db.insert(
            format!("{}{}", PROJECT_META_PREFIX, name).as_bytes(),
            serde_json::to_vec(record)?,
        )?;
        self.db.flush()?;
        Ok(())
    }

    /// Creates a project.
    pub async fn create_project(&self, name: &str, creator: Author) -> Result<Project, Error> {
        validate_name(name)?;
        let record = ProjectRecord {
            creator,
            created_at: Utc::now(),
            removed: false,
        };
        let mut projects = self.projects.write().expect("poisoned");
        if projects.contains_key(name) {
            return Err(Error::ProjectExists(name.to_string()));
        }
        self.save_project(name, &record)?;
        let state = Arc::new(ProjectState {
            name: name.to_string(),
            record: std::sync::Mutex::new(record),
            repos: std::sync::RwLock::new(HashMap::new()),
            alter_lock: tokio::sync::Mutex::new(()),
        });
        projects.insert(name.to_string(), state.clone());
        Ok(state.to_project())
    }

    fn project_state(&self, name: &str) -> Result<Arc<ProjectState>, Error> {
        self.projects
            .read()
            .expect("poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))
    }

    /// A handle on a live (not removed) project.
    pub fn project(&self, name: &str) -> Result<ProjectHandle<'_>, Error> {
        let state = self.project_state(name)?;
        if state.removed() {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        Ok(ProjectHandle {
            engine: self,
            state,
        })
    }

    /// Retrieves the list of the projects.
    pub fn list_projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self
            .projects
            .read()
            .expect("poisoned")
            .values()
            .filter(|state| !state.removed())
            .map(|state| state.to_project())
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    /// Retrieves the list of the removed projects, which can be unremoved
    /// or purged.
    pub fn list_removed_projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .projects
            .read()
            .expect("poisoned")
            .values()
            .filter(|state| state.removed())
            .map(|state| state.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Removes a project. A removed project can be unremoved.
    pub fn remove_project(&self, name: &str) -> Result<(), Error> {
        let state = self.project_state(name)?;
        if state.removed() {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        let mut record = state.record.lock().expect("poisoned");
        record.removed = true;
        self.save_project(name, &record)
    }

    /// Unremoves a project.
    pub fn unremove_project(&self, name: &str) -> Result<Project, Error> {
        let state = self.project_state(name)?;
        {
            let mut record = state.record.lock().expect("poisoned");
            if !record.removed {
                return Err(Error::ProjectNotFound(name.to_string()));
            }
            record.removed = false;
            self.save_project(name, &record)?;
        }
        Ok(state.to_project())
    }

    /// Purges a removed project and every repository in it. Irreversible.
    pub async fn purge_project(&self, name: &str) -> Result<(), Error> {
        let state = self.project_state(name)?;
        if !state.removed() {
            return Err(Error::InvalidParams("only a removed project can be purged"));
        }
        let repos: Vec<Arc<Repository>> = state
            .repos
            .read()
            .expect("poisoned")
            .values()
            .cloned()
            .collect();
        for repo in repos {
            repo.set_state(RepoState::Removed)?;
            repo.purge_stores().await?;
        }
        state.repos.write().expect("poisoned").clear();
        self.db
            .remove(format!("{}{}", PROJECT_META_PREFIX, name).as_bytes())?;
        self.db.flush()?;
        self.projects.write().expect("poisoned").remove(name);
        Ok(())
    }
}

/// Repository life-cycle operations scoped to one project.
pub struct ProjectHandle<'a> {
    engine: &'a StorageEngine,
    state: Arc<ProjectState>,
}

impl<'a> ProjectHandle<'a> {
    fn ensure_live(&self) -> Result<(), Error> {
        if self.state.removed() {
            return Err(Error::ProjectNotFound(self.state.name.clone()));
        }
        Ok(())
    }

    /// Creates a repository with its initial empty commit at revision 1.
    pub async fn create_repo(
        &self,
        name: &str,
        creator: Author,
    ) -> Result<crate::model::Repository, Error> {
        self.ensure_live()?;
        validate_name(name)?;
        let _alter = self.state.alter_lock.lock().await;
        if self.state.repos.read().expect("poisoned").contains_key(name) {
            return Err(Error::RepositoryExists(name.to_string()));
        }

        let project_name = self.state.name.as_str();
        let meta = MetaStore::new(&self.engine.db, project_name, name);
        let encrypted = self.engine.config.encrypt_new_repositories;
        let mut record = RepoRecord::new(creator, Utc::now(), encrypted);
        if let Some(tombstone) = meta.load()? {
            if !tombstone.purged {
                return Err(Error::RepositoryExists(name.to_string()));
            }
            // Re-creation after purge: a fresh generation, never the old
            // rows.
            record.generation = tombstone.next_generation;
            record.next_generation = tombstone.next_generation + 1;
            record.encrypted = encrypted;
        }

        let factory = self.engine.store_factory(project_name, name, record.encrypted);
        let store = factory.create(record.generation).await?;
        commit::write_initial_commit(&store, record.created_at).await?;
        meta.save(&record)?;

        let repo = Repository::attach(
            project_name.to_string(),
            name.to_string(),
            record,
            self.engine.store_factory(project_name, name, encrypted),
            MetaStore::new(&self.engine.db, project_name, name),
            self.engine.config.clone(),
        )
        .await?;
        let info = repo.info();
        self.state
            .repos
            .write()
            .expect("poisoned")
            .insert(name.to_string(), repo);
        Ok(info)
    }

    /// A live repository by name.
    pub fn repo(&self, name: &str) -> Result<Arc<Repository>, Error> {
        self.ensure_live()?;
        let repo = self
            .state
            .repos
            .read()
            .expect("poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;
        if repo.state() != RepoState::Active {
            return Err(Error::RepositoryNotFound(name.to_string()));
        }
        Ok(repo)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.repo(name).is_ok()
    }

    /// Retrieves the list of the repositories.
    pub fn list_repos(&self) -> Result<Vec<crate::model::Repository>, Error> {
        self.ensure_live()?;
        let mut repos: Vec<crate::model::Repository> = self
            .state
            .repos
            .read()
            .expect("poisoned")
            .values()
            .filter(|repo| repo.state() == RepoState::Active)
            .map(|repo| repo.info())
            .collect();
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    /// Retrieves the list of the removed repositories, which can be
    /// unremoved.
    pub fn list_removed_repos(&self) -> Result<Vec<String>, Error> {
        self.ensure_live()?;
        let mut names: Vec<String> = self
            .state
            .repos
            .read()
            .expect("poisoned")
            .values()
            .filter(|repo| repo.state() == RepoState::Removed)
            .map(|repo| repo.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Removes a repository; a removed repository can be unremoved until it
    /// is purged.
    pub fn remove_repo(&self, name: &str) -> Result<(), Error> {
        let repo = self.repo(name)?;
        repo.set_state(RepoState::Removed)
    }

    /// Unremoves a repository.
    pub fn unremove_repo(&self, name: &str) -> Result<crate::model::Repository, Error> {
        self.ensure_live()?;
        let repo = self
            .state
            .repos
            .read()
            .expect("poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;
        if repo.state() != RepoState::Removed {
            return Err(Error::RepositoryNotFound(name.to_string()));
        }
        repo.set_state(RepoState::Active)?;
        Ok(repo.info())
    }

    /// Purges a repository that was removed before, destroying its data and
    /// key material.
    pub async fn purge_repo(&self, name: &str) -> Result<(), Error> {
        self.ensure_live()?;
        let _alter = self.state.alter_lock.lock().await;
        let repo = self
            .state
            .repos
            .read()
            .expect("poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;
        if repo.state() != RepoState::Removed {
            return Err(Error::InvalidParams(
                "only a removed repository can be purged",
            ));
        }
        repo.purge_stores().await?;
        self.state.repos.write().expect("poisoned").remove(name);
        Ok(())
    }

    /// Promotes a repository's rolling secondary to primary.
    pub async fn promote_secondary(&self, name: &str) -> Result<(), Error> {
        let repo = self.repo(name)?;
        repo.promote_secondary().await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn engine() -> (tempfile::TempDir, StorageEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = StorageEngine::open(StorageConfig::new(dir.path()))
            .await
            .unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn test_project_lifecycle() {
        let (_dir, engine) = engine().await;
        engine
            .create_project("foo", Author::default())
            .await
            .unwrap();
        assert!(matches!(
            engine.create_project("foo", Author::default()).await,
            Err(Error::ProjectExists(_))
        ));
        assert_eq!(engine.list_projects().len(), 1);

        engine.remove_project("foo").unwrap();
        assert!(engine.list_projects().is_empty());
        assert_eq!(engine.list_removed_projects(), vec!["foo"]);
        assert!(matches!(
            engine.project("foo"),
            Err(Error::ProjectNotFound(_))
        ));

        engine.unremove_project("foo").unwrap();
        assert_eq!(engine.list_projects().len(), 1);

        engine.remove_project("foo").unwrap();
        engine.purge_project("foo").await.unwrap();
        assert!(matches!(
            engine.project("foo"),
            Err(Error::ProjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_repo_lifecycle() {
        let (_dir, engine) = engine().await;
        engine
            .create_project("foo", Author::default())
            .await
            .unwrap();
        let project = engine.project("foo").unwrap();
        let info = project.create_repo("bar", Author::default()).await.unwrap();
        assert_eq!(info.head_revision, crate::model::Revision::INIT);
        assert!(matches!(
            project.create_repo("bar", Author::default()).await,
            Err(Error::RepositoryExists(_))
        ));
        assert!(project.exists("bar"));

        project.remove_repo("bar").unwrap();
        assert!(!project.exists("bar"));
        assert_eq!(project.list_removed_repos().unwrap(), vec!["bar"]);

        project.unremove_repo("bar").unwrap();
        assert!(project.exists("bar"));

        project.remove_repo("bar").unwrap();
        project.purge_repo("bar").await.unwrap();
        assert!(matches!(
            project.repo("bar"),
            Err(Error::RepositoryNotFound(_))
        ));

        // Purged names can be re-created from scratch.
        let info = project.create_repo("bar", Author::default()).await.unwrap();
        assert_eq!(info.head_revision, crate::model::Revision::INIT);
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let (_dir, engine) = engine().await;
        assert!(matches!(
            engine.create_project("a/b", Author::default()).await,
            Err(Error::InvalidParams(_))
        ));
        assert!(matches!(
            engine.create_project("", Author::default()).await,
            Err(Error::InvalidParams(_))
        ));
    }
}
