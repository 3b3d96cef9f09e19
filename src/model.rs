//! Data models of the repository storage engine.
//!
//! The serde shapes here are wire-frozen: they serialize exactly the way the
//! public HTTP API renders them, so the transport layer can pass them
//! through unchanged.
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// A revision number of a [`Commit`].
///
/// A revision number is an integer which refers to a specific point of
/// repository history. When a repository is created, it starts with an
/// initial commit whose revision is 1. As new commits are added, each commit
/// gets its own revision number, monotonically increasing from the previous
/// commit's revision. i.e. 1, 2, 3, ...
///
/// A revision number can also be represented as a negative integer. When a
/// revision number is negative, we start from -1 which refers to the latest
/// commit in repository history, which is often called 'HEAD' of the
/// repository. A smaller revision number refers to the older commit. e.g.
/// -2 refers to the commit before the latest commit, and so on.
///
/// A revision with a negative integer is called 'relative revision'. By
/// contrast, a revision with a positive integer is called 'absolute
/// revision'. Revision `0` is not a valid revision of either sort.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(i32);

impl Revision {
    /// Revision `-1`, also known as `HEAD`.
    pub const HEAD: Revision = Revision(-1);
    /// Revision `1`, also known as `INIT`.
    pub const INIT: Revision = Revision(1);

    /// Create a new instance with the specified revision number.
    pub fn from(i: i32) -> Self {
        Revision(i)
    }

    /// The raw revision number.
    pub fn major(&self) -> i32 {
        self.0
    }

    /// Whether this revision is relative to `HEAD`.
    pub fn is_relative(&self) -> bool {
        self.0 < 0
    }

    /// The revision `count` steps before this one.
    ///
    /// Works for both forms: `HEAD.backward(1)` is `HEAD - 1` (i.e. -2) and
    /// `Revision::from(5).backward(4)` is `INIT`. Whether the result exists
    /// is decided when it is resolved against a repository.
    pub fn backward(&self, count: i32) -> Revision {
        Revision(self.0 - count)
    }

    /// The revision `count` steps after this one.
    pub fn forward(&self, count: i32) -> Revision {
        Revision(self.0 + count)
    }

    /// Parses the textual form of a revision.
    ///
    /// Accepts the bare integer form (`"5"`, `"-1"`), the literal `"head"`
    /// in any case, and the legacy `"<major>.0"` form kept for API
    /// compatibility. The canonical rendering is always the bare integer.
    pub fn from_text(text: &str) -> Option<Revision> {
        let text = text.trim();
        if text.eq_ignore_ascii_case("head") {
            return Some(Revision::HEAD);
        }
        let major = match text.split_once('.') {
            Some((major, minor)) => {
                if minor != "0" {
                    return None;
                }
                major
            }
            None => text,
        };
        match major.parse::<i32>() {
            Ok(0) | Err(_) => None,
            Ok(i) => Some(Revision(i)),
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creator of a project or repository or commit.
///
/// Two authors compare equal when their e-mail addresses are equal; the
/// display name carries no identity.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    /// Name of this author.
    pub name: String,
    /// Email of this author.
    pub email: String,
}

impl Author {
    /// The author used for system-generated commits, such as the initial
    /// commit of a repository.
    pub fn system() -> Author {
        Author {
            name: "System".to_string(),
            email: "system@localhost".to_string(),
        }
    }

    pub fn new(name: &str, email: &str) -> Author {
        Author {
            name: name.to_string(),
            email: email.to_string(),
        }
    }
}

impl Default for Author {
    fn default() -> Author {
        Author {
            name: "User".to_string(),
            email: "user@localhost".to_string(),
        }
    }
}

impl PartialEq for Author {
    fn eq(&self, other: &Author) -> bool {
        self.email == other.email
    }
}

impl Eq for Author {}

/// A top-level element in the storage model. A project is a namespace of
/// repositories.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Name of this project.
    pub name: String,
    /// The author who initially created this project.
    pub creator: Author,
    /// When the project was created.
    pub created_at: DateTime<Utc>,
}

/// Repository information.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// Name of this repository.
    pub name: String,
    /// The author who initially created this repository.
    pub creator: Author,
    /// Head [`Revision`] of the repository.
    pub head_revision: Revision,
    /// When the repository was created.
    pub created_at: DateTime<Utc>,
}

/// The content of an [`Entry`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum EntryContent {
    /// Content as a JSON Value.
    Json(serde_json::Value),
    /// Content as a String.
    Text(String),
    /// This Entry is a directory.
    Directory,
}

/// A file or a directory in a repository.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Path of this entry.
    pub path: String,
    /// Content of this entry.
    #[serde(flatten)]
    pub content: EntryContent,
    /// Revision of this entry.
    pub revision: Revision,
}

impl Entry {
    pub fn entry_type(&self) -> EntryType {
        match self.content {
            EntryContent::Json(_) => EntryType::Json,
            EntryContent::Text(_) => EntryType::Text,
            EntryContent::Directory => EntryType::Directory,
        }
    }
}

/// The type of a [`ListEntry`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// A UTF-8 encoded JSON file.
    Json,
    /// A UTF-8 encoded text file.
    Text,
    /// A directory.
    Directory,
}

/// A metadata of a file or a directory in a repository.
/// ListEntry has no content.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub path: String,
    pub r#type: EntryType,
}

/// Type of a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryType {
    Identity,
    IdentityJson,
    IdentityText,
    JsonPath(Vec<String>),
}

/// A Query on a file.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) path: String,
    pub(crate) r#type: QueryType,
}

impl Query {
    fn normalize_path(path: &str) -> String {
        if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{}", path)
        }
    }

    /// Returns a newly-created [`Query`] that retrieves the content as it is.
    /// Returns `None` if path is empty.
    pub fn identity(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::Identity,
        })
    }

    /// Returns a newly-created [`Query`] that retrieves the textual content
    /// as it is. Returns `None` if path is empty.
    pub fn of_text(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::IdentityText,
        })
    }

    /// Returns a newly-created [`Query`] that retrieves the JSON content as
    /// it is. Returns `None` if path is empty.
    pub fn of_json(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::IdentityJson,
        })
    }

    /// Returns a newly-created [`Query`] that applies a series of
    /// [JSON path expressions](https://github.com/json-path/JsonPath/blob/master/README.md)
    /// to the content.
    /// Returns `None` if path is empty or does not name a JSON document.
    pub fn of_json_path(path: &str, exprs: Vec<String>) -> Option<Self> {
        let lower = path.to_lowercase();
        if !(lower.ends_with(".json") || lower.ends_with(".yaml") || lower.ends_with(".yml")) {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::JsonPath(exprs),
        })
    }

    /// Path of the file this query addresses.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// A single source of a [`MergeQuery`].
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct MergeSource {
    /// Path of the file to merge.
    pub path: String,
    /// Whether the file may be absent. A missing non-optional source fails
    /// the whole merge.
    #[serde(default)]
    pub optional: bool,
}

impl MergeSource {
    pub fn required(path: &str) -> MergeSource {
        MergeSource {
            path: path.to_string(),
            optional: false,
        }
    }

    pub fn optional(path: &str) -> MergeSource {
        MergeSource {
            path: path.to_string(),
            optional: true,
        }
    }
}

/// A query that merges several JSON files into one composite document.
///
/// Sources are merged left to right with a right-biased deep merge: objects
/// merge recursively, scalars and arrays are replaced. The optional JSON
/// path expressions are applied to the merged document afterwards.
#[derive(Debug, Clone)]
pub struct MergeQuery {
    pub sources: Vec<MergeSource>,
    pub expressions: Vec<String>,
}

impl MergeQuery {
    pub fn of(sources: Vec<MergeSource>) -> MergeQuery {
        MergeQuery {
            sources,
            expressions: Vec::new(),
        }
    }

    pub fn of_json_path(sources: Vec<MergeSource>, expressions: Vec<String>) -> MergeQuery {
        MergeQuery {
            sources,
            expressions,
        }
    }
}

/// The result of a merge query.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MergedEntry {
    /// Revision the merge was evaluated at.
    pub revision: Revision,
    /// Paths of the sources that existed and contributed to the result.
    pub paths: Vec<String>,
    /// The merged document.
    pub content: serde_json::Value,
}

/// Typed content of a [`CommitMessage`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "markup", content = "detail")]
pub enum CommitDetail {
    /// Commit details as markdown.
    Markdown(String),
    /// Commit details as plaintext.
    Plaintext(String),
    /// Commit details whose markup is not known.
    Unknown(String),
}

/// Description of a [`Commit`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitMessage {
    /// Summary of this commit message.
    pub summary: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    /// Detailed description of this commit message.
    pub detail: Option<CommitDetail>,
}

impl CommitMessage {
    pub fn only_summary(summary: &str) -> CommitMessage {
        CommitMessage {
            summary: summary.to_string(),
            detail: None,
        }
    }
}

/// Result of a push operation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    /// Revision of this commit.
    pub revision: Revision,
    /// When this commit was pushed.
    #[serde(with = "iso8601_seconds")]
    pub pushed_at: DateTime<Utc>,
}

/// A set of Changes and its metadata.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Revision of this commit.
    pub revision: Revision,
    /// Author of this commit.
    pub author: Author,
    /// Description of this commit.
    pub commit_message: CommitMessage,
    /// When this commit was pushed.
    #[serde(with = "iso8601_seconds")]
    pub pushed_at: DateTime<Utc>,
}

/// Typed content of a [`Change`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum ChangeContent {
    /// Adds a new JSON file or replaces an existing file with the provided
    /// json.
    UpsertJson(serde_json::Value),

    /// Adds a new text file or replaces an existing file with the provided
    /// content.
    UpsertText(String),

    /// Removes an existing file.
    Remove,

    /// Renames an existing file to this provided path.
    Rename(String),

    /// Applies a JSON patch to a JSON file with the provided JSON patch
    /// object, as defined in [RFC 6902](https://tools.ietf.org/html/rfc6902).
    ApplyJsonPatch(serde_json::Value),

    /// Applies a textual patch to a text file with the provided
    /// [unified format](https://en.wikipedia.org/wiki/Diff_utility#Unified_format)
    /// string.
    ApplyTextPatch(String),
}

/// A modification of an individual [`Entry`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Path of the file change.
    pub path: String,
    /// Content of the file change.
    #[serde(flatten)]
    pub content: ChangeContent,
}

impl Change {
    pub fn upsert_json(path: &str, content: serde_json::Value) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::UpsertJson(content),
        }
    }

    pub fn upsert_text(path: &str, content: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::UpsertText(content.to_string()),
        }
    }

    pub fn remove(path: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::Remove,
        }
    }

    pub fn rename(path: &str, new_path: &str) -> Change {
        Change {
            path: path.to_string(),
            content: ChangeContent::Rename(new_path.to_string()),
        }
    }
}

/// A change result from a file watch operation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WatchFileResult {
    /// Revision of the change.
    pub revision: Revision,
    /// Content of the change.
    pub entry: Entry,
}

/// A change result from a repository watch operation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WatchRepoResult {
    /// Revision of the change.
    pub revision: Revision,
}

/// Serializes timestamps as ISO-8601 truncated to whole seconds, the way the
/// public API renders `pushedAt`.
mod iso8601_seconds {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
