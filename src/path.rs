//! Repository path grammar.
//!
//! A repository path is Unix style: it begins with `/`, uses `/` as the
//! separator and is case sensitive. `.` and `..` components and empty
//! components are rejected. A directory path additionally ends with `/`.

use crate::{model::EntryType, Error};

/// Validates and normalizes a file path.
///
/// A missing leading `/` is tolerated and added, matching what the query
/// builders do; everything else in the grammar is enforced.
pub fn normalize_file_path(path: &str) -> Result<String, Error> {
    let path = ensure_leading_slash(path)?;
    if path.ends_with('/') {
        return Err(Error::InvalidPath(format!(
            "file path must not end with '/': {}",
            path
        )));
    }
    validate_components(&path)?;
    Ok(path)
}

/// Validates and normalizes a directory path, forcing the trailing `/`.
pub fn normalize_dir_path(path: &str) -> Result<String, Error> {
    let mut path = ensure_leading_slash(path)?;
    if !path.ends_with('/') {
        path.push('/');
    }
    validate_components(path.trim_end_matches('/'))?;
    Ok(path)
}

fn ensure_leading_slash(path: &str) -> Result<String, Error> {
    if path.is_empty() {
        return Err(Error::InvalidPath("empty path".to_string()));
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("/{}", path))
    }
}

fn validate_components(path: &str) -> Result<(), Error> {
    for component in path[1..].split('/') {
        if component.is_empty() {
            return Err(Error::InvalidPath(format!(
                "empty path component: {}",
                path
            )));
        }
        if component == "." || component == ".." {
            return Err(Error::InvalidPath(format!(
                "'.' and '..' are not allowed: {}",
                path
            )));
        }
    }
    Ok(())
}

/// Infers the entry type from the path suffix.
///
/// `.json`, `.yaml` and `.yml` files hold structured documents; a trailing
/// `/` marks a directory; anything else is text.
pub fn entry_type_of(path: &str) -> EntryType {
    if path.ends_with('/') {
        return EntryType::Directory;
    }
    let lower = path.to_lowercase();
    if lower.ends_with(".json") || lower.ends_with(".yaml") || lower.ends_with(".yml") {
        EntryType::Json
    } else {
        EntryType::Text
    }
}

/// Splits a file path into its directory components and file name.
/// `"/a/b/c.txt"` yields `(["a", "b"], "c.txt")`.
pub(crate) fn split_dirs(path: &str) -> (Vec<&str>, &str) {
    let mut components: Vec<&str> = path[1..].split('/').collect();
    let name = components.pop().unwrap_or("");
    (components, name)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_normalize_file_path() {
        assert_eq!(normalize_file_path("/a/b.txt").unwrap(), "/a/b.txt");
        assert_eq!(normalize_file_path("a/b.txt").unwrap(), "/a/b.txt");
        assert!(normalize_file_path("/a//b.txt").is_err());
        assert!(normalize_file_path("/a/./b.txt").is_err());
        assert!(normalize_file_path("/a/../b.txt").is_err());
        assert!(normalize_file_path("/a/b/").is_err());
        assert!(normalize_file_path("").is_err());
    }

    #[test]
    fn test_normalize_dir_path() {
        assert_eq!(normalize_dir_path("/a/b").unwrap(), "/a/b/");
        assert_eq!(normalize_dir_path("/a/b/").unwrap(), "/a/b/");
        assert!(normalize_dir_path("/a//b/").is_err());
    }

    #[test]
    fn test_entry_type_of() {
        assert_eq!(entry_type_of("/a.json"), EntryType::Json);
        assert_eq!(entry_type_of("/a.YAML"), EntryType::Json);
        assert_eq!(entry_type_of("/a.yml"), EntryType::Json);
        assert_eq!(entry_type_of("/a/"), EntryType::Directory);
        assert_eq!(entry_type_of("/a.txt"), EntryType::Text);
        assert_eq!(entry_type_of("/a"), EntryType::Text);
    }

    #[test]
    fn test_split_dirs() {
        let (dirs, name) = split_dirs("/a/b/c.txt");
        assert_eq!(dirs, vec!["a", "b"]);
        assert_eq!(name, "c.txt");

        let (dirs, name) = split_dirs("/c.txt");
        assert!(dirs.is_empty());
        assert_eq!(name, "c.txt");
    }
}
