//! Path hygiene for repository-relative storage paths.
//!
//! Every path that reaches the pipeline is canonicalized through
//! [`clean_relative_path`] first: absolute paths and any `..` component
//! are rejected outright so a stray event can never address a file
//! outside the repository root.

use lum_domain::repository::{INBOX_DIR, SYSTEM_DIR};
use lum_domain::{Error, Result};

/// Normalize a repository-relative path to forward-slash form.
///
/// Rejects absolute paths and any path containing `..`; strips `.`
/// components and empty segments.
pub fn clean_relative_path(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') {
        return Err(Error::InvalidInput(format!(
            "absolute path not allowed: {path}"
        )));
    }

    let mut segments = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                return Err(Error::InvalidInput(format!(
                    "path escapes repository root: {path}"
                )))
            }
            s => segments.push(s),
        }
    }
    if segments.is_empty() {
        return Err(Error::InvalidInput("empty relative path".into()));
    }
    Ok(segments.join("/"))
}

/// Whether a clean relative path lives in a subtree discovery ignores.
pub fn is_excluded(relative: &str) -> bool {
    for prefix in [SYSTEM_DIR, INBOX_DIR] {
        if relative == prefix || relative.starts_with(&format!("{prefix}/")) {
            return true;
        }
    }
    false
}

/// Final path component.
pub fn file_name(relative: &str) -> &str {
    relative.rsplit('/').next().unwrap_or(relative)
}

/// Lowercase extension without the dot, if any.
pub fn extension(relative: &str) -> Option<String> {
    let name = file_name(relative);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_path_fails() {
        assert!(clean_relative_path("/abs/x").is_err());
    }

    #[test]
    fn parent_escape_fails() {
        assert!(clean_relative_path("../x").is_err());
        assert!(clean_relative_path("a/../../x").is_err());
    }

    #[test]
    fn dot_segments_are_normalized() {
        assert_eq!(clean_relative_path("a/./b").unwrap(), "a/b");
        assert_eq!(clean_relative_path("./a/b/").unwrap(), "a/b");
        assert_eq!(clean_relative_path("a//b").unwrap(), "a/b");
    }

    #[test]
    fn backslashes_are_unified() {
        assert_eq!(clean_relative_path("a\\b\\c.jpg").unwrap(), "a/b/c.jpg");
    }

    #[test]
    fn empty_path_fails() {
        assert!(clean_relative_path("").is_err());
        assert!(clean_relative_path("./.").is_err());
    }

    #[test]
    fn excluded_subtrees() {
        assert!(is_excluded(".lumilio"));
        assert!(is_excluded(".lumilio/watchman.clock"));
        assert!(is_excluded("inbox/upload.tmp"));
        assert!(!is_excluded("2024/inbox.jpg"));
        assert!(!is_excluded("photos/a.jpg"));
        // A prefix match alone is not enough.
        assert!(!is_excluded("inboxes/a.jpg"));
    }

    #[test]
    fn file_name_and_extension() {
        assert_eq!(file_name("2024/trip/IMG_1.JPG"), "IMG_1.JPG");
        assert_eq!(extension("2024/trip/IMG_1.JPG").as_deref(), Some("jpg"));
        assert_eq!(extension("README"), None);
        assert_eq!(extension(".hidden"), None);
        assert_eq!(extension("archive.tar."), None);
    }
}
