//! Namespace path helpers.
//!
//! Paths are `/`-separated absolute keys into the coordination service's
//! hierarchical namespace, e.g. `/apps/worker-7`. The root is `/`.

use crate::errors::CoordinationError;

/// Validate an absolute namespace path.
///
/// Rules: must start with `/`; no trailing `/` (except the root itself);
/// no empty, `.` or `..` segments.
pub fn validate_path(path: &str) -> Result<(), CoordinationError> {
    if !path.starts_with('/') {
        return Err(CoordinationError::InvalidPath {
            path: path.to_owned(),
            reason: "must start with '/'",
        });
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(CoordinationError::InvalidPath {
            path: path.to_owned(),
            reason: "must not end with '/'",
        });
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() {
            return Err(CoordinationError::InvalidPath {
                path: path.to_owned(),
                reason: "empty path segment",
            });
        }
        if segment == "." || segment == ".." {
            return Err(CoordinationError::InvalidPath {
                path: path.to_owned(),
                reason: "relative path segment",
            });
        }
    }
    Ok(())
}

/// Parent of a path, or `None` for the root.
#[must_use]
pub fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Join a parent path with a child name.
#[must_use]
pub fn child_of(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

/// Final segment of a path (the node's own name).
#[must_use]
pub fn last_segment(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_paths() {
        for path in ["/", "/one", "/one/two", "/one/two/three"] {
            assert!(validate_path(path).is_ok(), "{path} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        for path in ["", "one", "/one/", "//", "/one//two", "/./x", "/one/.."] {
            assert!(validate_path(path).is_err(), "{path} should be invalid");
        }
    }

    #[test]
    fn parent_and_join_are_inverse() {
        assert_eq!(parent_of("/"), None);
        assert_eq!(parent_of("/one"), Some("/"));
        assert_eq!(parent_of("/one/two"), Some("/one"));
        assert_eq!(child_of("/", "one"), "/one");
        assert_eq!(child_of("/one", "two"), "/one/two");
        assert_eq!(last_segment("/one/two"), "two");
        assert_eq!(last_segment("/one"), "one");
    }
}
