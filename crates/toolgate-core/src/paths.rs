//! Path canonicalization and containment checks.
//!
//! Used to verify that paths granted to a sandbox via execute-request
//! permissions stay inside the allowed roots. Rejection messages never echo
//! the offending path.

use std::path::{Path, PathBuf};

use toolgate_error::GatewayError;

/// Canonicalize a path, resolving symlinks and relative components.
pub fn canonicalized(path: &Path) -> std::io::Result<PathBuf> {
    std::fs::canonicalize(path)
}

/// Verify that `path` resolves to a location under one of `roots`.
///
/// Both sides are canonicalized, so symlinks and `..` components cannot
/// escape. Returns the canonical path on success. The error message names
/// neither the path nor the roots.
pub fn ensure_contained(path: &Path, roots: &[PathBuf]) -> Result<PathBuf, GatewayError> {
    let resolved = canonicalized(path)
        .map_err(|_| GatewayError::Internal(anyhow::anyhow!("path is not accessible")))?;

    for root in roots {
        let Ok(root) = canonicalized(root) else {
            continue;
        };
        if resolved.starts_with(&root) {
            return Ok(resolved);
        }
    }

    Err(GatewayError::Internal(anyhow::anyhow!(
        "path is outside the permitted roots"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_path_is_accepted() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("data.txt");
        std::fs::write(&file, "x").unwrap();

        let resolved = ensure_contained(&file, &[root.path().to_path_buf()]).unwrap();
        assert!(resolved.ends_with("data.txt"));
    }

    #[test]
    fn escaping_path_is_rejected_without_leaking_it() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.txt");
        std::fs::write(&secret, "x").unwrap();

        let err = ensure_contained(&secret, &[root.path().to_path_buf()]).unwrap_err();
        let msg = err.to_string();
        assert!(
            !msg.contains(outside.path().to_str().unwrap()),
            "error must not echo the path: {msg}"
        );
    }

    #[test]
    fn dotdot_cannot_escape() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        let sneaky = sub.join("..").join("..");

        // Resolves above the root, so it must be rejected.
        assert!(ensure_contained(&sneaky, &[root.path().to_path_buf()]).is_err());
    }

    #[test]
    fn missing_path_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("does-not-exist");
        assert!(ensure_contained(&missing, &[root.path().to_path_buf()]).is_err());
    }

    #[test]
    fn empty_roots_reject_everything() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("f");
        std::fs::write(&file, "x").unwrap();
        assert!(ensure_contained(&file, &[]).is_err());
    }
}
