//! Working-copy path validation.
//!
//! Every path the analysis service hands us is untrusted. A path is accepted
//! only if it is relative, stays inside the repository root after lexical
//! normalisation, does not touch `.git`, and does not resolve through a
//! symlink to somewhere outside the root.

use std::path::{Component, Path, PathBuf};

use crate::errors::FixError;

/// Resolve `relative` against `root`, refusing anything that escapes it.
pub fn resolve_in_repo(root: &Path, relative: &str) -> Result<PathBuf, FixError> {
    let outside = || {
        tracing::error!(target: "security", path = relative, root = %root.display(), "refusing path outside repository");
        FixError::PathOutsideRepository {
            path: relative.to_string(),
        }
    };

    if relative.trim().is_empty() || relative.contains('\0') {
        return Err(outside());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(outside());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(outside()),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(outside());
    }
    if normalized
        .components()
        .next()
        .is_some_and(|c| c.as_os_str() == ".git")
    {
        return Err(outside());
    }

    let candidate = root.join(&normalized);

    // Symlinks: the deepest existing ancestor (or the file itself) must still
    // canonicalize to a location under the canonical root.
    let canonical_root = root.canonicalize().map_err(|_| outside())?;
    let mut ancestor = candidate.as_path();
    loop {
        if ancestor.symlink_metadata().is_ok() {
            let resolved = ancestor.canonicalize().map_err(|_| outside())?;
            if !resolved.starts_with(&canonical_root) {
                return Err(outside());
            }
            break;
        }
        match ancestor.parent() {
            Some(parent) => ancestor = parent,
            None => return Err(outside()),
        }
    }

    Ok(candidate)
}
