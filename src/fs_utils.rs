//! Filesystem helpers shared by the scanner, watcher, worker and validator
//!
//! - `normalize_path`: strips the Windows `\\?\` prefix from canonicalized paths
//! - `relative_key`: workspace-relative, forward-slash path used as the graph's file identity
//! - `hash_file`: streaming SHA-256 of a file's bytes
//! - `file_mtime`: modification time in milliseconds, used by the read-through validator

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};

/// Normalize Windows paths by removing the `\\?\` prefix if present.
///
/// No-op on Unix.
///
/// ```
/// use std::path::PathBuf;
/// use kgraph_engine::fs_utils::normalize_path;
///
/// let path = PathBuf::from("/home/user/repo");
/// assert_eq!(normalize_path(&path), path);
/// ```
pub fn normalize_path(path: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        let s = path.to_string_lossy();
        if let Some(stripped) = s.strip_prefix(r"\\?\UNC\") {
            return PathBuf::from(format!(r"\\{}", stripped));
        }
        if let Some(stripped) = s.strip_prefix(r"\\?\") {
            return PathBuf::from(stripped);
        }
    }
    path.to_path_buf()
}

/// Canonicalize a workspace root, falling back to the given path when it
/// cannot be resolved (e.g. it does not exist yet).
pub fn canonical_root(root: &Path) -> PathBuf {
    root.canonicalize()
        .map(|p| normalize_path(&p))
        .unwrap_or_else(|_| root.to_path_buf())
}

/// Workspace-relative key for a path: forward slashes, no `./`, no `..`.
///
/// Returns `None` when the path lies outside `root`. Relative inputs are
/// taken as already relative to `root`.
///
/// ```
/// use std::path::Path;
/// use kgraph_engine::fs_utils::relative_key;
///
/// let root = Path::new("/repo");
/// assert_eq!(relative_key(root, Path::new("/repo/src/lib.rs")).as_deref(), Some("src/lib.rs"));
/// assert_eq!(relative_key(root, Path::new("./src/../Cargo.toml")).as_deref(), Some("Cargo.toml"));
/// assert_eq!(relative_key(root, Path::new("/elsewhere/a.rs")), None);
/// ```
pub fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = if path.is_absolute() {
        path.strip_prefix(root).ok()?
    } else {
        path
    };

    let mut parts: Vec<String> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Absolute path for a workspace-relative key
pub fn absolute_path(root: &Path, key: &str) -> PathBuf {
    key.split('/').fold(root.to_path_buf(), |acc, part| acc.join(part))
}

/// Streaming SHA-256 of a file, hex-encoded. The file is never read into
/// memory at once.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(64 * 1024, file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex(&hasher.finalize()))
}

/// SHA-256 of an in-memory buffer, hex-encoded
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex(&Sha256::digest(bytes))
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Modification time in milliseconds since the epoch
pub fn file_mtime(path: &Path) -> io::Result<i64> {
    let modified = path.metadata()?.modified()?;
    let millis = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(millis)
}
