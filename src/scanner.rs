//! Workspace scanner
//!
//! Walks each configured include directory, applies the exclude rules, skips
//! files above the size ceiling and hashes the rest with a streaming SHA-256.
//! A single file's hash failure is logged and skipped, never fatal.
//!
//! The same [`ExcludeMatcher`] is used by the watcher so both sides agree on
//! what belongs to the graph.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use rayon::prelude::*;
use serde::Serialize;

use crate::config::{ExcludeRules, SyncConfig};
use crate::error::{KgError, Result};
use crate::fs_utils::{absolute_path, file_mtime, hash_file, relative_key};

/// Compiled exclude rules
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    dirs: HashSet<String>,
    files: HashSet<String>,
    extensions: HashSet<String>,
    patterns: GlobSet,
}

impl ExcludeMatcher {
    pub fn new(rules: &ExcludeRules) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &rules.patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                KgError::config(format!("invalid exclude pattern '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let patterns = builder
            .build()
            .map_err(|e| KgError::config(format!("invalid exclude patterns: {}", e)))?;

        Ok(Self {
            dirs: rules.dirs.iter().cloned().collect(),
            files: rules.files.iter().cloned().collect(),
            extensions: rules
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            patterns,
        })
    }

    /// Whether a directory name is excluded wherever it appears
    pub fn excludes_dir_name(&self, name: &str) -> bool {
        self.dirs.contains(name)
    }

    /// Whether a workspace-relative file path is excluded.
    ///
    /// Any excluded directory component excludes the path.
    pub fn is_excluded(&self, rel_path: &str) -> bool {
        let mut components: Vec<&str> = rel_path.split('/').collect();
        let file_name = match components.pop() {
            Some(name) if !name.is_empty() => name,
            _ => return true,
        };

        if components.iter().any(|c| self.dirs.contains(*c)) {
            return true;
        }
        if self.files.contains(file_name) {
            return true;
        }
        if let Some((_, ext)) = file_name.rsplit_once('.') {
            if self.extensions.contains(&ext.to_ascii_lowercase()) {
                return true;
            }
        }
        self.patterns.is_match(file_name)
    }

    /// Directory variant: every component (including the last) is checked
    /// against the excluded directory names.
    pub fn is_excluded_dir(&self, rel_dir: &str) -> bool {
        rel_dir.split('/').any(|c| self.dirs.contains(c))
    }
}

/// One hashed file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScannedFile {
    /// Workspace-relative path
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub mtime: i64,
}

/// Result of a scan
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub files: Vec<ScannedFile>,
    pub skipped_too_large: usize,
    pub failed: usize,
}

pub struct Scanner {
    root: PathBuf,
    include_dirs: Vec<String>,
    max_file_size: u64,
    matcher: ExcludeMatcher,
}

impl Scanner {
    pub fn new(root: &Path, config: &SyncConfig) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            include_dirs: config.include_dirs.clone(),
            max_file_size: config.max_file_size,
            matcher: ExcludeMatcher::new(&config.exclude)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn matcher(&self) -> &ExcludeMatcher {
        &self.matcher
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Absolute include directories
    pub fn include_paths(&self) -> Vec<PathBuf> {
        self.include_dirs
            .iter()
            .map(|d| match d.trim_matches('/') {
                "" | "." => self.root.clone(),
                rel => absolute_path(&self.root, rel),
            })
            .collect()
    }

    /// Whether a workspace-relative path is under an include directory and
    /// not excluded
    pub fn accepts(&self, rel_path: &str) -> bool {
        let included = self.include_dirs.iter().any(|d| {
            let d = d.trim_matches('/');
            d.is_empty() || d == "." || rel_path == d || rel_path.starts_with(&format!("{}/", d))
        });
        included && !self.matcher.is_excluded(rel_path)
    }

    /// Directory variant of [`accepts`](Self::accepts)
    pub fn accepts_dir(&self, rel_dir: &str) -> bool {
        let included = self.include_dirs.iter().any(|d| {
            let d = d.trim_matches('/');
            d.is_empty()
                || d == "."
                || rel_dir == d
                || rel_dir.starts_with(&format!("{}/", d))
                || d.starts_with(&format!("{}/", rel_dir))
        });
        included && !self.matcher.is_excluded_dir(rel_dir)
    }

    /// Scan every include directory
    pub fn scan(&self) -> ScanReport {
        let dirs = self.include_paths();
        self.scan_paths(&dirs)
    }

    /// Scan one workspace-relative directory (used when a directory appears)
    pub fn scan_dir(&self, rel_dir: &str) -> ScanReport {
        if self.matcher.is_excluded_dir(rel_dir) {
            return ScanReport::default();
        }
        self.scan_paths(&[absolute_path(&self.root, rel_dir)])
    }

    fn scan_paths(&self, dirs: &[PathBuf]) -> ScanReport {
        let mut candidates: BTreeMap<String, (PathBuf, u64)> = BTreeMap::new();
        let mut skipped_too_large = 0;

        for dir in dirs {
            if !dir.is_dir() {
                tracing::debug!("[SCAN] include directory missing: {}", dir.display());
                continue;
            }
            for (rel, abs, size) in self.list_files(dir) {
                if size > self.max_file_size {
                    skipped_too_large += 1;
                    continue;
                }
                candidates.insert(rel, (abs, size));
            }
        }

        let hashed: Vec<Option<ScannedFile>> = candidates
            .into_par_iter()
            .map(|(rel, (abs, size))| match hash_file(&abs) {
                Ok(content_hash) => Some(ScannedFile {
                    path: rel,
                    content_hash,
                    size,
                    mtime: file_mtime(&abs).unwrap_or(0),
                }),
                Err(e) => {
                    tracing::warn!("[SCAN] failed to hash {}: {}", rel, e);
                    None
                }
            })
            .collect();

        let failed = hashed.iter().filter(|f| f.is_none()).count();
        let files: Vec<ScannedFile> = hashed.into_iter().flatten().collect();

        tracing::debug!(
            "[SCAN] {} files hashed, {} too large, {} failed",
            files.len(),
            skipped_too_large,
            failed
        );

        ScanReport {
            files,
            skipped_too_large,
            failed,
        }
    }

    /// List `(relative, absolute, size)` for accepted files under `dir`
    fn list_files(&self, dir: &Path) -> Vec<(String, PathBuf, u64)> {
        let matcher = self.matcher.clone();
        let walker = WalkBuilder::new(dir)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                !(is_dir
                    && entry.depth() > 0
                    && matcher.excludes_dir_name(&entry.file_name().to_string_lossy()))
            })
            .build();

        let mut out = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("[SCAN] walk error under {}: {}", dir.display(), e);
                    continue;
                }
            };
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let Some(rel) = relative_key(&self.root, entry.path()) else {
                continue;
            };
            if self.matcher.is_excluded(&rel) {
                continue;
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            out.push((rel, entry.into_path(), size));
        }
        out
    }
}

/// Convenience: scan a workspace with the given sync settings
pub fn scan(root: &Path, config: &SyncConfig) -> Result<Vec<ScannedFile>> {
    Ok(Scanner::new(root, config)?.scan().files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_matcher_rules() {
        let matcher = ExcludeMatcher::new(&ExcludeRules::default()).unwrap();
        assert!(matcher.is_excluded("target/debug/foo.rs"));
        assert!(matcher.is_excluded("web/node_modules/x/index.js"));
        assert!(matcher.is_excluded("Cargo.lock"));
        assert!(matcher.is_excluded("assets/logo.PNG"));
        assert!(matcher.is_excluded("web/app.min.js"));
        assert!(!matcher.is_excluded("src/lib.rs"));
        assert!(!matcher.is_excluded("docs/specs/sync.md"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let rules = ExcludeRules {
            patterns: vec!["[".into()],
            ..ExcludeRules::default()
        };
        assert!(matches!(
            ExcludeMatcher::new(&rules),
            Err(KgError::Config { .. })
        ));
    }

    #[test]
    fn test_scan_applies_excludes_and_size_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "src/lib.rs", "pub fn a() {}");
        write(root, "target/out.rs", "ignored");
        write(root, ".git/HEAD", "ref");
        write(root, "big.txt", &"x".repeat(64));

        let config = SyncConfig {
            max_file_size: 32,
            ..SyncConfig::default()
        };
        let report = Scanner::new(root, &config).unwrap().scan();

        let paths: Vec<&str> = report.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.rs"]);
        assert_eq!(report.skipped_too_large, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.files[0].content_hash.len(), 64);
    }

    #[test]
    fn test_overlapping_includes_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "src/a.rs", "a");

        let config = SyncConfig {
            include_dirs: vec![".".into(), "src".into(), "missing".into()],
            ..SyncConfig::default()
        };
        let files = scan(dir.path(), &config).unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_accepts_respects_include_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let config = SyncConfig {
            include_dirs: vec!["src".into()],
            ..SyncConfig::default()
        };
        let scanner = Scanner::new(dir.path(), &config).unwrap();
        assert!(scanner.accepts("src/a.rs"));
        assert!(!scanner.accepts("srcx/a.rs"));
        assert!(!scanner.accepts("src/target/a.rs"));
    }
}
