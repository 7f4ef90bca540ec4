//! Source discovery: turns a job's roots and glob patterns into a file list.
//!
//! Patterns are matched case-insensitively against the root-relative path
//! with `/` separators. `*` stays within one directory level and `**` spans
//! any number of them, so `*.txt` only selects files directly under a root.
//!
//! Symbolic links are skipped unless the source asks to follow them. When
//! following, the walker detects links that point back at an ancestor and
//! skips them, so traversal always terminates.

use crate::config::SourceSpec;
use crate::utils::Result;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// A file selected for backup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFile {
    /// Root directory the file was found under
    pub root: PathBuf,

    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the root, always `/`-separated
    pub relative_path: String,
}

/// Compiled include/exclude patterns
#[derive(Debug, Clone)]
pub struct FileMatcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl FileMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: build_glob_set(include)?,
            exclude: build_glob_set(exclude)?,
        })
    }

    /// Whether a file at `relative_path` should be backed up
    pub fn is_selected(&self, relative_path: &str) -> bool {
        self.include.is_match(relative_path) && !self.exclude.is_match(relative_path)
    }

    /// Whether a directory should be pruned from the walk
    pub fn prunes_dir(&self, relative_path: &str) -> bool {
        self.exclude.is_match(relative_path)
    }
}

fn build_glob_set(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let normalized = pattern.trim().replace('\\', "/");
        let normalized = normalized.strip_prefix("./").unwrap_or(&normalized);
        let glob = GlobBuilder::new(normalized)
            .case_insensitive(true)
            .literal_separator(true)
            .build()?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

/// Resolve every root of `source` into the files it selects.
///
/// Blank, missing and non-directory roots are skipped without error.
pub fn discover(source: &SourceSpec) -> Result<Vec<DiscoveredFile>> {
    let matcher = FileMatcher::new(&source.include_patterns(), &source.exclude)?;
    let mut files = Vec::new();

    for root in &source.paths {
        if root.trim().is_empty() {
            continue;
        }
        let root_path = Path::new(root);
        if !root_path.is_dir() {
            debug!(root = %root, "Source root does not exist, skipping");
            continue;
        }
        files.extend(walk_root(root_path, &matcher, source.follow_symlinks));
    }

    Ok(files)
}

/// Walk a single root and collect the files `matcher` selects.
///
/// Unreadable entries, broken links and link cycles are logged and skipped.
pub fn walk_root(root: &Path, matcher: &FileMatcher, follow_links: bool) -> Vec<DiscoveredFile> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .follow_links(follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_pruned(entry, root, matcher));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                if let Some(ancestor) = e.loop_ancestor() {
                    warn!(
                        path = %e.path().map(|p| p.display().to_string()).unwrap_or_default(),
                        ancestor = %ancestor.display(),
                        "Symlink cycle detected, skipping"
                    );
                } else {
                    warn!(root = %root.display(), error = %e, "Skipping unreadable entry");
                }
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            // Only reachable when links are not followed
            debug!(path = %entry.path().display(), "Skipping symbolic link");
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let Some(relative_path) = relative_path(entry.path(), root) else {
            continue;
        };

        if matcher.is_selected(&relative_path) {
            files.push(DiscoveredFile {
                root: root.to_path_buf(),
                path: entry.path().to_path_buf(),
                relative_path,
            });
        }
    }

    files
}

fn is_pruned(entry: &DirEntry, root: &Path, matcher: &FileMatcher) -> bool {
    if entry.depth() == 0 || !entry.file_type().is_dir() {
        return false;
    }
    relative_path(entry.path(), root).is_some_and(|rel| matcher.prunes_dir(&rel))
}

/// `/`-joined path of `path` below `root`
fn relative_path(path: &Path, root: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    (!joined.is_empty()).then_some(joined)
}
