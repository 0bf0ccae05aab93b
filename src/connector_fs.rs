//! Document Source Filter: walks a project's source tree.
//!
//! [`SourceFilter::documents`] returns a lazy iterator over the tree in
//! file-name order. Each call starts a fresh walk, so the sequence can be
//! restarted at will. Entries are dropped when they match any exclusion
//! rule:
//!
//! - hidden entries (name starts with `.`) when `exclude_hidden` is set;
//! - `exclude_globs` (globset, matched against the relative path);
//! - `exclude_regex` (matched against the relative path);
//! - the root `.gitignore` followed by `ignore_patterns`, with gitignore
//!   semantics: later lines override earlier ones and `!` re-includes;
//! - files whose extension is in `exclude_extensions`;
//! - files larger than `max_file_bytes`.
//!
//! Excluded directories are pruned, not descended into.
//!
//! A root that does not exist, or an empty directory, yields nothing.
//! Genuine I/O failures (permission denied, a file that cannot be read)
//! surface as [`StratusError::Load`]. Files that are not valid UTF-8 are
//! reported as [`SourceEntry::Skipped`] so callers can keep their
//! previously indexed records.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use stratus_core::models::SourceDocument;
use stratus_core::{StratusError, StratusResult};

use crate::config::SourcesConfig;

/// One item of a walk.
#[derive(Debug)]
pub enum SourceEntry {
    Document(SourceDocument),
    /// A file that exists but could not be turned into a document.
    Skipped { relative_path: String, reason: String },
}

/// A materialized walk.
#[derive(Debug, Default)]
pub struct SourceScan {
    pub documents: Vec<SourceDocument>,
    /// `(relative_path, reason)` of files that were found but not read.
    pub skipped: Vec<(String, String)>,
}

impl SourceScan {
    /// Relative paths of skipped files.
    pub fn skipped_paths(&self) -> HashSet<String> {
        self.skipped.iter().map(|(p, _)| p.clone()).collect()
    }
}

pub struct SourceFilter {
    root: PathBuf,
    extensions: HashSet<String>,
    exclude_hidden: bool,
    globs: GlobSet,
    regexes: Vec<Regex>,
    gitignore: Gitignore,
    follow_symlinks: bool,
    max_file_bytes: Option<u64>,
}

impl SourceFilter {
    pub fn new(root: &Path, config: &SourcesConfig) -> Result<Self> {
        let extensions = config
            .exclude_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        let globs = build_globset(&config.exclude_globs)?;

        let regexes = config
            .exclude_regex
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("invalid exclude regex '{}'", p)))
            .collect::<Result<Vec<_>>>()?;

        let mut builder = GitignoreBuilder::new(root);
        let gitignore_file = root.join(".gitignore");
        if config.respect_gitignore && gitignore_file.is_file() {
            if let Some(err) = builder.add(&gitignore_file) {
                warn!(path = %gitignore_file.display(), error = %err, "partially invalid .gitignore");
            }
        }
        for line in &config.ignore_patterns {
            builder
                .add_line(None, line)
                .with_context(|| format!("invalid ignore pattern '{}'", line))?;
        }
        let gitignore = builder.build().context("building ignore matcher")?;

        Ok(Self {
            root: root.to_path_buf(),
            extensions,
            exclude_hidden: config.exclude_hidden,
            globs,
            regexes,
            gitignore,
            follow_symlinks: config.follow_symlinks,
            max_file_bytes: config.max_file_bytes,
        })
    }

    /// Whether a path (relative, `/`-separated) is excluded.
    pub fn is_excluded(&self, relative_path: &str, is_dir: bool) -> bool {
        let name = relative_path.rsplit('/').next().unwrap_or(relative_path);
        if self.exclude_hidden && name.starts_with('.') {
            return true;
        }
        if self.globs.is_match(relative_path) {
            return true;
        }
        // Directory globs such as `**/target/**` only match paths below the
        // directory; test a child path so the directory itself is pruned.
        if is_dir && self.globs.is_match(format!("{relative_path}/_")) {
            return true;
        }
        if self.regexes.iter().any(|r| r.is_match(relative_path)) {
            return true;
        }
        if self.gitignore.matched(relative_path, is_dir).is_ignore() {
            return true;
        }
        if !is_dir {
            if let Some((_, ext)) = name.rsplit_once('.') {
                if self.extensions.contains(&ext.to_lowercase()) {
                    return true;
                }
            }
        }
        false
    }

    /// Start a new lazy walk.
    pub fn documents(&self) -> Documents<'_> {
        let walker = if self.root.is_dir() {
            Some(
                WalkDir::new(&self.root)
                    .follow_links(self.follow_symlinks)
                    .sort_by_file_name()
                    .into_iter(),
            )
        } else {
            if self.root.exists() {
                warn!(root = %self.root.display(), "project root is not a directory");
            }
            None
        };
        Documents {
            filter: self,
            walker,
        }
    }

    /// Walk the whole tree.
    pub fn scan(&self) -> StratusResult<SourceScan> {
        let mut scan = SourceScan::default();
        for entry in self.documents() {
            match entry? {
                SourceEntry::Document(doc) => scan.documents.push(doc),
                SourceEntry::Skipped {
                    relative_path,
                    reason,
                } => scan.skipped.push((relative_path, reason)),
            }
        }
        debug!(
            root = %self.root.display(),
            documents = scan.documents.len(),
            skipped = scan.skipped.len(),
            "source scan complete"
        );
        Ok(scan)
    }

    fn load(&self, path: &Path, relative_path: String) -> StratusResult<Option<SourceEntry>> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StratusError::Load {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if let Some(limit) = self.max_file_bytes {
            if metadata.len() > limit {
                return Ok(Some(SourceEntry::Skipped {
                    relative_path,
                    reason: format!("larger than {limit} bytes"),
                }));
            }
        }

        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StratusError::Load {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let body = match String::from_utf8(bytes) {
            Ok(body) => body,
            Err(_) => {
                return Ok(Some(SourceEntry::Skipped {
                    relative_path,
                    reason: "not valid UTF-8".to_string(),
                }))
            }
        };

        let modified_at = metadata.modified().ok().map(DateTime::<Utc>::from);
        Ok(Some(SourceEntry::Document(SourceDocument::new(
            path.to_path_buf(),
            relative_path,
            body,
            modified_at,
        ))))
    }
}

/// Lazy iterator returned by [`SourceFilter::documents`].
pub struct Documents<'a> {
    filter: &'a SourceFilter,
    walker: Option<walkdir::IntoIter>,
}

impl Iterator for Documents<'_> {
    type Item = StratusResult<SourceEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let walker = self.walker.as_mut()?;
            let entry = match walker.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    let path = err
                        .path()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| self.filter.root.clone());
                    let source: io::Error = err.into();
                    if source.kind() == io::ErrorKind::NotFound {
                        continue;
                    }
                    self.walker = None;
                    return Some(Err(StratusError::Load { path, source }));
                }
            };

            if entry.depth() == 0 {
                continue;
            }

            let relative_path = relative_slash_path(&self.filter.root, entry.path());
            let is_dir = entry.file_type().is_dir();

            if self.filter.is_excluded(&relative_path, is_dir) {
                debug!(path = %relative_path, "excluded");
                if is_dir {
                    walker.skip_current_dir();
                }
                continue;
            }

            if !entry.file_type().is_file() {
                continue;
            }

            match self.filter.load(entry.path(), relative_path) {
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => continue,
                Err(e) => {
                    self.walker = None;
                    return Some(Err(e));
                }
            }
        }
    }
}

fn relative_slash_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob '{}'", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn rel_paths(scan: &SourceScan) -> Vec<String> {
        scan.documents
            .iter()
            .map(|d| d.relative_path.clone())
            .collect()
    }

    #[test]
    fn test_gitignore_excludes_logs() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), ".gitignore", b"*.log\n");
        write(tmp.path(), "a.log", b"noise");
        write(tmp.path(), "b.txt", b"signal");

        let filter = SourceFilter::new(tmp.path(), &SourcesConfig::default()).unwrap();
        let scan = filter.scan().unwrap();
        assert_eq!(rel_paths(&scan), vec!["b.txt"]);
    }

    #[test]
    fn test_negation_and_later_patterns_override() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "keep.log", b"k");
        write(tmp.path(), "drop.log", b"d");
        write(tmp.path(), "notes.md", b"n");

        let config = SourcesConfig {
            ignore_patterns: vec!["*.log".into(), "!keep.log".into()],
            ..SourcesConfig::default()
        };
        let filter = SourceFilter::new(tmp.path(), &config).unwrap();
        let scan = filter.scan().unwrap();
        assert_eq!(rel_paths(&scan), vec!["keep.log", "notes.md"]);
    }

    #[test]
    fn test_extensions_hidden_and_default_globs() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "src/lib.rs", b"fn a() {}");
        write(tmp.path(), "logo.png", b"png");
        write(tmp.path(), "package.JSON", b"{}");
        write(tmp.path(), ".env", b"SECRET=1");
        write(tmp.path(), ".hidden/inner.md", b"x");
        write(tmp.path(), "node_modules/dep/index.md", b"x");
        write(tmp.path(), "target/debug/out.txt", b"x");

        let filter = SourceFilter::new(tmp.path(), &SourcesConfig::default()).unwrap();
        let scan = filter.scan().unwrap();
        assert_eq!(rel_paths(&scan), vec!["src/lib.rs"]);
    }

    #[test]
    fn test_regex_and_size_limits() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "docs/a.md", b"a");
        write(tmp.path(), "fixtures/big.txt", &[b'x'; 2048]);
        write(tmp.path(), "vendor/lib.rs", b"x");

        let config = SourcesConfig {
            exclude_regex: vec!["^vendor/".into()],
            max_file_bytes: Some(1024),
            ..SourcesConfig::default()
        };
        let filter = SourceFilter::new(tmp.path(), &config).unwrap();
        let scan = filter.scan().unwrap();
        assert_eq!(rel_paths(&scan), vec!["docs/a.md"]);
        assert_eq!(scan.skipped.len(), 1);
        assert_eq!(scan.skipped[0].0, "fixtures/big.txt");
    }

    #[test]
    fn test_missing_and_empty_roots_yield_nothing() {
        let tmp = TempDir::new().unwrap();
        let filter = SourceFilter::new(tmp.path(), &SourcesConfig::default()).unwrap();
        assert!(filter.scan().unwrap().documents.is_empty());

        let missing = tmp.path().join("nope");
        let filter = SourceFilter::new(&missing, &SourcesConfig::default()).unwrap();
        assert!(filter.scan().unwrap().documents.is_empty());
    }

    #[test]
    fn test_non_utf8_is_skipped() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "blob.bin", &[0xff, 0xfe, 0x00, 0x80]);
        write(tmp.path(), "ok.txt", b"fine");

        let filter = SourceFilter::new(tmp.path(), &SourcesConfig::default()).unwrap();
        let scan = filter.scan().unwrap();
        assert_eq!(rel_paths(&scan), vec!["ok.txt"]);
        assert_eq!(scan.skipped_paths(), HashSet::from(["blob.bin".to_string()]));
    }

    #[test]
    fn test_documents_carry_header_and_walk_restarts() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a/b.md", b"body");

        let filter = SourceFilter::new(tmp.path(), &SourcesConfig::default()).unwrap();
        let first: Vec<_> = filter.documents().collect::<Result<_, _>>().unwrap();
        let second: Vec<_> = filter.documents().collect::<Result<_, _>>().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        match &first[0] {
            SourceEntry::Document(doc) => {
                assert_eq!(doc.relative_path, "a/b.md");
                assert!(doc.content().starts_with("File: b.md\nPath: a/b.md\n\n"));
            }
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_load_error() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "secret.txt", b"x");
        let path = tmp.path().join("secret.txt");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();

        // Root can read anything; the check is meaningless there.
        if fs::read(&path).is_ok() {
            return;
        }
        let filter = SourceFilter::new(tmp.path(), &SourcesConfig::default()).unwrap();
        let err = filter.scan().unwrap_err();
        assert!(matches!(err, StratusError::Load { .. }));
    }
}
