//! Codebase file scanner.
//!
//! Walks the root directory, applies the composite ignore matcher, reads
//! file contents, and computes a sha256 content hash per file. Repeated
//! scans are diffed against the known record table to produce added /
//! changed / removed streams; unchanged files are skipped without
//! re-tokenization.
//!
//! # Ignore rules
//!
//! The walk honors `.gitignore` chains (via the `ignore` crate) plus these
//! built-in rules:
//! - VCS metadata: `.git`, `.hg`, `.svn`
//! - dependency/build output: `node_modules`, `target`, `dist`, `build`,
//!   `__pycache__`, `.venv`, `venv`
//! - the engine's own `.codebase-search` directory
//! - a binary extension list, and a null-byte sniff for everything else
//! - files larger than the configured `max_file_size`
//! - any extra globs from `ignore_extra`
//!
//! Per-file read errors are logged and the file skipped; they never abort
//! the scan.

use std::{
  collections::{HashMap, HashSet},
  path::{Path, PathBuf},
};

use ignore::{
  WalkBuilder,
  gitignore::{Gitignore, GitignoreBuilder},
  overrides::OverrideBuilder,
};
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::{
  config::EngineConfig,
  domain::{Language, content_preview},
};

/// Directories never descended into, regardless of gitignore contents.
const SKIP_DIRS: &[&str] = &[
  ".git",
  ".hg",
  ".svn",
  "node_modules",
  "target",
  "dist",
  "build",
  "__pycache__",
  ".venv",
  "venv",
  ".codebase-search",
];

/// Extensions treated as binary without reading the file.
const BINARY_EXTENSIONS: &[&str] = &[
  "png", "jpg", "jpeg", "gif", "ico", "bmp", "webp", "pdf", "zip", "tar", "gz", "bz2", "xz", "7z", "exe", "dll",
  "so", "dylib", "a", "o", "class", "jar", "war", "bin", "dat", "db", "sqlite", "wasm", "woff", "woff2", "ttf",
  "otf", "eot", "mp3", "mp4", "avi", "mov", "webm", "lock",
];

// ============================================================================
// Scanned Files
// ============================================================================

/// One readable, index-eligible file produced by a scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
  /// Path relative to the codebase root, `/`-separated.
  pub path: String,
  pub abs_path: PathBuf,
  pub size: u64,
  /// Hex sha256 of the raw bytes.
  pub hash: String,
  pub language: Option<Language>,
  /// Full decoded content.
  pub content: String,
}

impl ScannedFile {
  pub fn preview(&self) -> String {
    content_preview(&self.content)
  }
}

/// Result of diffing a scan against the known record table.
#[derive(Debug, Default)]
pub struct ScanDiff {
  /// Files not present in the record table.
  pub added: Vec<ScannedFile>,
  /// Files whose content hash differs from the recorded one.
  pub changed: Vec<ScannedFile>,
  /// Recorded paths that no longer exist on disk.
  pub removed: Vec<String>,
  /// Count of files whose hash matched (skipped).
  pub unchanged: usize,
}

impl ScanDiff {
  pub fn is_empty(&self) -> bool {
    self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
  }

  /// Number of files the pipeline has to touch.
  pub fn change_count(&self) -> usize {
    self.added.len() + self.changed.len() + self.removed.len()
  }
}

// ============================================================================
// Scanner
// ============================================================================

/// Walks the codebase root and yields hashable file records.
#[derive(Clone)]
pub struct Scanner {
  root: PathBuf,
  max_file_size: u64,
  ignore_extra: Vec<String>,
}

impl Scanner {
  pub fn new(config: &EngineConfig) -> Self {
    Self {
      root: config.codebase_root.clone(),
      max_file_size: config.max_file_size,
      ignore_extra: config.ignore_extra.clone(),
    }
  }

  /// Walk the root and read every index-eligible file.
  ///
  /// Output is sorted by relative path so repeated scans of the same tree
  /// are deterministic.
  pub fn scan(&self) -> Vec<ScannedFile> {
    let candidates = self.collect_candidates();

    let mut files: Vec<ScannedFile> = candidates
      .par_iter()
      .filter_map(|abs_path| match self.read_file(abs_path) {
        Ok(file) => file,
        Err(e) => {
          warn!(path = %abs_path.display(), error = %e, "Skipping unreadable file");
          None
        }
      })
      .collect();

    files.sort_by(|a, b| a.path.cmp(&b.path));
    debug!(root = %self.root.display(), files = files.len(), "Scan complete");
    files
  }

  /// Scan and diff against the known `path → hash` table.
  ///
  /// A recorded path the walk no longer yields counts as removed — whether
  /// the file vanished, became ignored, or crossed the size cap.
  pub fn diff(&self, known: &HashMap<String, String>) -> ScanDiff {
    let scanned = self.scan();
    let mut seen: HashSet<String> = HashSet::with_capacity(scanned.len());
    let mut diff = ScanDiff::default();

    for file in scanned {
      seen.insert(file.path.clone());
      match known.get(&file.path) {
        None => diff.added.push(file),
        Some(hash) if *hash != file.hash => diff.changed.push(file),
        Some(_) => diff.unchanged += 1,
      }
    }

    for path in known.keys() {
      if !seen.contains(path) {
        diff.removed.push(path.clone());
      }
    }
    diff.removed.sort();

    diff
  }

  /// Read a single file by relative path, applying the same eligibility
  /// rules as a full scan. Returns `Ok(None)` when the file is ignored,
  /// binary, or oversized.
  pub fn scan_one(&self, relative: &str) -> std::io::Result<Option<ScannedFile>> {
    let abs_path = self.root.join(relative);
    if !abs_path.is_file() || self.matcher().matched(&abs_path, false).is_ignore() {
      return Ok(None);
    }
    self.read_file(&abs_path)
  }

  /// Build the composite ignore matcher used by the file watcher.
  ///
  /// Combines the root `.gitignore`, the built-in skip rules, and the
  /// configured extra globs.
  pub fn matcher(&self) -> Gitignore {
    let mut builder = GitignoreBuilder::new(&self.root);
    let gitignore_path = self.root.join(".gitignore");
    if gitignore_path.exists()
      && let Some(err) = builder.add(&gitignore_path)
    {
      warn!(error = %err, "Error parsing .gitignore, continuing with partial rules");
    }
    for dir in SKIP_DIRS {
      let _ = builder.add_line(None, &format!("{dir}/"));
    }
    for glob in &self.ignore_extra {
      if let Err(err) = builder.add_line(None, glob) {
        warn!(glob = %glob, error = %err, "Invalid extra ignore glob");
      }
    }
    builder.build().unwrap_or_else(|_| Gitignore::empty())
  }

  // ==========================================================================
  // Internals
  // ==========================================================================

  /// Walk the tree and collect paths that pass the directory/extension
  /// filters. Size and binary-content checks happen at read time.
  fn collect_candidates(&self) -> Vec<PathBuf> {
    let mut walker = WalkBuilder::new(&self.root);
    // .gitignore chains apply whether or not the root is a git repository.
    walker.hidden(true).follow_links(false).require_git(false);

    if !self.ignore_extra.is_empty() {
      let mut overrides = OverrideBuilder::new(&self.root);
      for glob in &self.ignore_extra {
        // Overrides whitelist by default; `!` inverts to an ignore rule.
        if let Err(err) = overrides.add(&format!("!{glob}")) {
          warn!(glob = %glob, error = %err, "Invalid extra ignore glob");
        }
      }
      if let Ok(ov) = overrides.build() {
        walker.overrides(ov);
      }
    }

    walker.filter_entry(|entry| {
      let name = entry.file_name().to_string_lossy();
      if entry.file_type().is_some_and(|ft| ft.is_dir()) {
        return !SKIP_DIRS.contains(&name.as_ref());
      }
      true
    });

    let mut candidates = Vec::new();
    for entry in walker.build() {
      let entry = match entry {
        Ok(e) => e,
        Err(e) => {
          warn!(error = %e, "Walk error, skipping entry");
          continue;
        }
      };
      if !entry.file_type().is_some_and(|ft| ft.is_file()) {
        continue;
      }
      let path = entry.path();
      if has_binary_extension(path) {
        continue;
      }
      candidates.push(path.to_path_buf());
    }
    candidates
  }

  /// Read, sniff, and hash a single file.
  fn read_file(&self, abs_path: &Path) -> std::io::Result<Option<ScannedFile>> {
    let metadata = std::fs::metadata(abs_path)?;
    if metadata.len() > self.max_file_size {
      debug!(path = %abs_path.display(), size = metadata.len(), "File exceeds max size, skipping");
      return Ok(None);
    }

    let bytes = std::fs::read(abs_path)?;
    if looks_binary(&bytes) {
      return Ok(None);
    }

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let hash = hex::encode(hasher.finalize());

    let relative = abs_path
      .strip_prefix(&self.root)
      .unwrap_or(abs_path)
      .to_string_lossy()
      .replace('\\', "/");

    let language = abs_path
      .extension()
      .and_then(|e| e.to_str())
      .and_then(Language::from_extension);

    Ok(Some(ScannedFile {
      path: relative,
      abs_path: abs_path.to_path_buf(),
      size: metadata.len(),
      hash,
      language,
      content: String::from_utf8_lossy(&bytes).into_owned(),
    }))
  }

}

fn has_binary_extension(path: &Path) -> bool {
  path
    .extension()
    .and_then(|e| e.to_str())
    .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Null-byte sniff over the first 8 KiB.
fn looks_binary(bytes: &[u8]) -> bool {
  let window = &bytes[..bytes.len().min(8192)];
  window.contains(&0)
}
