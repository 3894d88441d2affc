//! Per-task working scopes and output artifact collection.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use fatman_core::{is_relative_inside, Diagnostic, TaskData, TaskId};
use tempfile::TempDir;
use tracing::{debug, warn};

/// A directory owned by exactly one claim.
///
/// The directory and everything in it is removed when the workspace is
/// dropped, whichever way execution ended.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a fresh, uniquely named directory for `task_id` below `root`.
    pub fn create(root: &Path, task_id: &TaskId) -> io::Result<Self> {
        let prefix = if task_id.is_path_safe() {
            format!("{}-", task_id)
        } else {
            "task-".to_string()
        };
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(root)?;
        debug!(task_id = %task_id, dir = %dir.path().display(), "Created working scope");
        Ok(Self { dir })
    }

    /// Location of the scope.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the scope now, reporting errors instead of ignoring them.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// A file to upload, named relative to the working scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Name under which the server stores the file.
    pub name: String,
    /// Location on disk.
    pub path: PathBuf,
}

/// Collect the files to upload after a run.
///
/// `patterns` are the task's output artifact globs. A pattern matching
/// nothing is recorded as a warning. Non-empty `captured` files (command
/// stdout/stderr) are appended. Each file appears once.
pub fn collect_artifacts(
    dir: &Path,
    patterns: &[String],
    captured: &[PathBuf],
    data: &mut TaskData,
) -> Vec<Artifact> {
    let mut found: BTreeMap<String, PathBuf> = BTreeMap::new();

    for pattern in patterns {
        if !is_relative_inside(pattern) {
            data.warn(Diagnostic::new(
                "output_artifacts",
                pattern.as_str(),
                "pattern must be relative to the task directory",
            ));
            continue;
        }

        let full = format!(
            "{}/{}",
            glob::Pattern::escape(&dir.to_string_lossy()),
            pattern
        );
        let matches: Vec<PathBuf> = match glob::glob(&full) {
            Ok(paths) => paths.filter_map(Result::ok).filter(|p| p.is_file()).collect(),
            Err(e) => {
                data.warn(Diagnostic::new(
                    "output_artifacts",
                    pattern.as_str(),
                    format!("invalid pattern: {}", e),
                ));
                continue;
            }
        };

        if matches.is_empty() {
            warn!(pattern = %pattern, "Output artifact glob returned 0 files");
            data.warn(Diagnostic::new("output_artifacts", pattern.as_str(), "no files found"));
            continue;
        }

        for path in matches {
            if let Some(name) = relative_name(dir, &path) {
                found.entry(name).or_insert(path);
            }
        }
    }

    for path in captured {
        let non_empty = std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false);
        if !non_empty {
            continue;
        }
        if let Some(name) = relative_name(dir, path) {
            found.entry(name).or_insert_with(|| path.clone());
        }
    }

    found
        .into_iter()
        .map(|(name, path)| Artifact { name, path })
        .collect()
}

fn relative_name(dir: &Path, path: &Path) -> Option<String> {
    path.strip_prefix(dir)
        .ok()
        .map(|rel| rel.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
}
