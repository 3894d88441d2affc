//! Checks for file names supplied by the server.

use std::path::{Component, Path, PathBuf};

/// Whether `name` stays inside the directory it is joined to.
pub fn is_relative_inside(name: &str) -> bool {
    !name.is_empty()
        && Path::new(name)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Join `name` to `dir`, or `None` if the result would leave `dir`.
pub fn join_inside(dir: &Path, name: &str) -> Option<PathBuf> {
    is_relative_inside(name).then(|| dir.join(name))
}
