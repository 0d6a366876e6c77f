use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("sync path is empty")]
    Empty,
    #[error("sync path contains unsupported component")]
    UnsupportedComponent,
}

pub const ROOT: &str = "/";

/// Maps a sync-relative path ("/Docs/A.txt") under the local sync root.
pub fn to_abs(root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    if rel.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn to_rel(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let rel = PathBuf::from(ROOT).join(relative);
    Some(rel.to_string_lossy().replace('\\', "/"))
}

pub fn parent_path(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some(ROOT),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

pub fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

pub fn join(parent: &str, name: &str) -> String {
    if parent == ROOT {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

pub fn depth(path: &str) -> i64 {
    if path == ROOT {
        0
    } else {
        path.matches('/').count() as i64
    }
}

/// True when `path` equals `ancestor` or lives below it.
pub fn is_within(path: &str, ancestor: &str) -> bool {
    if ancestor == ROOT || path == ancestor {
        return true;
    }
    path.strip_prefix(ancestor)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// "report.txt" -> "report (2).txt"; names without extension get the suffix appended.
pub fn disambiguate(name: &str, n: u32) -> String {
    decorate(name, &n.to_string())
}

pub(crate) fn decorate(name: &str, label: &str) -> String {
    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{stem} ({label}).{ext}");
    }
    format!("{name} ({label})")
}
