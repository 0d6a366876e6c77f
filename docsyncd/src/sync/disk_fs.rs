use std::{
    fs::Metadata,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use bytes::Bytes;
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;

use super::fingerprint::{DigestAlgorithm, Hasher};
use super::local_fs::{EventSink, LocalEntry, LocalFs, LocalFsError, LocalWatch, TAG_ATTRIBUTE};
use super::local_watcher::start_notify_watcher;
use super::paths;
use super::store::ItemKind;

const READ_CHUNK: usize = 64 * 1024;

/// [`LocalFs`] backed by a directory on disk. Identity tags live in an
/// extended attribute so they follow the object across renames.
#[derive(Debug, Clone)]
pub struct DiskFs {
    root: PathBuf,
    algorithm: DigestAlgorithm,
    use_trash: bool,
}

impl DiskFs {
    pub fn new(root: impl Into<PathBuf>, algorithm: DigestAlgorithm, use_trash: bool) -> Self {
        Self {
            root: root.into(),
            algorithm,
            use_trash,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn abs(&self, rel: &str) -> Result<PathBuf, LocalFsError> {
        Ok(paths::to_abs(&self.root, rel)?)
    }

    async fn entry_for(
        &self,
        rel: &str,
        abs: &Path,
        meta: &Metadata,
    ) -> Result<LocalEntry, LocalFsError> {
        let kind = if meta.is_dir() {
            ItemKind::Folder
        } else {
            ItemKind::File
        };
        let fingerprint = match kind {
            ItemKind::File => Some(self.fingerprint(rel, abs).await?),
            ItemKind::Folder => None,
        };
        Ok(LocalEntry {
            path: rel.to_string(),
            kind,
            fingerprint,
            mtime: meta.modified().ok().map(|t| {
                (OffsetDateTime::from(t).unix_timestamp_nanos() / 1_000_000) as i64
            }),
            size: if meta.is_dir() { 0 } else { meta.len() },
            tag: read_xattr(rel, abs.to_path_buf()).await?,
            file_id: file_id(meta),
        })
    }

    async fn fingerprint(&self, rel: &str, abs: &Path) -> Result<String, LocalFsError> {
        let mut file = tokio::fs::File::open(abs)
            .await
            .map_err(|err| LocalFsError::io(rel, err))?;
        let mut hasher = Hasher::new(self.algorithm);
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|err| LocalFsError::io(rel, err))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finish())
    }
}

#[async_trait]
impl LocalFs for DiskFs {
    async fn list(&self, path: &str) -> Result<Vec<LocalEntry>, LocalFsError> {
        let abs = self.abs(path)?;
        let mut dir = tokio::fs::read_dir(&abs)
            .await
            .map_err(|err| LocalFsError::io(path, err))?;
        let mut names = Vec::new();
        while let Some(child) = dir
            .next_entry()
            .await
            .map_err(|err| LocalFsError::io(path, err))?
        {
            match child.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => tracing::warn!(folder = path, name = ?raw, "skipping non UTF-8 name"),
            }
        }
        names.sort();

        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            // Children may vanish between listing and stat.
            if let Some(entry) = self.stat(&paths::join(path, &name)).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<LocalEntry>, LocalFsError> {
        let abs = self.abs(path)?;
        let meta = match tokio::fs::symlink_metadata(&abs).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(LocalFsError::io(path, err)),
        };
        if meta.file_type().is_symlink() {
            return Ok(None);
        }
        match self.entry_for(path, &abs, &meta).await {
            Ok(entry) => Ok(Some(entry)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn read_tag(&self, path: &str) -> Result<Option<String>, LocalFsError> {
        let abs = self.abs(path)?;
        if !tokio::fs::try_exists(&abs)
            .await
            .map_err(|err| LocalFsError::io(path, err))?
        {
            return Ok(None);
        }
        read_xattr(path, abs).await
    }

    async fn write_tag(&self, path: &str, tag: &str) -> Result<(), LocalFsError> {
        let abs = self.abs(path)?;
        write_xattr(abs, tag.to_string())
            .await
            .map_err(|err| LocalFsError::io(path, err))
    }

    async fn create_folder(&self, path: &str) -> Result<LocalEntry, LocalFsError> {
        let abs = self.abs(path)?;
        match tokio::fs::create_dir(&abs).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists && abs.is_dir() => {}
            Err(err) => return Err(LocalFsError::io(path, err)),
        }
        self.stat(path)
            .await?
            .ok_or_else(|| LocalFsError::NotFound(path.to_string()))
    }

    async fn write_file(
        &self,
        path: &str,
        content: Bytes,
        tag: Option<&str>,
    ) -> Result<LocalEntry, LocalFsError> {
        let abs = self.abs(path)?;
        let partial = partial_path(&abs);
        tokio::fs::write(&partial, &content)
            .await
            .map_err(|err| LocalFsError::io(path, err))?;
        if let Some(tag) = tag
            && let Err(err) = write_xattr(partial.clone(), tag.to_string()).await
        {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(LocalFsError::io(path, err));
        }
        if let Err(err) = tokio::fs::rename(&partial, &abs).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(LocalFsError::io(path, err));
        }
        self.stat(path)
            .await?
            .ok_or_else(|| LocalFsError::NotFound(path.to_string()))
    }

    async fn read_file(&self, path: &str) -> Result<Bytes, LocalFsError> {
        let abs = self.abs(path)?;
        let content = tokio::fs::read(&abs)
            .await
            .map_err(|err| LocalFsError::io(path, err))?;
        Ok(Bytes::from(content))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<LocalEntry, LocalFsError> {
        let src = self.abs(from)?;
        let dst = self.abs(to)?;
        if tokio::fs::try_exists(&dst)
            .await
            .map_err(|err| LocalFsError::io(to, err))?
        {
            return Err(LocalFsError::AlreadyExists(to.to_string()));
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|err| LocalFsError::io(from, err))?;
        self.stat(to)
            .await?
            .ok_or_else(|| LocalFsError::NotFound(to.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<(), LocalFsError> {
        let abs = self.abs(path)?;
        let meta = match tokio::fs::symlink_metadata(&abs).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(LocalFsError::io(path, err)),
        };
        if self.use_trash {
            let target = abs.clone();
            let trashed = tokio::task::spawn_blocking(move || trash::delete(&target)).await?;
            match trashed {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(path, error = %err, "moving to trash failed, deleting instead");
                }
            }
        }
        let result = if meta.is_dir() {
            tokio::fs::remove_dir_all(&abs).await
        } else {
            tokio::fs::remove_file(&abs).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LocalFsError::io(path, err)),
        }
    }

    async fn watch(&self) -> Result<LocalWatch, LocalFsError> {
        let (sink, events, backlog) = EventSink::channel();
        let watcher = start_notify_watcher(&self.root, sink)?;
        Ok(LocalWatch {
            events,
            backlog,
            guard: Box::new(watcher),
        })
    }
}

fn partial_path(abs: &Path) -> PathBuf {
    let name = abs
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    abs.with_file_name(format!(".{name}.{}.part", uuid::Uuid::new_v4().simple()))
}

async fn read_xattr(rel: &str, abs: PathBuf) -> Result<Option<String>, LocalFsError> {
    let value = tokio::task::spawn_blocking(move || xattr::get(&abs, TAG_ATTRIBUTE)).await?;
    match value {
        Ok(Some(bytes)) => Ok(String::from_utf8(bytes).ok().filter(|t| !t.is_empty())),
        Ok(None) => Ok(None),
        // Filesystems without xattr support behave like untagged objects.
        Err(err) if err.kind() == std::io::ErrorKind::Unsupported => Ok(None),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(LocalFsError::io(rel, err)),
    }
}

async fn write_xattr(path: PathBuf, tag: String) -> std::io::Result<()> {
    tokio::task::spawn_blocking(move || xattr::set(&path, TAG_ATTRIBUTE, tag.as_bytes()))
        .await
        .map_err(std::io::Error::other)?
}

#[cfg(unix)]
fn file_id(meta: &Metadata) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    Some(format!("{}:{}", meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> Option<String> {
    None
}
