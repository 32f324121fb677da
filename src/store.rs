//! File-backed document store.
//!
//! Every immediate regular file inside the data directory is one document and
//! its filename is the document identifier. There is no locking: concurrent
//! writers race and the last rename wins. Writes go through a temporary file in
//! the same directory followed by a rename, so readers only ever observe a
//! complete old or a complete new document.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Longest accepted document name in bytes (common filesystem limit).
pub const MAX_NAME_LEN: usize = 255;

/// Extension appended to new document names that have none.
pub const DEFAULT_EXTENSION: &str = "txt";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid document name: {0:?}")]
    InvalidName(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("background write task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A document loaded from disk.
#[derive(Debug, Clone)]
pub struct Document {
    pub name: String,
    pub content: Vec<u8>,
    /// Last modification time, when the filesystem reports one.
    pub modified: Option<SystemTime>,
}

/// Check that `name` is a single plain filename inside the store.
///
/// Rejects empty names, `.`/`..`, anything containing a path separator or a
/// NUL byte, dot-files (which also keeps in-flight temporary files private),
/// and names longer than [`MAX_NAME_LEN`].
pub fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name.len() > MAX_NAME_LEN
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidName(name.to_owned()));
    }
    Ok(())
}

/// Append `.txt` to a requested name that carries no extension.
pub fn with_default_extension(name: &str) -> String {
    if Path::new(name).extension().is_some() {
        name.to_owned()
    } else {
        format!("{name}.{DEFAULT_EXTENSION}")
    }
}

#[derive(Debug, Clone)]
pub struct DocumentStore {
    root: PathBuf,
}

impl DocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the data directory (and parents) if it does not exist yet.
    pub async fn ensure_root(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    /// List document names, sorted.
    pub async fn list(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StoreError::io(&self.root, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            // Non-UTF-8 names cannot round-trip through URLs; skip them.
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if validate_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Load a document; `Ok(None)` when no such document exists.
    pub async fn load(&self, name: &str) -> Result<Option<Document>, StoreError> {
        let path = self.path_for(name)?;
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        let content = tokio::fs::read(&path)
            .await
            .map_err(|e| StoreError::io(&path, e))?;

        Ok(Some(Document {
            name: name.to_owned(),
            content,
            modified: meta.modified().ok(),
        }))
    }

    pub async fn exists(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Create a new empty document. Fails if the name is already taken.
    pub async fn create(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(name.to_owned()))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Replace the full content of `name` atomically.
    pub async fn write(&self, name: &str, content: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || write_atomic(&root, &path, &content)).await?
    }

    /// Remove `name`. Returns `false` when there was nothing to remove.
    pub async fn delete(&self, name: &str) -> Result<bool, StoreError> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

fn write_atomic(dir: &Path, path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(content)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}
