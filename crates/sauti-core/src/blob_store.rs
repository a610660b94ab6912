//! Ephemeral blob registry on the local filesystem.
//!
//! Blobs are written to a temporary file and renamed into place, so a reader
//! or the sweep never observes a half-written blob under its final name. The
//! file modification time is the creation timestamp used for TTL expiry.
//!
//! Lookups go through an in-memory id to path index, rebuilt from the
//! directory when the store is opened.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::task;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const DEFAULT_EXTENSION: &str = "wav";
const TEMP_EXTENSION: &str = "tmp";

/// Where a blob lives and when it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobLocation {
    pub blob_id: String,
    pub path: PathBuf,
    pub created_at: SystemTime,
}

impl BlobLocation {
    pub fn extension(&self) -> &str {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or(DEFAULT_EXTENSION)
    }
}

/// A blob resolved together with its content.
#[derive(Debug, Clone)]
pub struct LoadedBlob {
    pub location: BlobLocation,
    pub bytes: Vec<u8>,
}

type BlobIndex = Arc<RwLock<HashMap<String, PathBuf>>>;

#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
    ttl: Duration,
    index: BlobIndex,
}

impl BlobStore {
    pub fn initialize(root: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| {
            Error::Storage(format!(
                "Failed to create blob directory {}: {err}",
                root.display()
            ))
        })?;
        let index = scan_blobs(&root)?;
        if !index.is_empty() {
            info!("Indexed {} existing blob(s) in {}", index.len(), root.display());
        }
        Ok(Self {
            root,
            ttl,
            index: Arc::new(RwLock::new(index)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist `bytes` and return the generated blob id.
    ///
    /// The extension is taken from `hint_name` when it is safe, `wav` otherwise.
    pub async fn save(&self, bytes: Vec<u8>, hint_name: &str) -> Result<String> {
        let extension = resolve_extension(hint_name);
        let index = self.index.clone();

        self.run_blocking(move |root| {
            let blob_id = Uuid::new_v4().simple().to_string();
            let final_path = root.join(format!("{blob_id}.{extension}"));
            let temp_path = root.join(format!(
                "{blob_id}.partial-{}.{TEMP_EXTENSION}",
                Uuid::new_v4().simple()
            ));

            std::fs::write(&temp_path, &bytes).map_err(|err| {
                Error::Storage(format!(
                    "Failed writing blob to temporary path {}: {err}",
                    temp_path.display()
                ))
            })?;
            if let Err(err) = std::fs::rename(&temp_path, &final_path) {
                let _ = std::fs::remove_file(&temp_path);
                return Err(Error::Storage(format!(
                    "Failed moving blob into place at {}: {err}",
                    final_path.display()
                )));
            }
            index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(blob_id.clone(), final_path);

            info!("Saved blob {blob_id} ({} bytes)", bytes.len());
            Ok(blob_id)
        })
        .await
    }

    /// Resolve a blob id to its location, `None` if unknown or already swept.
    pub async fn get_location(&self, blob_id: &str) -> Result<Option<BlobLocation>> {
        if !is_valid_blob_id(blob_id) {
            return Ok(None);
        }
        let blob_id = blob_id.to_string();
        let index = self.index.clone();
        self.run_blocking(move |_| locate(&index, &blob_id)).await
    }

    /// Resolve and read a blob in one step.
    pub async fn load(&self, blob_id: &str) -> Result<Option<LoadedBlob>> {
        if !is_valid_blob_id(blob_id) {
            return Ok(None);
        }
        let blob_id = blob_id.to_string();
        let index = self.index.clone();
        self.run_blocking(move |_| {
            let Some(location) = locate(&index, &blob_id)? else {
                return Ok(None);
            };
            match std::fs::read(&location.path) {
                Ok(bytes) => Ok(Some(LoadedBlob { location, bytes })),
                // Swept between lookup and read.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
        .await
    }

    /// Delete every blob older than the TTL. Returns the number removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        self.sweep_expired_at(SystemTime::now()).await
    }

    /// Sweep as if the current time were `now`.
    pub async fn sweep_expired_at(&self, now: SystemTime) -> Result<usize> {
        let ttl = self.ttl;
        let index = self.index.clone();
        self.run_blocking(move |root| {
            let mut removed = 0;
            for entry in std::fs::read_dir(&root)? {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        warn!("Skipping unreadable blob entry: {err}");
                        continue;
                    }
                };
                let path = entry.path();
                let modified = match entry.metadata().and_then(|meta| {
                    if meta.is_file() {
                        meta.modified().map(Some)
                    } else {
                        Ok(None)
                    }
                }) {
                    Ok(Some(modified)) => modified,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!("Failed to stat {}: {err}", path.display());
                        continue;
                    }
                };

                let age = now.duration_since(modified).unwrap_or_default();
                if age <= ttl {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        warn!("Failed to delete expired blob {}: {err}", path.display());
                        continue;
                    }
                }
                if let Some(blob_id) = blob_id_of(&path) {
                    index
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(blob_id);
                }
            }

            if removed > 0 {
                info!("Cleaned up {removed} expired blob(s)");
            }
            Ok(removed)
        })
        .await
    }

    async fn run_blocking<F, T>(&self, task_fn: F) -> Result<T>
    where
        F: FnOnce(PathBuf) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let root = self.root.clone();
        task::spawn_blocking(move || task_fn(root))
            .await
            .map_err(|err| Error::Storage(format!("Blob storage worker failed: {err}")))?
    }
}

fn locate(index: &BlobIndex, blob_id: &str) -> Result<Option<BlobLocation>> {
    let path = index
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(blob_id)
        .cloned();
    let Some(path) = path else {
        return Ok(None);
    };
    let created_at = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(blob_id);
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    Ok(Some(BlobLocation {
        blob_id: blob_id.to_string(),
        path,
        created_at,
    }))
}

fn scan_blobs(root: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut index = HashMap::new();
    for entry in std::fs::read_dir(root)? {
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_ok_and(|kind| kind.is_file()) {
            continue;
        }
        let path = entry.path();
        if let Some(blob_id) = blob_id_of(&path) {
            index.insert(blob_id.to_string(), path);
        }
    }
    Ok(index)
}

/// The blob id a file in the blob directory is stored under, if any.
/// Partial writes have no id.
fn blob_id_of(path: &Path) -> Option<&str> {
    if path.extension().and_then(|ext| ext.to_str()) == Some(TEMP_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| is_valid_blob_id(stem))
}

/// Blob ids are simple-format v4 UUIDs; anything else cannot name a blob.
fn is_valid_blob_id(blob_id: &str) -> bool {
    blob_id.len() == 32 && blob_id.chars().all(|ch| ch.is_ascii_hexdigit())
}

fn resolve_extension(hint_name: &str) -> String {
    Path::new(hint_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.trim().to_ascii_lowercase())
        .filter(|ext| is_safe_extension(ext) && ext != TEMP_EXTENSION)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

fn is_safe_extension(ext: &str) -> bool {
    !ext.is_empty()
        && ext.len() <= 12
        && ext
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(ttl: Duration) -> BlobStore {
        let dir = std::env::temp_dir().join(format!("sauti-blob-test-{}", Uuid::new_v4()));
        BlobStore::initialize(dir, ttl).unwrap()
    }

    #[tokio::test]
    async fn saved_blob_is_resolvable() {
        let store = temp_store(Duration::from_secs(60));
        let blob_id = store.save(b"RIFF".to_vec(), "clip.WAV").await.unwrap();

        let location = store.get_location(&blob_id).await.unwrap().unwrap();
        assert_eq!(location.blob_id, blob_id);
        assert_eq!(location.extension(), "wav");

        let loaded = store.load(&blob_id).await.unwrap().unwrap();
        assert_eq!(loaded.bytes, b"RIFF");

        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[tokio::test]
    async fn unknown_or_malformed_ids_are_not_found() {
        let store = temp_store(Duration::from_secs(60));
        assert!(store
            .get_location(&Uuid::new_v4().simple().to_string())
            .await
            .unwrap()
            .is_none());
        assert!(store.get_location("../etc/passwd").await.unwrap().is_none());
        assert!(store.load("nope").await.unwrap().is_none());
        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[tokio::test]
    async fn sweep_removes_blobs_past_ttl_only() {
        let ttl = Duration::from_secs(30 * 60);
        let store = temp_store(ttl);
        let blob_id = store.save(vec![1, 2, 3], "result.json").await.unwrap();

        assert_eq!(store.sweep_expired().await.unwrap(), 0);
        assert!(store.get_location(&blob_id).await.unwrap().is_some());

        let later = SystemTime::now() + ttl + Duration::from_secs(1);
        assert_eq!(store.sweep_expired_at(later).await.unwrap(), 1);
        assert!(store.get_location(&blob_id).await.unwrap().is_none());

        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[tokio::test]
    async fn empty_payload_is_stored() {
        let store = temp_store(Duration::from_secs(60));
        let blob_id = store.save(Vec::new(), "silence.wav").await.unwrap();
        let loaded = store.load(&blob_id).await.unwrap().unwrap();
        assert!(loaded.bytes.is_empty());
        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[tokio::test]
    async fn reopened_store_finds_existing_blobs() {
        let store = temp_store(Duration::from_secs(60));
        let blob_id = store.save(b"{}".to_vec(), "result.json").await.unwrap();
        let partial = store.root().join(format!("{blob_id}.partial-abc.tmp"));
        std::fs::write(&partial, b"half").unwrap();

        let reopened = BlobStore::initialize(store.root(), Duration::from_secs(60)).unwrap();
        let location = reopened.get_location(&blob_id).await.unwrap().unwrap();
        assert_eq!(location.extension(), "json");
        assert_eq!(reopened.load(&blob_id).await.unwrap().unwrap().bytes, b"{}");

        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[tokio::test]
    async fn blob_deleted_behind_the_store_is_not_found() {
        let store = temp_store(Duration::from_secs(60));
        let blob_id = store.save(vec![9; 4], "clip.flac").await.unwrap();
        let location = store.get_location(&blob_id).await.unwrap().unwrap();
        std::fs::remove_file(&location.path).unwrap();

        assert!(store.get_location(&blob_id).await.unwrap().is_none());
        assert!(store.load(&blob_id).await.unwrap().is_none());
        std::fs::remove_dir_all(store.root()).unwrap();
    }

    #[test]
    fn extension_falls_back_to_wav() {
        assert_eq!(resolve_extension("voice"), "wav");
        assert_eq!(resolve_extension("a.b/../../x.$$"), "wav");
        assert_eq!(resolve_extension("notes.JSON"), "json");
        assert_eq!(resolve_extension("sneaky.tmp"), "wav");
    }
}
