//! Storage backends and the per-location registry.
//!
//! Every storage location id maps to one `StorageBackend`. The local backend
//! shards objects beneath `root/{shard}/{shard}/{key}`; the remote backend
//! only knows how to name objects and refuses all I/O.

use crate::{config::LocationSpec, services::key_allocator::ObjectKey};
use async_trait::async_trait;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::fs::{self, File};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage location `{location}` does not support {operation}")]
    Unsupported {
        location: String,
        operation: &'static str,
    },
    #[error("copy of {path} is {actual} bytes, expected {expected}")]
    CopyVerification {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Where an object's bytes physically live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target", rename_all = "lowercase")]
pub enum PhysicalLocation {
    Local(PathBuf),
    Remote(String),
}

impl PhysicalLocation {
    pub fn as_local(&self) -> Option<&Path> {
        match self {
            Self::Local(path) => Some(path),
            Self::Remote(_) => None,
        }
    }
}

impl fmt::Display for PhysicalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::Remote(uri) => f.write_str(uri),
        }
    }
}

/// Capability set every storage location provides.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Id of the storage location this backend serves.
    fn location_id(&self) -> &str;

    /// Resolve a key to its physical location. Performs no I/O, so the object
    /// may or may not exist.
    fn resolve(&self, key: &ObjectKey) -> PhysicalLocation;

    /// Move a fully written staging file into the permanent store under `key`.
    async fn promote(&self, staged: &Path, key: &ObjectKey) -> BackendResult<PhysicalLocation>;

    /// Remove an object. Returns `false` when it was already absent.
    async fn delete(&self, key: &ObjectKey) -> BackendResult<bool>;

    async fn exists(&self, key: &ObjectKey) -> BackendResult<bool>;
}

/// Objects stored on a local (or mounted) filesystem.
pub struct LocalBackend {
    id: String,
    root: PathBuf,
}

impl LocalBackend {
    /// Create the backend, making sure the root directory exists.
    pub async fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            id: id.into(),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Two-level shard directories derived from MD5(key); keeps directory
    /// sizes bounded.
    fn object_shards(key: &ObjectKey) -> (String, String) {
        let digest = md5::compute(key.as_str());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.root.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key.as_str());
        path
    }

    /// Remove empty shard directories up to (not including) the root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn location_id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, key: &ObjectKey) -> PhysicalLocation {
        PhysicalLocation::Local(self.object_path(key))
    }

    async fn promote(&self, staged: &Path, key: &ObjectKey) -> BackendResult<PhysicalLocation> {
        let target = self.object_path(key);
        let parent = target.parent().map(Path::to_path_buf).ok_or_else(|| {
            BackendError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;

        match fs::rename(staged, &target).await {
            Ok(()) => debug!("renamed {} -> {}", staged.display(), target.display()),
            Err(err) if err.kind() == ErrorKind::CrossesDevices => {
                info!(
                    "staging file {} is on another volume, copying into {}",
                    staged.display(),
                    self.id
                );
                copy_across_devices(staged, &target).await?;
            }
            Err(err) => return Err(err.into()),
        }

        Ok(PhysicalLocation::Local(target))
    }

    async fn delete(&self, key: &ObjectKey) -> BackendResult<bool> {
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed physical file {}", path.display());
                if let Some(parent) = path.parent() {
                    self.prune_empty_dirs(parent).await;
                }
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, key: &ObjectKey) -> BackendResult<bool> {
        Ok(fs::try_exists(self.object_path(key)).await?)
    }
}

/// Copy `staged` next to `target`, verify, rename into place, then drop the
/// staging file. `target` is never visible in a partially written state.
pub(crate) async fn copy_across_devices(staged: &Path, target: &Path) -> BackendResult<()> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

    let expected = fs::metadata(staged).await?.len();
    if let Err(err) = fs::copy(staged, &tmp_path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }
    let file = File::open(&tmp_path).await?;
    file.sync_all().await?;
    let actual = file.metadata().await?.len();
    drop(file);

    if actual != expected {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(BackendError::CopyVerification {
            path: target.to_path_buf(),
            expected,
            actual,
        });
    }

    if let Err(err) = fs::rename(&tmp_path, target).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    if let Err(err) = fs::remove_file(staged).await {
        warn!(
            "promoted copy of {} but could not remove staging file: {}",
            staged.display(),
            err
        );
    }
    Ok(())
}

/// Placeholder for object storage reachable by URI. Names objects so records
/// can be resolved, but performs no I/O.
pub struct RemoteBackend {
    id: String,
    base_uri: String,
}

impl RemoteBackend {
    pub fn new(id: impl Into<String>, base_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_uri: base_uri.into(),
        }
    }

    fn unsupported(&self, operation: &'static str) -> BackendError {
        BackendError::Unsupported {
            location: self.id.clone(),
            operation,
        }
    }
}

#[async_trait]
impl StorageBackend for RemoteBackend {
    fn location_id(&self) -> &str {
        &self.id
    }

    fn resolve(&self, key: &ObjectKey) -> PhysicalLocation {
        PhysicalLocation::Remote(format!(
            "{}/{}",
            self.base_uri.trim_end_matches('/'),
            key
        ))
    }

    async fn promote(&self, _staged: &Path, _key: &ObjectKey) -> BackendResult<PhysicalLocation> {
        Err(self.unsupported("promote"))
    }

    async fn delete(&self, _key: &ObjectKey) -> BackendResult<bool> {
        Err(self.unsupported("delete"))
    }

    async fn exists(&self, _key: &ObjectKey) -> BackendResult<bool> {
        Err(self.unsupported("exists"))
    }
}

/// Lookup from storage location id to its backend.
#[derive(Clone, Default)]
pub struct StorageLocations {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
}

impl StorageLocations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build backends for every configured location.
    pub async fn from_specs(specs: &[LocationSpec]) -> io::Result<Self> {
        let mut locations = Self::new();
        for spec in specs {
            if spec.is_remote() {
                locations.insert(Arc::new(RemoteBackend::new(&spec.id, &spec.target)));
            } else {
                locations.insert(Arc::new(LocalBackend::new(&spec.id, &spec.target).await?));
            }
            info!("registered storage location {} => {}", spec.id, spec.target);
        }
        Ok(locations)
    }

    pub fn insert(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends
            .insert(backend.location_id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn StorageBackend>> {
        self.backends.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.backends.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.backends.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::key_allocator::ObjectKeyAllocator;

    #[tokio::test]
    async fn promote_moves_staging_file_into_sharded_path() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("games", dir.path().join("store"))
            .await
            .unwrap();
        let key = ObjectKeyAllocator::new().allocate("games");
        let staged = dir.path().join("staged.part");
        fs::write(&staged, b"payload").await.unwrap();

        let location = backend.promote(&staged, &key).await.unwrap();
        let path = location.as_local().unwrap().to_path_buf();

        assert_eq!(location, backend.resolve(&key));
        assert!(path.starts_with(backend.root()));
        assert!(path.ends_with(key.as_str()));
        assert!(!staged.exists());
        assert_eq!(fs::read(&path).await.unwrap(), b"payload");
        assert!(backend.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent_and_prunes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("games", dir.path()).await.unwrap();
        let key = ObjectKeyAllocator::new().allocate("games");
        let staged = dir.path().join("staged.part");
        fs::write(&staged, b"x").await.unwrap();
        let location = backend.promote(&staged, &key).await.unwrap();
        let shard = location.as_local().unwrap().parent().unwrap().to_path_buf();

        assert!(backend.delete(&key).await.unwrap());
        assert!(!backend.delete(&key).await.unwrap());
        assert!(!shard.exists());
        assert!(backend.root().exists());
    }

    #[tokio::test]
    async fn cross_device_copy_verifies_and_removes_staging() {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("staged.part");
        let target = dir.path().join("final.bin");
        fs::write(&staged, vec![7u8; 10_000]).await.unwrap();

        copy_across_devices(&staged, &target).await.unwrap();

        assert!(!staged.exists());
        assert_eq!(fs::read(&target).await.unwrap(), vec![7u8; 10_000]);
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn remote_backend_resolves_but_refuses_io() {
        let backend = RemoteBackend::new("mirror", "s3://bucket/games/");
        let key = ObjectKeyAllocator::new().allocate("mirror");
        assert_eq!(
            backend.resolve(&key),
            PhysicalLocation::Remote(format!("s3://bucket/games/{}", key))
        );
        assert!(matches!(
            backend.delete(&key).await,
            Err(BackendError::Unsupported { operation: "delete", .. })
        ));
    }

    #[tokio::test]
    async fn locations_from_specs_pick_backend_by_target() {
        let dir = tempfile::tempdir().unwrap();
        let specs = vec![
            LocationSpec::parse(&format!("games={}", dir.path().join("g").display())).unwrap(),
            LocationSpec::parse("mirror=https://cdn.example/games").unwrap(),
        ];
        let locations = StorageLocations::from_specs(&specs).await.unwrap();
        assert_eq!(locations.ids(), vec!["games".to_string(), "mirror".to_string()]);
        assert!(dir.path().join("g").exists());
        let key = ObjectKeyAllocator::new().allocate("mirror");
        assert!(matches!(
            locations.get("mirror").unwrap().resolve(&key),
            PhysicalLocation::Remote(_)
        ));
        assert!(locations.get("unknown").is_none());
    }
}
