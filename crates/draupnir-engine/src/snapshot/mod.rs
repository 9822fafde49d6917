//! Copy-on-write volume store for image bases and instance clones
//!
//! Layout under the data root:
//! ```text
//! image_uploads/<image id>     staging volume the upload collaborator writes into
//! image_snapshots/<image id>   sealed, read-only base snapshot
//! instances/<instance id>      writable clone owned by one instance
//! manifests/<ref key>.json     one manifest per base or clone
//! ```
//! A volume only counts as present when both its directory and its manifest
//! exist, so a half-written volume is never mistaken for a usable one.

mod btrfs;
mod directory;

pub use btrfs::BtrfsBackend;
pub use directory::DirectoryBackend;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use draupnir_common::{DraupnirError, ImageId, InstanceId, Result, SnapshotRef};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use crate::records::{read_json, write_json_atomic};

/// Filesystem primitive behind the snapshot store.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create an empty, writable volume at `path`
    async fn create(&self, path: &Path) -> anyhow::Result<()>;

    /// Materialize `dest` as a copy of `source`. `dest` must not exist.
    async fn snapshot(&self, source: &Path, dest: &Path, read_only: bool) -> anyhow::Result<()>;

    /// Remove the volume at `path`
    async fn delete(&self, path: &Path) -> anyhow::Result<()>;
}

/// Metadata written next to every sealed base and clone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub reference: SnapshotRef,
    pub backend: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: Option<u64>,
    pub file_count: Option<u64>,
}

pub struct SnapshotStore {
    root: PathBuf,
    backend: Arc<dyn VolumeBackend>,
}

impl SnapshotStore {
    pub async fn open(root: impl AsRef<Path>, backend: Arc<dyn VolumeBackend>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in ["image_uploads", "image_snapshots", "instances", "manifests"] {
            fs::create_dir_all(root.join(dir)).await?;
        }
        info!(root = %root.display(), backend = backend.name(), "snapshot store ready");
        Ok(Self { root, backend })
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn staging_path(&self, image_id: ImageId) -> PathBuf {
        self.root.join("image_uploads").join(image_id.to_string())
    }

    pub fn path(&self, reference: &SnapshotRef) -> PathBuf {
        match reference {
            SnapshotRef::Base { image_id } => {
                self.root.join("image_snapshots").join(image_id.to_string())
            }
            SnapshotRef::Clone { instance_id, .. } => {
                self.root.join("instances").join(instance_id.to_string())
            }
        }
    }

    fn manifest_path(&self, reference: &SnapshotRef) -> PathBuf {
        self.root
            .join("manifests")
            .join(format!("{}.json", reference.key()))
    }

    /// Create the writable staging volume an upload is delivered into.
    #[instrument(skip(self))]
    pub async fn prepare_staging(&self, image_id: ImageId) -> Result<PathBuf> {
        let path = self.staging_path(image_id);
        if fs::try_exists(&path).await? {
            debug!(path = %path.display(), "staging volume already present");
            return Ok(path);
        }

        self.backend
            .create(&path)
            .await
            .map_err(|e| storage("create staging volume", &path, e))?;

        // Group-writable so the upload user can deliver into it
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, std::fs::Permissions::from_mode(0o775)).await?;
        }

        info!(path = %path.display(), "created staging volume");
        Ok(path)
    }

    /// An artifact is staged when the staging volume exists and is non-empty.
    pub async fn has_staged_artifact(&self, image_id: ImageId) -> Result<bool> {
        let path = self.staging_path(image_id);
        if !fs::try_exists(&path).await? {
            return Ok(false);
        }
        let mut entries = fs::read_dir(&path).await?;
        Ok(entries.next_entry().await?.is_some())
    }

    /// Expand a staged upload consisting of a single `.tar` file in place.
    ///
    /// Entries are extracted into a scratch directory and only moved up once
    /// the whole archive has been read. The archive itself is removed last, so
    /// after a failed or interrupted unpack the staging volume holds nothing
    /// but the archive and a retry starts over.
    #[instrument(skip(self))]
    pub async fn unpack_staged(&self, image_id: ImageId) -> Result<()> {
        let staging = self.staging_path(image_id);
        let dir = staging.clone();
        let unpacked = async move {
            tokio::task::spawn_blocking(move || unpack_single_archive(&dir)).await?
        }
        .await
        .map_err(|e| storage("unpack staged archive", &staging, e))?;

        if let Some(archive) = unpacked {
            info!(archive = %archive.display(), "unpacked staged archive");
        }
        Ok(())
    }

    /// Seal the staged artifact at `source` into the image's base snapshot.
    ///
    /// The staging volume is consumed on success. On failure any partial base
    /// is removed and the staging volume is left untouched. Archives must
    /// already have been expanded with [`SnapshotStore::unpack_staged`].
    #[instrument(skip(self, source), fields(source = %source.display()))]
    pub async fn seal_base(&self, image_id: ImageId, source: &Path) -> Result<SnapshotRef> {
        let start = Instant::now();
        let reference = SnapshotRef::base(image_id);
        let dest = self.path(&reference);

        if fs::try_exists(&dest).await? {
            // Leftover from an interrupted seal; it never got a manifest.
            warn!(path = %dest.display(), "removing partial base snapshot");
            self.backend
                .delete(&dest)
                .await
                .map_err(|e| storage("remove partial base", &dest, e))?;
        }

        if let Err(e) = self.backend.snapshot(source, &dest, true).await {
            self.discard(&dest).await;
            return Err(storage("seal base snapshot", &dest, e));
        }

        let (size_bytes, file_count) = match dir_usage(&dest).await {
            Ok(usage) => (Some(usage.0), Some(usage.1)),
            Err(e) => {
                warn!(error = %e, "could not measure base snapshot");
                (None, None)
            }
        };
        let manifest = VolumeManifest {
            reference: reference.clone(),
            backend: self.backend.name().to_string(),
            created_at: Utc::now(),
            size_bytes,
            file_count,
        };
        if let Err(e) = write_json_atomic(&self.manifest_path(&reference), &manifest).await {
            self.discard(&dest).await;
            return Err(e);
        }

        if let Err(e) = self.backend.delete(source).await {
            warn!(error = %e, path = %source.display(), "sealed base but could not remove staging volume");
        }

        info!(snapshot = %reference, elapsed_ms = start.elapsed().as_millis() as u64, "sealed base snapshot");
        Ok(reference)
    }

    /// Create an instance-private writable clone of a sealed base.
    #[instrument(skip(self), fields(base = %base))]
    pub async fn clone_volume(&self, base: &SnapshotRef, instance_id: InstanceId) -> Result<SnapshotRef> {
        if !base.is_base() {
            return Err(DraupnirError::Internal(format!("{base} is not a base snapshot")));
        }
        if !self.exists(base).await? {
            return Err(DraupnirError::Storage(format!("base snapshot {base} is missing")));
        }

        let reference = SnapshotRef::clone_of(base.image_id(), instance_id);
        let source = self.path(base);
        let dest = self.path(&reference);

        self.backend
            .snapshot(&source, &dest, false)
            .await
            .map_err(|e| storage("clone base snapshot", &dest, e))?;

        let manifest = VolumeManifest {
            reference: reference.clone(),
            backend: self.backend.name().to_string(),
            created_at: Utc::now(),
            size_bytes: None,
            file_count: None,
        };
        if let Err(e) = write_json_atomic(&self.manifest_path(&reference), &manifest).await {
            self.discard(&dest).await;
            return Err(e);
        }

        debug!(clone = %reference, "cloned base snapshot");
        Ok(reference)
    }

    /// Release a base or clone volume. Missing volumes are not an error.
    ///
    /// Dependent accounting is the caller's job: the image manager refuses to
    /// destroy a base while instances reference it.
    #[instrument(skip(self), fields(snapshot = %reference))]
    pub async fn destroy(&self, reference: &SnapshotRef) -> Result<()> {
        let path = self.path(reference);
        if fs::try_exists(&path).await? {
            self.backend
                .delete(&path)
                .await
                .map_err(|e| storage("destroy volume", &path, e))?;
        }
        match fs::remove_file(self.manifest_path(reference)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!("destroyed volume");
        Ok(())
    }

    /// Remove an image's staging volume, if any.
    pub async fn discard_staging(&self, image_id: ImageId) -> Result<()> {
        let path = self.staging_path(image_id);
        if fs::try_exists(&path).await? {
            self.backend
                .delete(&path)
                .await
                .map_err(|e| storage("remove staging volume", &path, e))?;
        }
        Ok(())
    }

    pub async fn exists(&self, reference: &SnapshotRef) -> Result<bool> {
        Ok(fs::try_exists(self.path(reference)).await?
            && fs::try_exists(self.manifest_path(reference)).await?)
    }

    pub async fn manifest(&self, reference: &SnapshotRef) -> Result<Option<VolumeManifest>> {
        let path = self.manifest_path(reference);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        read_json(&path).await.map(Some)
    }

    /// Every manifest currently on disk
    pub async fn manifests(&self) -> Result<Vec<VolumeManifest>> {
        let mut manifests = Vec::new();
        let mut entries = fs::read_dir(self.root.join("manifests")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<VolumeManifest>(&path).await {
                Ok(manifest) => manifests.push(manifest),
                Err(e) => warn!(error = %e, path = %path.display(), "skipping unreadable manifest"),
            }
        }
        Ok(manifests)
    }

    async fn discard(&self, path: &Path) {
        if let Ok(true) = fs::try_exists(path).await {
            if let Err(e) = self.backend.delete(path).await {
                warn!(error = %e, path = %path.display(), "failed to discard partial volume");
            }
        }
    }
}

fn storage(action: &str, path: &Path, err: anyhow::Error) -> DraupnirError {
    DraupnirError::Storage(format!("{action} at {}: {err:#}", path.display()))
}

/// Records which archive an unpack is working on while it is in progress
const UNPACK_MARKER: &str = ".draupnir-unpacking";
const UNPACK_SCRATCH: &str = ".draupnir-unpack";

/// Unpack the lone `.tar` in `dir`, resuming after an interrupted attempt.
///
/// Returns the archive path when something was unpacked.
fn unpack_single_archive(dir: &Path) -> anyhow::Result<Option<PathBuf>> {
    let marker = dir.join(UNPACK_MARKER);
    let archive = match std::fs::read_to_string(&marker) {
        Ok(name) => {
            let archive = dir.join(name.trim());
            if !archive.is_file() {
                // Every entry was moved before the archive went away
                std::fs::remove_file(&marker)?;
                return Ok(None);
            }
            warn!(archive = %archive.display(), "restarting interrupted unpack");
            clear_except(dir, &archive)?;
            archive
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => match lone_archive(dir)? {
            Some(archive) => archive,
            None => return Ok(None),
        },
        Err(e) => return Err(e).context("read unpack marker"),
    };

    if let Err(e) = extract_and_promote(dir, &archive, &marker) {
        if let Err(cleanup) = clear_except(dir, &archive) {
            warn!(error = %cleanup, dir = %dir.display(), "could not clear partial unpack");
        }
        return Err(e);
    }

    std::fs::remove_file(&archive).with_context(|| format!("remove {}", archive.display()))?;
    std::fs::remove_file(&marker)?;
    Ok(Some(archive))
}

fn lone_archive(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = std::fs::read_dir(dir)?;
    let Some(entry) = entries.next().transpose()? else {
        return Ok(None);
    };
    if entries.next().is_some() {
        return Ok(None);
    }
    let path = entry.path();
    let is_tar = entry.file_type()?.is_file()
        && path.extension().and_then(|e| e.to_str()) == Some("tar");
    Ok(is_tar.then_some(path))
}

fn extract_and_promote(dir: &Path, archive: &Path, marker: &Path) -> anyhow::Result<()> {
    let name = archive
        .file_name()
        .and_then(|n| n.to_str())
        .context("archive name is not valid UTF-8")?;
    std::fs::write(marker, name)?;

    let scratch = dir.join(UNPACK_SCRATCH);
    std::fs::create_dir(&scratch)?;
    let file = std::fs::File::open(archive).with_context(|| format!("open {}", archive.display()))?;
    tar::Archive::new(file)
        .unpack(&scratch)
        .with_context(|| format!("extract {}", archive.display()))?;

    for entry in std::fs::read_dir(&scratch)? {
        let entry = entry?;
        let target = dir.join(entry.file_name());
        if std::fs::symlink_metadata(&target).is_ok() {
            anyhow::bail!("archive entry {} collides with a staged file", target.display());
        }
        std::fs::rename(entry.path(), &target)?;
    }
    std::fs::remove_dir(&scratch)?;
    Ok(())
}

/// Remove everything in `dir` apart from `keep`
fn clear_except(dir: &Path, keep: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path == keep {
            continue;
        }
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Total size in bytes and number of files below `dir`
async fn dir_usage(dir: &Path) -> anyhow::Result<(u64, u64)> {
    let mut size = 0u64;
    let mut files = 0u64;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                size += entry.metadata().await?.len();
                files += 1;
            }
        }
    }
    Ok((size, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{tar_archive, truncated_tar};
    use tempfile::tempdir;

    async fn store(root: &Path) -> SnapshotStore {
        SnapshotStore::open(root, Arc::new(DirectoryBackend::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_staging_and_seal() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;

        let staging = store.prepare_staging(1).await.unwrap();
        assert!(!store.has_staged_artifact(1).await.unwrap());

        fs::write(staging.join("PG_VERSION"), b"16\n").await.unwrap();
        assert!(store.has_staged_artifact(1).await.unwrap());

        let base = store.seal_base(1, &staging).await.unwrap();
        assert_eq!(base, SnapshotRef::base(1));
        assert!(store.exists(&base).await.unwrap());
        assert!(!fs::try_exists(&staging).await.unwrap());

        let manifest = store.manifest(&base).await.unwrap().unwrap();
        assert_eq!(manifest.size_bytes, Some(3));
        assert_eq!(manifest.file_count, Some(1));
        assert_eq!(manifest.backend, "directory");
    }

    #[tokio::test]
    async fn test_seal_unpacks_single_tar() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let staging = store.prepare_staging(2).await.unwrap();

        let archive_path = staging.join("db.tar");
        std::fs::write(&archive_path, tar_archive(&[("PG_VERSION", &b"16\n"[..])])).unwrap();

        store.unpack_staged(2).await.unwrap();
        assert!(!fs::try_exists(&archive_path).await.unwrap());
        assert!(!fs::try_exists(staging.join(UNPACK_MARKER)).await.unwrap());

        let base = store.seal_base(2, &staging).await.unwrap();
        let sealed = store.path(&base);
        assert!(fs::try_exists(sealed.join("PG_VERSION")).await.unwrap());
        assert!(!fs::try_exists(sealed.join("db.tar")).await.unwrap());
    }

    #[tokio::test]
    async fn test_unpack_leaves_other_uploads_alone() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let staging = store.prepare_staging(5).await.unwrap();
        fs::write(staging.join("db.tar"), b"not really a tar").await.unwrap();
        fs::write(staging.join("PG_VERSION"), b"16\n").await.unwrap();

        store.unpack_staged(5).await.unwrap();
        assert!(fs::try_exists(staging.join("db.tar")).await.unwrap());
        assert!(fs::try_exists(staging.join("PG_VERSION")).await.unwrap());
    }

    #[tokio::test]
    async fn test_truncated_archive_leaves_only_the_archive() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let staging = store.prepare_staging(6).await.unwrap();
        let archive_path = staging.join("db.tar");
        std::fs::write(&archive_path, truncated_tar()).unwrap();

        let err = store.unpack_staged(6).await.unwrap_err();
        assert!(matches!(err, DraupnirError::Storage(_)));
        let left: Vec<_> = std::fs::read_dir(&staging)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(left, vec![std::ffi::OsString::from("db.tar")]);

        // A retry fails the same way instead of sealing half an archive
        assert!(store.unpack_staged(6).await.is_err());
        assert!(!fs::try_exists(staging.join("PG_VERSION")).await.unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_unpack_is_restarted() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let staging = store.prepare_staging(7).await.unwrap();
        let archive_path = staging.join("db.tar");
        std::fs::write(&archive_path, tar_archive(&[("PG_VERSION", &b"16\n"[..])])).unwrap();

        // State left by a crash halfway through moving entries up
        std::fs::write(staging.join(UNPACK_MARKER), "db.tar").unwrap();
        std::fs::create_dir(staging.join(UNPACK_SCRATCH)).unwrap();
        std::fs::write(staging.join("half-moved"), b"junk").unwrap();

        store.unpack_staged(7).await.unwrap();
        let mut left: Vec<_> = std::fs::read_dir(&staging)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        left.sort();
        assert_eq!(left, vec![std::ffi::OsString::from("PG_VERSION")]);
    }

    #[tokio::test]
    async fn test_clone_is_independent() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let staging = store.prepare_staging(3).await.unwrap();
        fs::write(staging.join("data"), b"original").await.unwrap();
        let base = store.seal_base(3, &staging).await.unwrap();

        let clone = store.clone_volume(&base, 10).await.unwrap();
        assert_eq!(clone, SnapshotRef::clone_of(3, 10));
        fs::write(store.path(&clone).join("data"), b"changed")
            .await
            .unwrap();

        let base_data = fs::read(store.path(&base).join("data")).await.unwrap();
        assert_eq!(base_data, b"original");
    }

    #[tokio::test]
    async fn test_clone_of_missing_base_fails() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let err = store
            .clone_volume(&SnapshotRef::base(99), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, DraupnirError::Storage(_)));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let staging = store.prepare_staging(4).await.unwrap();
        fs::write(staging.join("data"), b"x").await.unwrap();
        let base = store.seal_base(4, &staging).await.unwrap();

        store.destroy(&base).await.unwrap();
        assert!(!store.exists(&base).await.unwrap());
        store.destroy(&base).await.unwrap();
        assert!(store.manifests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_volume_without_manifest_does_not_exist() {
        let temp_dir = tempdir().unwrap();
        let store = store(temp_dir.path()).await;
        let base = SnapshotRef::base(5);
        fs::create_dir_all(store.path(&base)).await.unwrap();
        assert!(!store.exists(&base).await.unwrap());
    }
}
