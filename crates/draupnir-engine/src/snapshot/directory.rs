use super::VolumeBackend;
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Plain directories with full copies.
///
/// Not copy-on-write: a clone costs the size of the base. Meant for hosts
/// without btrfs and for tests.
#[derive(Debug, Clone, Default)]
pub struct DirectoryBackend;

impl DirectoryBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VolumeBackend for DirectoryBackend {
    fn name(&self) -> &'static str {
        "directory"
    }

    async fn create(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn snapshot(&self, source: &Path, dest: &Path, read_only: bool) -> Result<()> {
        if fs::try_exists(dest).await? {
            bail!("{} already exists", dest.display());
        }
        if !fs::metadata(source).await?.is_dir() {
            bail!("{} is not a directory", source.display());
        }
        if let Err(e) = copy_dir_recursive(source, dest).await {
            let _ = fs::remove_dir_all(dest).await;
            return Err(e);
        }
        // Read-only is advisory here; the store never writes into a base.
        debug!(source = %source.display(), dest = %dest.display(), read_only, "copied volume");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        match fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copy a tree, preserving symlinks and file permissions
async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to).await?;
        fs::set_permissions(&to, fs::metadata(&from).await?.permissions()).await?;

        let mut entries = fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let src_path = entry.path();
            let dst_path = to.join(entry.file_name());
            let file_type = entry.file_type().await?;

            if file_type.is_dir() {
                pending.push((src_path, dst_path));
            } else if file_type.is_symlink() {
                #[cfg(unix)]
                fs::symlink(fs::read_link(&src_path).await?, &dst_path).await?;
            } else {
                fs::copy(&src_path, &dst_path).await?;
            }
        }
    }

    Ok(())
}
