use super::VolumeBackend;
use crate::process::{command, run};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

/// Volumes as btrfs subvolumes; snapshots are constant-time and share extents.
#[derive(Debug, Clone, Default)]
pub struct BtrfsBackend {
    use_sudo: bool,
}

impl BtrfsBackend {
    pub fn new(use_sudo: bool) -> Self {
        Self { use_sudo }
    }

    /// Whether the `btrfs` tool is installed
    pub async fn is_available() -> bool {
        crate::process::on_path("btrfs").await
    }
}

#[async_trait]
impl VolumeBackend for BtrfsBackend {
    fn name(&self) -> &'static str {
        "btrfs"
    }

    async fn create(&self, path: &Path) -> Result<()> {
        let mut cmd = command("btrfs", self.use_sudo);
        cmd.args(["subvolume", "create"]).arg(path);
        run(cmd, "btrfs subvolume create").await?;
        info!(path = %path.display(), "created subvolume");
        Ok(())
    }

    async fn snapshot(&self, source: &Path, dest: &Path, read_only: bool) -> Result<()> {
        let mut cmd = command("btrfs", self.use_sudo);
        cmd.args(["subvolume", "snapshot"]);
        if read_only {
            cmd.arg("-r");
        }
        cmd.arg(source).arg(dest);
        run(cmd, "btrfs subvolume snapshot").await?;
        info!(source = %source.display(), dest = %dest.display(), read_only, "snapshotted subvolume");
        Ok(())
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let mut cmd = command("btrfs", self.use_sudo);
        cmd.args(["subvolume", "delete"]).arg(path);
        run(cmd, "btrfs subvolume delete").await?;
        info!(path = %path.display(), "deleted subvolume");
        Ok(())
    }
}
