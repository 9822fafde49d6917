//! Database processes serving image bases and instance clones

mod postgres;

pub use postgres::{PostgresConfig, PostgresRuntime};

use crate::ca::ServerTls;
use anyhow::Result;
use async_trait::async_trait;
use draupnir_common::{ImageId, InstanceId};
use std::path::{Path, PathBuf};

/// Everything needed to bring up one instance's database.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub instance_id: InstanceId,
    pub image_id: ImageId,
    pub data_dir: PathBuf,
    pub port: u16,
    pub tls: ServerTls,
}

#[async_trait]
pub trait DatabaseRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `script` against the staged data directory and shut the database
    /// down cleanly again, so the directory can be sealed afterwards.
    async fn anonymise(&self, image_id: ImageId, data_dir: &Path, script: &str) -> Result<()>;

    /// Start serving the clone described by `spec` on its port, requiring
    /// client certificates signed by the instance CA.
    async fn start(&self, spec: &InstanceSpec) -> Result<()>;

    /// Stop the instance's database. Stopping one that is not running is not an error.
    async fn stop(&self, instance_id: InstanceId, data_dir: &Path) -> Result<()>;
}
