//! Wiring of the lifecycle managers over one data directory

use draupnir_common::{DraupnirError, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::ca::{CaConfig, CertificateAuthority};
use crate::images::ImageManager;
use crate::instances::{InstanceManager, RecoveryReport};
use crate::locks::KeyedLocks;
use crate::ports::PortAllocator;
use crate::records::{FileRecordStore, RecordStore};
use crate::runtime::DatabaseRuntime;
use crate::snapshot::{SnapshotStore, VolumeBackend};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root for volumes, records and the CA
    pub data_path: PathBuf,
    pub min_port: u16,
    pub max_port: u16,
    /// Name clients use to reach instances; goes into server certificates
    pub public_hostname: String,
    pub credential_validity_days: u32,
    pub ca_common_name: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/var/draupnir"),
            min_port: 5433,
            max_port: 6000,
            public_hostname: "localhost".to_string(),
            credential_validity_days: 30,
            ca_common_name: "Draupnir CA".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_port > self.max_port {
            return Err(DraupnirError::Config(format!(
                "min port {} is above max port {}",
                self.min_port, self.max_port
            )));
        }
        if self.min_port == 0 {
            return Err(DraupnirError::Config("min port must be non-zero".into()));
        }
        if self.public_hostname.trim().is_empty() {
            return Err(DraupnirError::Config("public hostname must be set".into()));
        }
        if self.credential_validity_days == 0 {
            return Err(DraupnirError::Config(
                "credential validity must be at least one day".into(),
            ));
        }
        Ok(())
    }
}

pub struct Engine {
    pub images: ImageManager,
    pub instances: InstanceManager,
    records: Arc<dyn RecordStore>,
    config: EngineConfig,
    recovery: RecoveryReport,
}

impl Engine {
    /// Open the engine over `config.data_path`, persisting records under `state/`.
    pub async fn open(
        config: EngineConfig,
        backend: Arc<dyn VolumeBackend>,
        runtime: Arc<dyn DatabaseRuntime>,
    ) -> Result<Self> {
        let records = FileRecordStore::open(config.data_path.join("state")).await?;
        Self::with_store(config, Arc::new(records), backend, runtime).await
    }

    /// Open with an explicit record store, rebuilding in-memory state from it.
    pub async fn with_store(
        config: EngineConfig,
        records: Arc<dyn RecordStore>,
        backend: Arc<dyn VolumeBackend>,
        runtime: Arc<dyn DatabaseRuntime>,
    ) -> Result<Self> {
        config.validate()?;

        let snapshots = Arc::new(SnapshotStore::open(&config.data_path, backend).await?);
        let ca = Arc::new(
            CertificateAuthority::load_or_create(
                config.data_path.join("ca"),
                CaConfig {
                    common_name: config.ca_common_name.clone(),
                    validity_days: config.credential_validity_days,
                },
            )
            .await?,
        );

        // Leases come only from persisted instances.
        let existing = records.list_instances().await?;
        let ports = Arc::new(PortAllocator::recover(
            config.min_port,
            config.max_port,
            existing.iter().map(|i| (i.id, i.port)),
        )?);

        let image_locks = Arc::new(KeyedLocks::new());
        let images = ImageManager::new(
            records.clone(),
            snapshots.clone(),
            runtime.clone(),
            image_locks.clone(),
        );
        let instances = InstanceManager::new(
            records.clone(),
            snapshots.clone(),
            runtime,
            ports,
            ca,
            image_locks,
            config.public_hostname.clone(),
        );

        let mut recovery = RecoveryReport::default();
        instances.recover(&mut recovery).await?;

        for image in records.list_images().await? {
            let Some(base) = image.snapshot.as_ref().filter(|_| image.ready()) else {
                continue;
            };
            if !snapshots.exists(base).await? {
                error!(image_id = image.id, snapshot = %base, "ready image is missing its base snapshot");
                recovery.corrupted_images.push(image.id);
            }
        }

        if recovery != RecoveryReport::default() {
            warn!(?recovery, "recovered from unclean shutdown");
        }
        info!(
            data_path = %config.data_path.display(),
            backend = snapshots.backend_name(),
            images = records.list_images().await?.len(),
            instances = existing.len(),
            "engine ready"
        );

        Ok(Self {
            images,
            instances,
            records,
            config,
            recovery,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The record store, for collaborators that derive state from it
    pub fn records(&self) -> Arc<dyn RecordStore> {
        self.records.clone()
    }

    /// What the last open had to repair
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }
}
