//! Instance lifecycle: `provisioning -> running -> deleting -> (removed)`
//!
//! Provisioning composes its acquisitions (port, record, clone, database
//! process, credential) and undoes the completed ones in reverse when a later
//! one fails. The record outlives every other compensation, so an unwind that
//! gets stuck leaves a `failed` record behind for a later delete.
//! Teardown runs in a fixed order and can be re-entered after a partial
//! failure; each step skips whatever an earlier attempt already released.

use draupnir_common::{
    DraupnirError, Image, ImageId, Instance, InstanceId, InstanceState, ProvisionedInstance,
    Result, SnapshotRef, WhitelistedAddress,
};
use futures::FutureExt;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::ca::CertificateAuthority;
use crate::locks::KeyedLocks;
use crate::ports::PortAllocator;
use crate::records::RecordStore;
use crate::rollback::Rollback;
use crate::runtime::{DatabaseRuntime, InstanceSpec};
use crate::snapshot::SnapshotStore;

/// What startup recovery found and did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted provisions that were fully undone
    pub rolled_back: Vec<InstanceId>,
    /// Interrupted provisions that could not be undone and were marked failed
    pub marked_failed: Vec<InstanceId>,
    /// Clone volumes with no owning record that were removed
    pub orphans_removed: Vec<SnapshotRef>,
    /// Ready images whose base snapshot is gone
    pub corrupted_images: Vec<ImageId>,
}

pub struct InstanceManager {
    records: Arc<dyn RecordStore>,
    snapshots: Arc<SnapshotStore>,
    runtime: Arc<dyn DatabaseRuntime>,
    ports: Arc<PortAllocator>,
    ca: Arc<CertificateAuthority>,
    image_locks: Arc<KeyedLocks<ImageId>>,
    locks: KeyedLocks<InstanceId>,
    hostname: String,
}

impl InstanceManager {
    pub(crate) fn new(
        records: Arc<dyn RecordStore>,
        snapshots: Arc<SnapshotStore>,
        runtime: Arc<dyn DatabaseRuntime>,
        ports: Arc<PortAllocator>,
        ca: Arc<CertificateAuthority>,
        image_locks: Arc<KeyedLocks<ImageId>>,
        hostname: String,
    ) -> Self {
        Self {
            records,
            snapshots,
            runtime,
            ports,
            ca,
            image_locks,
            locks: KeyedLocks::new(),
            hostname,
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Clone a ready image into a new running instance with its own port and
    /// client credential. The returned key is not retrievable afterwards.
    #[instrument(skip(self))]
    pub async fn provision(&self, image_id: ImageId) -> Result<ProvisionedInstance> {
        // Shared: other provisions of this image may proceed, deletion may not.
        let _image_guard = self.image_locks.shared(image_id).await;

        let image = self
            .records
            .get_image(image_id)
            .await?
            .ok_or_else(|| DraupnirError::NotFound(format!("image {image_id}")))?;
        if !image.ready() {
            return Err(DraupnirError::ImageNotReady(image_id));
        }
        let base = image.snapshot.clone().ok_or_else(|| {
            DraupnirError::Corrupted(format!("image {image_id} is ready without a base snapshot"))
        })?;
        if !self.snapshots.exists(&base).await? {
            error!(image_id, snapshot = %base, "base snapshot missing for ready image");
            return Err(DraupnirError::Corrupted(format!(
                "base snapshot {base} of image {image_id} is missing"
            )));
        }

        let id = self.records.next_instance_id().await?;
        let _guard = self.locks.exclusive(id).await;

        let mut rollback = Rollback::new();
        match self.acquire(id, &image, &base, &mut rollback).await {
            Ok(provisioned) => {
                rollback.commit();
                info!(
                    instance_id = id,
                    port = provisioned.instance.port,
                    "instance running"
                );
                Ok(provisioned)
            }
            Err(e) => {
                error!(instance_id = id, error = %e, steps = rollback.len(), "provisioning failed, rolling back");
                if let Err(unwind) = rollback.unwind().await {
                    self.mark_failed(id, &unwind).await;
                }
                Err(e)
            }
        }
    }

    async fn acquire<'a>(
        &'a self,
        id: InstanceId,
        image: &Image,
        base: &SnapshotRef,
        rollback: &mut Rollback<'a>,
    ) -> Result<ProvisionedInstance> {
        let port = self.ports.allocate(id).await?;
        {
            let ports = &self.ports;
            rollback.push(
                "release port",
                async move {
                    ports.release(port).await;
                    Ok(())
                }
                .boxed(),
            );
        }

        // Recorded before the clone exists, so a clone that cannot be
        // destroyed later still has a record to hang a retry on.
        let clone = SnapshotRef::clone_of(image.id, id);
        let mut instance = Instance::new(id, image.id, self.hostname.clone(), port, clone.clone());
        self.records.put_instance(&instance).await?;
        {
            let records = &self.records;
            rollback.push("remove record", async move { records.remove_instance(id).await }.boxed());
        }

        // Destroy is idempotent, so it is safe to register before cloning.
        {
            let snapshots = &self.snapshots;
            let clone = clone.clone();
            rollback.push("destroy clone", async move { snapshots.destroy(&clone).await }.boxed());
        }
        self.snapshots.clone_volume(base, id).await?;

        let data_dir = self.snapshots.path(&clone);
        let spec = InstanceSpec {
            instance_id: id,
            image_id: image.id,
            data_dir: data_dir.clone(),
            port,
            tls: self.ca.issue_server(id, &self.hostname)?,
        };
        // Registered first: a start that fails half way may still leave a postmaster behind.
        {
            let runtime = &self.runtime;
            rollback.push(
                "stop database",
                async move {
                    runtime
                        .stop(id, &data_dir)
                        .await
                        .map_err(|e| DraupnirError::Storage(format!("{e:#}")))
                }
                .boxed(),
            );
        }
        self.runtime
            .start(&spec)
            .await
            .map_err(|e| DraupnirError::Storage(format!("starting instance {id} failed: {e:#}")))?;

        let issued = self.ca.issue_client(id)?;
        instance.credential = Some(issued.record);
        instance.set_state(instance.state.start()?);
        self.records.put_instance(&instance).await?;

        Ok(ProvisionedInstance {
            instance,
            client_key: issued.client_key,
        })
    }

    async fn mark_failed(&self, id: InstanceId, cause: &DraupnirError) {
        let result = async {
            if let Some(mut instance) = self.records.get_instance(id).await? {
                instance.set_state(instance.state.fail()?);
                self.records.put_instance(&instance).await?;
            }
            Ok::<_, DraupnirError>(())
        }
        .await;
        match result {
            Ok(()) => warn!(instance_id = id, cause = %cause, "rollback incomplete, instance marked failed"),
            Err(e) => error!(instance_id = id, cause = %cause, error = %e, "rollback incomplete and instance could not be marked failed"),
        }
    }

    /// Tear an instance down: stop, destroy clone, retire credential, remove
    /// record, release port. Safe to call again after a partial failure.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: InstanceId) -> Result<()> {
        let guard = self.locks.exclusive(id).await;
        let mut instance = self.require(id).await?;

        let next = instance.state.begin_teardown()?;
        if instance.state != next {
            instance.set_state(next);
            self.records.put_instance(&instance).await?;
        }

        self.release_resources(&mut instance).await?;

        drop(guard);
        self.locks.prune(&id);
        info!(instance_id = id, "deleted instance");
        Ok(())
    }

    async fn release_resources(&self, instance: &mut Instance) -> Result<()> {
        let id = instance.id;

        if let Some(clone) = instance.snapshot.clone() {
            let data_dir = self.snapshots.path(&clone);
            self.runtime.stop(id, &data_dir).await.map_err(|e| {
                DraupnirError::Storage(format!("stopping instance {id} failed: {e:#}"))
            })?;
            self.snapshots.destroy(&clone).await?;
            instance.snapshot = None;
            instance.updated_at = chrono::Utc::now();
            self.records.put_instance(instance).await?;
        }

        // Destroying the clone removed the only pg_hba.conf that trusted it.
        if let Some(credential) = instance.credential.take() {
            info!(
                instance_id = id,
                serial = %credential.serial,
                fingerprint = %credential.fingerprint,
                "retired credential"
            );
        }

        self.records.remove_whitelisted_addresses(id).await?;
        self.records.remove_instance(id).await?;
        if self.ports.holder(instance.port).await == Some(id) {
            self.ports.release(instance.port).await;
        }
        Ok(())
    }

    pub async fn get(&self, id: InstanceId) -> Result<Instance> {
        self.require(id).await
    }

    /// Record that `ip` may reach the instance's port. Repeat calls only
    /// refresh the timestamp.
    pub async fn whitelist_address(&self, id: InstanceId, ip: IpAddr) -> Result<WhitelistedAddress> {
        let _guard = self.locks.exclusive(id).await;
        self.require(id).await?;
        let address = WhitelistedAddress::new(ip.to_canonical(), id);
        self.records.put_whitelisted_address(&address).await?;
        debug!(instance_id = id, ip = %address.ip_address, "whitelisted address");
        Ok(address)
    }

    pub async fn list(&self) -> Result<Vec<Instance>> {
        self.records.list_instances().await
    }

    async fn require(&self, id: InstanceId) -> Result<Instance> {
        self.records
            .get_instance(id)
            .await?
            .ok_or_else(|| DraupnirError::NotFound(format!("instance {id}")))
    }

    /// Undo provisions interrupted by a crash and sweep clones nobody owns.
    pub(crate) async fn recover(&self, report: &mut RecoveryReport) -> Result<()> {
        let instances = self.records.list_instances().await?;

        for mut instance in instances.iter().cloned() {
            match instance.state {
                InstanceState::Provisioning => {
                    let id = instance.id;
                    let _guard = self.locks.exclusive(id).await;
                    warn!(instance_id = id, "rolling back interrupted provision");
                    match self.release_resources(&mut instance).await {
                        Ok(()) => report.rolled_back.push(id),
                        Err(e) => {
                            self.mark_failed(id, &e).await;
                            report.marked_failed.push(id);
                        }
                    }
                }
                InstanceState::Deleting | InstanceState::Failed => {
                    warn!(
                        instance_id = instance.id,
                        state = instance.state.as_str(),
                        "instance awaits deletion"
                    );
                }
                InstanceState::Running => {}
            }
        }

        let owned: HashSet<InstanceId> = self
            .records
            .list_instances()
            .await?
            .into_iter()
            .map(|i| i.id)
            .collect();
        for manifest in self.snapshots.manifests().await? {
            let SnapshotRef::Clone { instance_id, .. } = manifest.reference else {
                continue;
            };
            if owned.contains(&instance_id) {
                continue;
            }
            warn!(snapshot = %manifest.reference, "removing orphaned clone");
            let data_dir = self.snapshots.path(&manifest.reference);
            if let Err(e) = self.runtime.stop(instance_id, &data_dir).await {
                warn!(instance_id, error = %e, "could not stop orphaned instance");
                continue;
            }
            match self.snapshots.destroy(&manifest.reference).await {
                Ok(()) => report.orphans_removed.push(manifest.reference),
                Err(e) => warn!(instance_id, error = %e, "could not remove orphaned clone"),
            }
        }

        Ok(())
    }
}
