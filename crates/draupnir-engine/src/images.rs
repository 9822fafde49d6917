//! Image lifecycle: `pending -> ready -> (removed)`

use chrono::{DateTime, Utc};
use draupnir_common::{DraupnirError, Image, ImageId, Result, SnapshotRef};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::locks::KeyedLocks;
use crate::records::RecordStore;
use crate::runtime::DatabaseRuntime;
use crate::snapshot::SnapshotStore;

pub struct ImageManager {
    records: Arc<dyn RecordStore>,
    snapshots: Arc<SnapshotStore>,
    runtime: Arc<dyn DatabaseRuntime>,
    locks: Arc<KeyedLocks<ImageId>>,
}

impl ImageManager {
    pub(crate) fn new(
        records: Arc<dyn RecordStore>,
        snapshots: Arc<SnapshotStore>,
        runtime: Arc<dyn DatabaseRuntime>,
        locks: Arc<KeyedLocks<ImageId>>,
    ) -> Self {
        Self {
            records,
            snapshots,
            runtime,
            locks,
        }
    }

    /// Register a new `pending` image and prepare its staging volume.
    #[instrument(skip(self, anonymisation_script), fields(has_script = anonymisation_script.is_some()))]
    pub async fn create(
        &self,
        backed_up_at: DateTime<Utc>,
        anonymisation_script: Option<String>,
    ) -> Result<Image> {
        let id = self.records.next_image_id().await?;
        let image = Image::new(id, backed_up_at, anonymisation_script);
        self.records.put_image(&image).await?;

        if let Err(e) = self.snapshots.prepare_staging(id).await {
            error!(image_id = id, error = %e, "failed to prepare staging volume");
            if let Err(cleanup) = self.records.remove_image(id).await {
                warn!(image_id = id, error = %cleanup, "could not remove image record after staging failure");
            }
            return Err(match e {
                DraupnirError::Io(io) => DraupnirError::Storage(io.to_string()),
                other => other,
            });
        }

        info!(image_id = id, "created image");
        Ok(image)
    }

    /// Seal the staged upload into the image's base snapshot.
    ///
    /// Finalizing a ready image returns it unchanged as long as its base
    /// snapshot is still present.
    #[instrument(skip(self))]
    pub async fn finalize(&self, id: ImageId) -> Result<Image> {
        let _guard = self.locks.exclusive(id).await;
        let mut image = self.require(id).await?;

        if image.ready() {
            let base = image.snapshot.clone().unwrap_or_else(|| SnapshotRef::base(id));
            if !self.snapshots.exists(&base).await? {
                error!(image_id = id, snapshot = %base, "ready image has no base snapshot");
                return Err(DraupnirError::Corrupted(format!(
                    "image {id} is ready but its base snapshot {base} is missing"
                )));
            }
            info!(image_id = id, "image already finalized");
            return Ok(image);
        }

        if !self.snapshots.has_staged_artifact(id).await? {
            return Err(DraupnirError::NotFound(format!(
                "no uploaded artifact staged for image {id}"
            )));
        }
        self.snapshots.unpack_staged(id).await?;
        let staging = self.snapshots.staging_path(id);

        if let Some(script) = image.anonymisation_script.as_deref() {
            self.runtime
                .anonymise(id, &staging, script)
                .await
                .map_err(|e| DraupnirError::Storage(format!("anonymisation of image {id} failed: {e:#}")))?;
        }

        let base = self.snapshots.seal_base(id, &staging).await?;
        image.mark_ready(base.clone())?;
        if let Err(e) = self.records.put_image(&image).await {
            // Keep disk and records in agreement: the image stays pending.
            if let Err(cleanup) = self.snapshots.destroy(&base).await {
                warn!(image_id = id, error = %cleanup, "could not discard base after failed record update");
            }
            return Err(e);
        }

        info!(image_id = id, snapshot = %base, "image ready");
        Ok(image)
    }

    /// Remove an image and its base snapshot. Refused while instances use it.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: ImageId) -> Result<()> {
        // Provisioning holds the shared side, so no new instance can appear
        // between the dependent check and the removal.
        let guard = self.locks.exclusive(id).await;
        let image = self.require(id).await?;

        let dependents = self.records.instances_of_image(id).await?;
        if !dependents.is_empty() {
            let ids: Vec<String> = dependents.iter().map(|i| i.id.to_string()).collect();
            return Err(DraupnirError::Conflict(format!(
                "image {id} still has instances: {}",
                ids.join(", ")
            )));
        }

        if let Some(base) = &image.snapshot {
            self.snapshots.destroy(base).await?;
        }
        self.snapshots.discard_staging(id).await?;
        self.records.remove_image(id).await?;

        drop(guard);
        self.locks.prune(&id);
        info!(image_id = id, "deleted image");
        Ok(())
    }

    pub async fn get(&self, id: ImageId) -> Result<Image> {
        self.require(id).await
    }

    pub async fn list(&self) -> Result<Vec<Image>> {
        self.records.list_images().await
    }

    async fn require(&self, id: ImageId) -> Result<Image> {
        self.records
            .get_image(id)
            .await?
            .ok_or_else(|| DraupnirError::NotFound(format!("image {id}")))
    }
}
