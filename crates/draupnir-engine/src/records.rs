//! Durable image, instance and whitelist records
//!
//! Every piece of state the engine needs after a restart lives here. Port
//! leases, locks, orphan detection and firewall rules are all derived from
//! these records.

use async_trait::async_trait;
use draupnir_common::{
    DraupnirError, Image, ImageId, Instance, InstanceId, Result, WhitelistedAddress,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn next_image_id(&self) -> Result<ImageId>;
    async fn next_instance_id(&self) -> Result<InstanceId>;

    async fn put_image(&self, image: &Image) -> Result<()>;
    async fn get_image(&self, id: ImageId) -> Result<Option<Image>>;
    /// All images, ordered by id
    async fn list_images(&self) -> Result<Vec<Image>>;
    async fn remove_image(&self, id: ImageId) -> Result<()>;

    async fn put_instance(&self, instance: &Instance) -> Result<()>;
    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>>;
    /// All instances, ordered by id
    async fn list_instances(&self) -> Result<Vec<Instance>>;
    async fn remove_instance(&self, id: InstanceId) -> Result<()>;

    /// Insert the address for its instance, or bump `updated_at` if present
    async fn put_whitelisted_address(&self, address: &WhitelistedAddress) -> Result<()>;
    /// Every whitelisted address, ordered by instance id
    async fn list_whitelisted_addresses(&self) -> Result<Vec<WhitelistedAddress>>;
    async fn remove_whitelisted_addresses(&self, instance_id: InstanceId) -> Result<()>;

    async fn instances_of_image(&self, image_id: ImageId) -> Result<Vec<Instance>> {
        Ok(self
            .list_instances()
            .await?
            .into_iter()
            .filter(|instance| instance.image_id == image_id)
            .collect())
    }
}

// In-memory storage implementation for development/testing
pub struct MemoryRecordStore {
    images: Arc<RwLock<BTreeMap<ImageId, Image>>>,
    instances: Arc<RwLock<BTreeMap<InstanceId, Instance>>>,
    whitelist: Arc<RwLock<BTreeMap<InstanceId, Vec<WhitelistedAddress>>>>,
    image_seq: AtomicU64,
    instance_seq: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self {
            images: Arc::new(RwLock::new(BTreeMap::new())),
            instances: Arc::new(RwLock::new(BTreeMap::new())),
            whitelist: Arc::new(RwLock::new(BTreeMap::new())),
            image_seq: AtomicU64::new(0),
            instance_seq: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn next_image_id(&self) -> Result<ImageId> {
        Ok(self.image_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn next_instance_id(&self) -> Result<InstanceId> {
        Ok(self.instance_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn put_image(&self, image: &Image) -> Result<()> {
        self.images.write().await.insert(image.id, image.clone());
        Ok(())
    }

    async fn get_image(&self, id: ImageId) -> Result<Option<Image>> {
        Ok(self.images.read().await.get(&id).cloned())
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        Ok(self.images.read().await.values().cloned().collect())
    }

    async fn remove_image(&self, id: ImageId) -> Result<()> {
        self.images.write().await.remove(&id);
        Ok(())
    }

    async fn put_instance(&self, instance: &Instance) -> Result<()> {
        self.instances
            .write()
            .await
            .insert(instance.id, instance.clone());
        Ok(())
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        Ok(self.instances.read().await.get(&id).cloned())
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        Ok(self.instances.read().await.values().cloned().collect())
    }

    async fn remove_instance(&self, id: InstanceId) -> Result<()> {
        self.instances.write().await.remove(&id);
        Ok(())
    }

    async fn put_whitelisted_address(&self, address: &WhitelistedAddress) -> Result<()> {
        let mut whitelist = self.whitelist.write().await;
        upsert_address(whitelist.entry(address.instance_id).or_default(), address);
        Ok(())
    }

    async fn list_whitelisted_addresses(&self) -> Result<Vec<WhitelistedAddress>> {
        Ok(self.whitelist.read().await.values().flatten().cloned().collect())
    }

    async fn remove_whitelisted_addresses(&self, instance_id: InstanceId) -> Result<()> {
        self.whitelist.write().await.remove(&instance_id);
        Ok(())
    }
}

fn upsert_address(entries: &mut Vec<WhitelistedAddress>, address: &WhitelistedAddress) {
    match entries
        .iter_mut()
        .find(|existing| existing.ip_address == address.ip_address)
    {
        Some(existing) => existing.updated_at = address.updated_at,
        None => entries.push(address.clone()),
    }
}

#[derive(Clone, Copy)]
enum Sequence {
    Image,
    Instance,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Sequences {
    image: u64,
    instance: u64,
}

/// JSON-file record store.
///
/// Layout under `root`:
/// ```text
/// sequences.json
/// images/<id>.json
/// instances/<id>.json
/// whitelist/<instance id>.json
/// ```
/// Every write goes to a sibling temp file first and is renamed into place.
pub struct FileRecordStore {
    root: PathBuf,
    sequences: Mutex<Sequences>,
    whitelist_lock: Mutex<()>,
}

impl FileRecordStore {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("images")).await?;
        fs::create_dir_all(root.join("instances")).await?;
        fs::create_dir_all(root.join("whitelist")).await?;

        let sequences_path = root.join("sequences.json");
        let mut sequences: Sequences = if fs::try_exists(&sequences_path).await? {
            read_json(&sequences_path).await?
        } else {
            Sequences::default()
        };

        // Never hand out an id that is already on disk, even if the
        // sequence file was lost.
        let max_image = max_record_id(&root.join("images")).await?;
        let max_instance = max_record_id(&root.join("instances")).await?;
        sequences.image = sequences.image.max(max_image);
        sequences.instance = sequences.instance.max(max_instance);

        debug!(root = %root.display(), image_seq = sequences.image, instance_seq = sequences.instance, "opened record store");
        Ok(Self {
            root,
            sequences: Mutex::new(sequences),
            whitelist_lock: Mutex::new(()),
        })
    }

    fn image_path(&self, id: ImageId) -> PathBuf {
        self.root.join("images").join(format!("{id}.json"))
    }

    fn instance_path(&self, id: InstanceId) -> PathBuf {
        self.root.join("instances").join(format!("{id}.json"))
    }

    fn whitelist_path(&self, instance_id: InstanceId) -> PathBuf {
        self.root.join("whitelist").join(format!("{instance_id}.json"))
    }

    async fn bump(&self, kind: Sequence) -> Result<u64> {
        let mut sequences = self.sequences.lock().await;
        let counter = match kind {
            Sequence::Image => &mut sequences.image,
            Sequence::Instance => &mut sequences.instance,
        };
        *counter += 1;
        let next = *counter;
        write_json_atomic(&self.root.join("sequences.json"), &*sequences).await?;
        Ok(next)
    }
}

#[async_trait]
impl RecordStore for FileRecordStore {
    async fn next_image_id(&self) -> Result<ImageId> {
        self.bump(Sequence::Image).await
    }

    async fn next_instance_id(&self) -> Result<InstanceId> {
        self.bump(Sequence::Instance).await
    }

    async fn put_image(&self, image: &Image) -> Result<()> {
        write_json_atomic(&self.image_path(image.id), image).await
    }

    async fn get_image(&self, id: ImageId) -> Result<Option<Image>> {
        read_optional(&self.image_path(id)).await
    }

    async fn list_images(&self) -> Result<Vec<Image>> {
        read_all(&self.root.join("images")).await
    }

    async fn remove_image(&self, id: ImageId) -> Result<()> {
        remove_if_present(&self.image_path(id)).await
    }

    async fn put_instance(&self, instance: &Instance) -> Result<()> {
        write_json_atomic(&self.instance_path(instance.id), instance).await
    }

    async fn get_instance(&self, id: InstanceId) -> Result<Option<Instance>> {
        read_optional(&self.instance_path(id)).await
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        read_all(&self.root.join("instances")).await
    }

    async fn remove_instance(&self, id: InstanceId) -> Result<()> {
        remove_if_present(&self.instance_path(id)).await
    }

    async fn put_whitelisted_address(&self, address: &WhitelistedAddress) -> Result<()> {
        let _guard = self.whitelist_lock.lock().await;
        let path = self.whitelist_path(address.instance_id);
        let mut entries: Vec<WhitelistedAddress> = read_optional(&path).await?.unwrap_or_default();
        upsert_address(&mut entries, address);
        write_json_atomic(&path, &entries).await
    }

    async fn list_whitelisted_addresses(&self) -> Result<Vec<WhitelistedAddress>> {
        let per_instance: Vec<Vec<WhitelistedAddress>> = read_all(&self.root.join("whitelist")).await?;
        Ok(per_instance.into_iter().flatten().collect())
    }

    async fn remove_whitelisted_addresses(&self, instance_id: InstanceId) -> Result<()> {
        let _guard = self.whitelist_lock.lock().await;
        remove_if_present(&self.whitelist_path(instance_id)).await
    }
}

pub(crate) async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| DraupnirError::Internal(format!("failed to encode {}: {e}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DraupnirError::Corrupted(format!("unreadable record {}: {e}", path.display())))
}

async fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
            DraupnirError::Corrupted(format!("unreadable record {}: {e}", path.display()))
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_all<T: DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
    let mut ids = record_ids(dir).await?;
    ids.sort_unstable();

    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        // A record removed between listing and reading is simply skipped.
        if let Some(record) = read_optional(&dir.join(format!("{id}.json"))).await? {
            records.push(record);
        }
    }
    Ok(records)
}

async fn record_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(id) = name.strip_suffix(".json").and_then(|s| s.parse::<u64>().ok()) {
            ids.push(id);
        }
    }
    Ok(ids)
}

async fn max_record_id(dir: &Path) -> Result<u64> {
    Ok(record_ids(dir).await?.into_iter().max().unwrap_or(0))
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use draupnir_common::SnapshotRef;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_store_roundtrip_and_reopen() {
        let temp_dir = tempdir().unwrap();

        {
            let store = FileRecordStore::open(temp_dir.path()).await.unwrap();
            let id = store.next_image_id().await.unwrap();
            assert_eq!(id, 1);
            store
                .put_image(&Image::new(id, Utc::now(), None))
                .await
                .unwrap();

            let instance_id = store.next_instance_id().await.unwrap();
            let instance = Instance::new(
                instance_id,
                id,
                "localhost".into(),
                5433,
                SnapshotRef::clone_of(id, instance_id),
            );
            store.put_instance(&instance).await.unwrap();
        }

        let store = FileRecordStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(store.list_images().await.unwrap().len(), 1);
        assert_eq!(store.instances_of_image(1).await.unwrap().len(), 1);
        assert_eq!(store.get_instance(1).await.unwrap().unwrap().port, 5433);
        assert_eq!(store.next_image_id().await.unwrap(), 2);
        assert_eq!(store.next_instance_id().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ids_survive_lost_sequence_file() {
        let temp_dir = tempdir().unwrap();
        {
            let store = FileRecordStore::open(temp_dir.path()).await.unwrap();
            for _ in 0..3 {
                let id = store.next_image_id().await.unwrap();
                store.put_image(&Image::new(id, Utc::now(), None)).await.unwrap();
            }
        }
        fs::remove_file(temp_dir.path().join("sequences.json"))
            .await
            .unwrap();

        let store = FileRecordStore::open(temp_dir.path()).await.unwrap();
        assert_eq!(store.next_image_id().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_remove_missing_record_is_ok() {
        let temp_dir = tempdir().unwrap();
        let store = FileRecordStore::open(temp_dir.path()).await.unwrap();
        store.remove_image(42).await.unwrap();
        assert!(store.get_image(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_whitelisted_address_upsert() {
        let temp_dir = tempdir().unwrap();
        let store = FileRecordStore::open(temp_dir.path()).await.unwrap();
        let ip: std::net::IpAddr = "203.0.113.7".parse().unwrap();

        let first = WhitelistedAddress::new(ip, 4);
        store.put_whitelisted_address(&first).await.unwrap();
        let mut again = WhitelistedAddress::new(ip, 4);
        again.updated_at = first.updated_at + chrono::Duration::seconds(30);
        store.put_whitelisted_address(&again).await.unwrap();
        store
            .put_whitelisted_address(&WhitelistedAddress::new(ip, 9))
            .await
            .unwrap();

        let listed = store.list_whitelisted_addresses().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].instance_id, 4);
        assert_eq!(listed[0].created_at, first.created_at);
        assert_eq!(listed[0].updated_at, again.updated_at);

        store.remove_whitelisted_addresses(4).await.unwrap();
        let listed = store.list_whitelisted_addresses().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].instance_id, 9);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_id() {
        let store = MemoryRecordStore::new();
        for _ in 0..3 {
            let id = store.next_image_id().await.unwrap();
            store.put_image(&Image::new(id, Utc::now(), None)).await.unwrap();
        }
        let ids: Vec<_> = store.list_images().await.unwrap().iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
