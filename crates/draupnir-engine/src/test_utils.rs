//! Fakes, fixtures and host capability checks for tests

use crate::runtime::{DatabaseRuntime, InstanceSpec};
use crate::snapshot::VolumeBackend;
use crate::whitelist::{Firewall, FirewallRule};
use crate::{DirectoryBackend, Engine, EngineConfig, MemoryRecordStore};
use anyhow::{bail, Result};
use async_trait::async_trait;
use draupnir_common::{ImageId, InstanceId};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// In-process stand-in for a database runtime.
///
/// A "running" instance is a `postmaster.pid` file in its data directory plus
/// an entry in [`FakeRuntime::running`]. Failures can be switched on per call.
#[derive(Default)]
pub struct FakeRuntime {
    running: Mutex<BTreeMap<InstanceId, PathBuf>>,
    anonymised: Mutex<Vec<(ImageId, String)>>,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    fail_anonymise: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    pub fn fail_anonymise(&self, fail: bool) {
        self.fail_anonymise.store(fail, Ordering::SeqCst);
    }

    pub fn running(&self) -> Vec<InstanceId> {
        self.running.lock().unwrap().keys().copied().collect()
    }

    pub fn is_running(&self, id: InstanceId) -> bool {
        self.running.lock().unwrap().contains_key(&id)
    }

    /// Scripts handed to `anonymise`, in call order
    pub fn anonymised(&self) -> Vec<(ImageId, String)> {
        self.anonymised.lock().unwrap().clone()
    }
}

#[async_trait]
impl DatabaseRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn anonymise(&self, image_id: ImageId, data_dir: &Path, script: &str) -> Result<()> {
        if self.fail_anonymise.load(Ordering::SeqCst) {
            bail!("psql: ERROR: relation \"users\" does not exist");
        }
        if !data_dir.join("PG_VERSION").is_file() {
            bail!("{} is not a data directory", data_dir.display());
        }
        self.anonymised
            .lock()
            .unwrap()
            .push((image_id, script.to_string()));
        Ok(())
    }

    async fn start(&self, spec: &InstanceSpec) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            bail!("pg_ctl: could not start server");
        }
        tokio::fs::write(spec.data_dir.join("postmaster.pid"), spec.port.to_string()).await?;
        tokio::fs::write(spec.data_dir.join("server.crt"), &spec.tls.certificate).await?;
        self.running
            .lock()
            .unwrap()
            .insert(spec.instance_id, spec.data_dir.clone());
        Ok(())
    }

    async fn stop(&self, instance_id: InstanceId, data_dir: &Path) -> Result<()> {
        if self.fail_stop.load(Ordering::SeqCst) {
            bail!("pg_ctl: server does not shut down");
        }
        match tokio::fs::remove_file(data_dir.join("postmaster.pid")).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.running.lock().unwrap().remove(&instance_id);
        Ok(())
    }
}

/// Directory backend whose deletes can be switched to fail
#[derive(Default)]
pub struct FaultyBackend {
    inner: DirectoryBackend,
    fail_delete: AtomicBool,
}

impl FaultyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl VolumeBackend for FaultyBackend {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn create(&self, path: &Path) -> Result<()> {
        self.inner.create(path).await
    }

    async fn snapshot(&self, source: &Path, dest: &Path, read_only: bool) -> Result<()> {
        self.inner.snapshot(source, dest, read_only).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        if self.fail_delete.load(Ordering::SeqCst) {
            bail!("device or resource busy: {}", path.display());
        }
        self.inner.delete(path).await
    }
}

/// Firewall that keeps its chain in memory
#[derive(Default)]
pub struct FakeFirewall {
    rules: Mutex<BTreeSet<FirewallRule>>,
    fail_add: AtomicBool,
}

impl FakeFirewall {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_add(&self, fail: bool) {
        self.fail_add.store(fail, Ordering::SeqCst);
    }

    /// Put a rule in place as if someone else had added it
    pub fn insert(&self, rule: FirewallRule) {
        self.rules.lock().unwrap().insert(rule);
    }

    pub fn rules_now(&self) -> Vec<FirewallRule> {
        self.rules.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl Firewall for FakeFirewall {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn ensure_chain(&self) -> Result<()> {
        Ok(())
    }

    async fn rules(&self) -> Result<Vec<FirewallRule>> {
        Ok(self.rules_now())
    }

    async fn add(&self, rule: &FirewallRule) -> Result<()> {
        if self.fail_add.load(Ordering::SeqCst) {
            bail!("iptables: Resource temporarily unavailable");
        }
        self.rules.lock().unwrap().insert(rule.clone());
        Ok(())
    }

    async fn remove(&self, rule: &FirewallRule) -> Result<()> {
        self.rules.lock().unwrap().remove(rule);
        Ok(())
    }
}

pub fn test_config(data_path: &Path) -> EngineConfig {
    EngineConfig {
        data_path: data_path.to_path_buf(),
        min_port: 15433,
        max_port: 15532,
        public_hostname: "draupnir.test".to_string(),
        ..EngineConfig::default()
    }
}

/// Engine over a directory backend, file-backed records and the given runtime.
pub async fn open_engine(config: EngineConfig, runtime: Arc<FakeRuntime>) -> Engine {
    Engine::open(config, Arc::new(DirectoryBackend::new()), runtime)
        .await
        .expect("open engine")
}

/// Engine with file-backed records over an arbitrary volume backend
pub async fn open_engine_with_backend(
    config: EngineConfig,
    backend: Arc<dyn VolumeBackend>,
    runtime: Arc<FakeRuntime>,
) -> Engine {
    Engine::open(config, backend, runtime)
        .await
        .expect("open engine")
}

/// Engine whose records live only in memory
pub async fn memory_engine(config: EngineConfig, runtime: Arc<FakeRuntime>) -> Engine {
    Engine::with_store(
        config,
        Arc::new(MemoryRecordStore::new()),
        Arc::new(DirectoryBackend::new()),
        runtime,
    )
    .await
    .expect("open engine")
}

/// Write a minimal data directory into an image's staging volume.
pub async fn stage_artifact(engine: &Engine, image_id: ImageId) {
    let staging = engine.config().data_path.join("image_uploads").join(image_id.to_string());
    tokio::fs::create_dir_all(&staging).await.expect("staging dir");
    tokio::fs::write(staging.join("PG_VERSION"), b"16\n")
        .await
        .expect("write artifact");
}

/// Deliver `bytes` as the only file in an image's staging volume.
pub async fn stage_archive(engine: &Engine, image_id: ImageId, name: &str, bytes: &[u8]) {
    let staging = engine.config().data_path.join("image_uploads").join(image_id.to_string());
    tokio::fs::create_dir_all(&staging).await.expect("staging dir");
    tokio::fs::write(staging.join(name), bytes)
        .await
        .expect("write archive");
}

/// An in-memory tar holding the given files
pub fn tar_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o600);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).expect("append tar entry");
    }
    builder.into_inner().expect("finish tar")
}

/// A tar whose first file is complete and whose second is cut off mid-data
pub fn truncated_tar() -> Vec<u8> {
    let big = vec![7u8; 4096];
    let mut bytes = tar_archive(&[("PG_VERSION", &b"16\n"[..]), ("base.dat", &big[..])]);
    // header + padded PG_VERSION + header + part of base.dat
    bytes.truncate(512 * 3 + 1000);
    bytes
}

pub fn has_btrfs() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }

    Command::new("btrfs")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

pub fn has_postgres() -> bool {
    Command::new("pg_ctl")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Skip the calling test when btrfs tooling is missing
#[macro_export]
macro_rules! require_btrfs {
    () => {
        if !$crate::test_utils::has_btrfs() {
            eprintln!("Test ignored: btrfs not available");
            return;
        }
    };
}

#[macro_export]
macro_rules! require_postgres {
    () => {
        if !$crate::test_utils::has_postgres() {
            eprintln!("Test ignored: PostgreSQL not available");
            return;
        }
    };
}
