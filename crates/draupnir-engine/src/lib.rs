//! Image and instance lifecycle engine
//!
//! Turns uploaded database backups into sealed base snapshots and clones them
//! into running, TLS-only database instances on unique ports.

pub use draupnir_common as common;

pub mod ca;
mod engine;
pub mod images;
pub mod instances;
pub mod locks;
pub mod ports;
mod process;
pub mod records;
pub mod rollback;
pub mod runtime;
pub mod snapshot;
pub mod whitelist;

#[cfg(any(test, feature = "testing"))]
pub mod test_utils;

pub use ca::{CaConfig, CertificateAuthority, ServerTls};
pub use engine::{Engine, EngineConfig};
pub use images::ImageManager;
pub use instances::{InstanceManager, RecoveryReport};
pub use records::{FileRecordStore, MemoryRecordStore, RecordStore};
pub use runtime::{DatabaseRuntime, InstanceSpec, PostgresConfig, PostgresRuntime};
pub use snapshot::{BtrfsBackend, DirectoryBackend, SnapshotStore, VolumeBackend, VolumeManifest};
pub use whitelist::{Firewall, FirewallRule, IptablesFirewall, ReconcileOutcome, Whitelister};
