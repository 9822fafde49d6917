//! TCP port leases for instances

use draupnir_common::{DraupnirError, InstanceId, Result};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Hands out ports from a bounded range, lowest free port first.
///
/// The lease table is keyed by port and names the owning instance. It is
/// never persisted on its own: on startup it is rebuilt from the instance
/// records through [`PortAllocator::recover`].
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    leases: Mutex<BTreeMap<u16, InstanceId>>,
}

impl PortAllocator {
    pub fn new(low: u16, high: u16) -> Result<Self> {
        if low > high {
            return Err(DraupnirError::Config(format!(
                "invalid instance port range {low}-{high}"
            )));
        }
        Ok(Self {
            range: low..=high,
            leases: Mutex::new(BTreeMap::new()),
        })
    }

    /// Build an allocator whose lease table reflects existing instances.
    pub fn recover(
        low: u16,
        high: u16,
        existing: impl IntoIterator<Item = (InstanceId, u16)>,
    ) -> Result<Self> {
        let allocator = Self::new(low, high)?;
        let mut leases = BTreeMap::new();
        for (instance_id, port) in existing {
            if !allocator.range.contains(&port) {
                // Still in use, but can never collide with an allocation from the current range.
                warn!(instance_id, port, "instance port lies outside the configured range");
                continue;
            }
            if let Some(previous) = leases.insert(port, instance_id) {
                warn!(port, previous, instance_id, "port leased to more than one instance");
            }
        }
        Ok(Self {
            leases: Mutex::new(leases),
            ..allocator
        })
    }

    pub fn range(&self) -> RangeInclusive<u16> {
        self.range.clone()
    }

    /// Lease the lowest unused port to `owner`.
    pub async fn allocate(&self, owner: InstanceId) -> Result<u16> {
        let mut leases = self.leases.lock().await;
        let port = self
            .range
            .clone()
            .find(|port| !leases.contains_key(port))
            .ok_or_else(|| {
                DraupnirError::ResourceExhausted(format!(
                    "no free instance ports in {}-{}",
                    self.range.start(),
                    self.range.end()
                ))
            })?;
        leases.insert(port, owner);
        debug!(port, instance_id = owner, "leased port");
        Ok(port)
    }

    /// Return a port to the free set. Releasing a free port is a no-op.
    pub async fn release(&self, port: u16) {
        if let Some(owner) = self.leases.lock().await.remove(&port) {
            debug!(port, instance_id = owner, "released port");
        }
    }

    pub async fn holder(&self, port: u16) -> Option<InstanceId> {
        self.leases.lock().await.get(&port).copied()
    }

    pub async fn leased(&self) -> Vec<(u16, InstanceId)> {
        self.leases
            .lock()
            .await
            .iter()
            .map(|(port, owner)| (*port, *owner))
            .collect()
    }

    pub async fn available(&self) -> usize {
        let leases = self.leases.lock().await;
        self.range
            .clone()
            .filter(|port| !leases.contains_key(port))
            .count()
    }
}
