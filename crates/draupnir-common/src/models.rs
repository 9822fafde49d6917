use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

use crate::{DraupnirError, Result};

pub type ImageId = u64;
pub type InstanceId = u64;

/// Readiness of an image. Deletion removes the record outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Pending,
    Ready,
}

impl ImageState {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageState::Pending => "pending",
            ImageState::Ready => "ready",
        }
    }

    /// `pending -> ready`. Any other starting state is rejected.
    pub fn finalize(self) -> Result<ImageState> {
        match self {
            ImageState::Pending => Ok(ImageState::Ready),
            ImageState::Ready => Err(DraupnirError::InvalidTransition {
                state: self.as_str().to_string(),
                action: "finalize",
            }),
        }
    }
}

/// Reference to a volume held by the snapshot store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SnapshotRef {
    /// Sealed, read-only base snapshot of an image
    Base { image_id: ImageId },
    /// Writable copy-on-write clone owned by one instance
    Clone {
        instance_id: InstanceId,
        image_id: ImageId,
    },
}

impl SnapshotRef {
    pub fn base(image_id: ImageId) -> Self {
        SnapshotRef::Base { image_id }
    }

    pub fn clone_of(image_id: ImageId, instance_id: InstanceId) -> Self {
        SnapshotRef::Clone {
            instance_id,
            image_id,
        }
    }

    pub fn image_id(&self) -> ImageId {
        match self {
            SnapshotRef::Base { image_id } | SnapshotRef::Clone { image_id, .. } => *image_id,
        }
    }

    pub fn is_base(&self) -> bool {
        matches!(self, SnapshotRef::Base { .. })
    }

    /// Stable file-name friendly key, e.g. `base-3` or `clone-12`.
    pub fn key(&self) -> String {
        match self {
            SnapshotRef::Base { image_id } => format!("base-{image_id}"),
            SnapshotRef::Clone { instance_id, .. } => format!("clone-{instance_id}"),
        }
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: ImageId,
    pub backed_up_at: DateTime<Utc>,
    pub anonymisation_script: Option<String>,
    pub state: ImageState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub snapshot: Option<SnapshotRef>,
}

impl Image {
    pub fn new(id: ImageId, backed_up_at: DateTime<Utc>, anonymisation_script: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            backed_up_at,
            anonymisation_script: anonymisation_script.filter(|s| !s.trim().is_empty()),
            state: ImageState::Pending,
            created_at: now,
            updated_at: now,
            snapshot: None,
        }
    }

    pub fn ready(&self) -> bool {
        self.state == ImageState::Ready
    }

    /// Record a sealed base snapshot and move to `ready`.
    pub fn mark_ready(&mut self, snapshot: SnapshotRef) -> Result<()> {
        self.state = self.state.finalize()?;
        self.snapshot = Some(snapshot);
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Lifecycle of an instance record.
///
/// `provisioning -> running -> deleting -> (removed)`. A provisioning attempt
/// whose rollback could not complete lands in `failed`; deleting a `failed`
/// instance finishes the cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Provisioning,
    Running,
    Deleting,
    Failed,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Provisioning => "provisioning",
            InstanceState::Running => "running",
            InstanceState::Deleting => "deleting",
            InstanceState::Failed => "failed",
        }
    }

    pub fn start(self) -> Result<InstanceState> {
        match self {
            InstanceState::Provisioning => Ok(InstanceState::Running),
            other => Err(other.invalid("mark running")),
        }
    }

    pub fn fail(self) -> Result<InstanceState> {
        match self {
            InstanceState::Provisioning | InstanceState::Failed => Ok(InstanceState::Failed),
            other => Err(other.invalid("mark failed")),
        }
    }

    /// Teardown may be (re)entered from `running`, `failed` or a previous
    /// interrupted `deleting`.
    pub fn begin_teardown(self) -> Result<InstanceState> {
        match self {
            InstanceState::Running | InstanceState::Deleting | InstanceState::Failed => {
                Ok(InstanceState::Deleting)
            }
            other => Err(other.invalid("delete")),
        }
    }

    fn invalid(self, action: &'static str) -> DraupnirError {
        DraupnirError::InvalidTransition {
            state: self.as_str().to_string(),
            action,
        }
    }
}

/// Durable view of an issued credential. The private key is never part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Same value as the owning instance id
    pub id: InstanceId,
    pub serial: String,
    pub fingerprint: String,
    pub ca_certificate: String,
    pub client_certificate: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub image_id: ImageId,
    pub hostname: String,
    pub port: u16,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub snapshot: Option<SnapshotRef>,
    pub credential: Option<CredentialRecord>,
}

impl Instance {
    pub fn new(id: InstanceId, image_id: ImageId, hostname: String, port: u16, snapshot: SnapshotRef) -> Self {
        let now = Utc::now();
        Self {
            id,
            image_id,
            hostname,
            port,
            state: InstanceState::Provisioning,
            created_at: now,
            updated_at: now,
            snapshot: Some(snapshot),
            credential: None,
        }
    }

    pub fn set_state(&mut self, state: InstanceState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}

/// A client address allowed through the firewall to one instance's port.
///
/// Recorded whenever the client creates or looks up the instance; the pair
/// `(ip_address, instance_id)` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhitelistedAddress {
    pub ip_address: IpAddr,
    pub instance_id: InstanceId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WhitelistedAddress {
    pub fn new(ip_address: IpAddr, instance_id: InstanceId) -> Self {
        let now = Utc::now();
        Self {
            ip_address,
            instance_id,
            created_at: now,
            updated_at: now,
        }
    }
}

/// PEM private key for a freshly issued client certificate.
///
/// Can be read exactly once; it is not `Clone` and never serialized.
pub struct ClientKey(String);

impl ClientKey {
    pub fn new(pem: String) -> Self {
        Self(pem)
    }

    pub fn into_pem(self) -> String {
        self.0
    }
}

impl fmt::Debug for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientKey(<redacted>)")
    }
}

#[derive(Debug)]
pub struct IssuedCredential {
    pub record: CredentialRecord,
    pub client_key: ClientKey,
}

/// Result of a successful provision: the record plus the one-time key.
#[derive(Debug)]
pub struct ProvisionedInstance {
    pub instance: Instance,
    pub client_key: ClientKey,
}
