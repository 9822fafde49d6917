// Re-export dependencies used in public interfaces of common types

pub use chrono;
pub use serde::{Deserialize, Serialize};
use thiserror::Error;

mod models;
pub mod version;

pub use models::{
    ClientKey, CredentialRecord, Image, ImageId, ImageState, Instance, InstanceId, InstanceState,
    IssuedCredential, ProvisionedInstance, SnapshotRef, WhitelistedAddress,
};

#[derive(Error, Debug)]
pub enum DraupnirError {
    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Image {0} is not ready")]
    ImageNotReady(ImageId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid Transition: cannot {action} while {state}")]
    InvalidTransition { state: String, action: &'static str },

    #[error("Storage Error: {0}")]
    Storage(String),

    #[error("Resource Exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Corrupted: {0}")]
    Corrupted(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl DraupnirError {
    /// Whether the caller can act on this error (as opposed to a server-side fault).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DraupnirError::NotFound(_)
                | DraupnirError::ImageNotReady(_)
                | DraupnirError::Conflict(_)
                | DraupnirError::InvalidTransition { .. }
                | DraupnirError::ResourceExhausted(_)
        )
    }
}

// Define the primary Result type for Draupnir operations
pub type Result<T> = std::result::Result<T, DraupnirError>;
