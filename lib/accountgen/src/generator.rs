//! Key generator capability
//!
//! One uniform protocol drives heterogeneous key backends: a file-based
//! keystore directory and a PKCS#11-backed HSM slot. Backends move through
//! `Uninitialized -> Ready -> Closed`; operations outside `Ready` fail with
//! [`GeneratorError::BackendNotReady`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::address::Address;
use crate::error::GeneratorError;

/// Lifecycle state shared between a provider and its generators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Uninitialized,
    Ready,
    Closed,
}

/// Outcome of a bulk removal. Removal is explicitly not atomic: a failure
/// on one entry does not prevent attempting the rest.
#[derive(Debug, Default)]
pub struct RemovalReport {
    pub removed: Vec<Address>,
    pub failed: Vec<(Address, String)>,
}

impl RemovalReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorMetadata {
    pub created_at: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DescriptorSigning {
    #[serde(rename = "type")]
    pub signer_type: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slot_index: Option<u64>,
}

/// Non-secret metadata record describing a stored key entry. Used by
/// operators to locate a key; never contains key material.
#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
    pub metadata: DescriptorMetadata,
    pub signing: DescriptorSigning,
}

impl Descriptor {
    pub fn file_based(address: &Address, key_path: &std::path::Path) -> Self {
        Self {
            metadata: DescriptorMetadata {
                created_at: Utc::now(),
                description: "File-based configuration".to_string(),
            },
            signing: DescriptorSigning {
                signer_type: "file-based-signer".to_string(),
                address: address.to_checksum_string(),
                key_path: Some(key_path.display().to_string()),
                slot_index: None,
            },
        }
    }

    pub fn hsm(address: &Address, slot_index: u64) -> Self {
        Self {
            metadata: DescriptorMetadata {
                created_at: Utc::now(),
                description: "HSM configuration".to_string(),
            },
            signing: DescriptorSigning {
                signer_type: "hsm-signer".to_string(),
                address: address.to_checksum_string(),
                key_path: None,
                slot_index: Some(slot_index),
            },
        }
    }

    /// Render the section-based textual form (`[metadata]`, `[signing]`).
    pub fn render(&self) -> Result<String, GeneratorError> {
        toml::to_string(self).map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))
    }
}

/// Uniform capability set over key backends.
#[async_trait]
pub trait KeyGenerator: Send + Sync + std::fmt::Debug {
    /// Allocate a new EC key pair on the backend, issue its binding
    /// certificate and persist the entry under the derived address.
    async fn generate(&self) -> Result<Address, GeneratorError>;

    /// Build the descriptor record for a stored entry without touching
    /// private key material.
    async fn meta_data(&self, address: &Address) -> Result<Descriptor, GeneratorError>;

    /// Existence probe. "Not found" is `Ok(false)`; a failing probe is a
    /// distinct `KeyStoreOperation` error.
    async fn exists(&self, address: &Address) -> Result<bool, GeneratorError>;

    /// Enumerate all stored addresses. Ordering is backend-defined.
    async fn list(&self) -> Result<Vec<Address>, GeneratorError>;

    /// Best-effort bulk delete with partial-failure reporting.
    async fn remove_all(&self) -> Result<RemovalReport, GeneratorError>;
}
