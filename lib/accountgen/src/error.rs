//! Account generator error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeneratorError {
    #[error("Backend initialization failed: {0}")]
    Initialization(String),

    #[error("Backend is not ready")]
    BackendNotReady,

    #[error("Address already exists: {0}")]
    DuplicateAddress(String),

    #[error("Certificate issuance failed: {0}")]
    CertificateIssuance(String),

    #[error("Keystore operation failed: {0}")]
    KeyStoreOperation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),
}
