//! Account generation library
//!
//! Generates secp256k1 key pairs, derives checksummed 20-byte addresses
//! from the public key, issues a self-signed binding certificate and
//! persists the entry on a pluggable backend: an encrypted file keystore
//! or a PKCS#11 token.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod address;
pub mod cavium;
pub mod certificate;
pub mod error;
pub mod filebased;
pub mod generator;

pub use address::Address;
pub use cavium::{CaviumConfig, CaviumProvider, HsmKeyGenerator};
pub use certificate::{Certificate, CertificateSigner, SoftwareSigner};
pub use error::GeneratorError;
pub use filebased::{FileBasedConfig, FileBasedKeyGenerator, FileBasedProvider};
pub use generator::{BackendState, Descriptor, KeyGenerator, RemovalReport};
