//! PKCS#11 (Cavium) key generator backend
//!
//! Key pairs are generated inside the token and never leave it. The
//! certificate is signed by the token over the to-be-signed bytes and stored
//! alongside the key pair as a token object. All three objects carry the
//! checksummed address as their label.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, CertificateType, KeyType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::types::AuthPin;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::address::Address;
use crate::certificate::{
    self, CertificateSigner, CERTIFICATE_COMMON_NAME, CERTIFICATE_VALIDITY_DAYS,
};
use crate::error::GeneratorError;
use crate::generator::{BackendState, Descriptor, KeyGenerator, RemovalReport};

// DER-encoded OID for secp256k1 (1.3.132.0.10)
const SECP256K1_OID_DER: [u8; 7] = [0x06, 0x05, 0x2B, 0x81, 0x04, 0x00, 0x0A];

/// Resolved Cavium backend configuration.
#[derive(Clone, Deserialize)]
pub struct CaviumConfig {
    /// Path of the PKCS#11 library to load.
    pub library: String,
    /// Crypto user credentials for the slot.
    pub pin: String,
    /// Path of the session auth script used by operator tooling.
    pub sas: String,
    /// Index into the token-bearing slot list.
    #[serde(default)]
    pub slot: usize,
}

impl fmt::Debug for CaviumConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaviumConfig")
            .field("library", &self.library)
            .field("pin", &"<redacted>")
            .field("sas", &self.sas)
            .field("slot", &self.slot)
            .finish()
    }
}

impl CaviumConfig {
    /// Resolve configuration from the `[cavium-generator]` table when
    /// present, falling back to `AWS_HSM_LIB` / `AWS_HSM_PIN` /
    /// `AWS_HSM_SAS` / `AWS_HSM_SLOT` environment variables.
    pub fn resolve(table: Option<&toml::Table>) -> Result<Self, GeneratorError> {
        if let Some(table) = table {
            if !table.is_empty() {
                return table.clone().try_into().map_err(|e: toml::de::Error| {
                    GeneratorError::Configuration(format!(
                        "invalid [cavium-generator] table: {}",
                        e
                    ))
                });
            }
        }
        let library = std::env::var("AWS_HSM_LIB")
            .map_err(|_| GeneratorError::Configuration("AWS_HSM_LIB was not set".to_string()))?;
        let pin = std::env::var("AWS_HSM_PIN")
            .map_err(|_| GeneratorError::Configuration("AWS_HSM_PIN was not set".to_string()))?;
        let sas = std::env::var("AWS_HSM_SAS")
            .map_err(|_| GeneratorError::Configuration("AWS_HSM_SAS was not set".to_string()))?;
        let slot = match std::env::var("AWS_HSM_SLOT") {
            Ok(value) => value.parse().map_err(|_| {
                GeneratorError::Configuration(format!("AWS_HSM_SLOT is not a slot index: {}", value))
            })?,
            Err(_) => 0,
        };
        Ok(Self {
            library,
            pin,
            sas,
            slot,
        })
    }
}

struct HsmSession {
    // Kept alive for the lifetime of the session below.
    #[allow(dead_code)]
    pkcs11: Pkcs11,
    session: Session,
}

struct CaviumInner {
    config: CaviumConfig,
    state: RwLock<BackendState>,
    /// The session guard is held for whole operations so existence checks,
    /// signing and labeling cannot interleave between generators.
    session: Mutex<Option<HsmSession>>,
}

impl CaviumInner {
    fn ensure_ready(&self) -> Result<(), GeneratorError> {
        match self.state.read() {
            Ok(guard) if *guard == BackendState::Ready => Ok(()),
            Ok(_) => Err(GeneratorError::BackendNotReady),
            Err(_) => Err(GeneratorError::KeyStoreOperation(
                "state lock poisoned".to_string(),
            )),
        }
    }

    fn set_state(&self, state: BackendState) {
        if let Ok(mut guard) = self.state.write() {
            *guard = state;
        }
    }
}

/// Owns the PKCS#11 session and constructs generators bound to it.
pub struct CaviumProvider {
    inner: Arc<CaviumInner>,
}

impl CaviumProvider {
    pub fn new(config: CaviumConfig) -> Self {
        Self {
            inner: Arc::new(CaviumInner {
                config,
                state: RwLock::new(BackendState::Uninitialized),
                session: Mutex::new(None),
            }),
        }
    }

    /// Load the library, open a read-write session on the configured slot
    /// and log in. The session is committed only after a successful login,
    /// so a failure part-way leaves the backend in `Uninitialized` with no
    /// half-acquired handles.
    pub fn initialize(&self) -> Result<(), GeneratorError> {
        let config = &self.inner.config;
        let init = |e: cryptoki::error::Error| GeneratorError::Initialization(e.to_string());

        let pkcs11 = Pkcs11::new(&config.library).map_err(|e| {
            GeneratorError::Initialization(format!(
                "cannot load PKCS#11 library {}: {}",
                config.library, e
            ))
        })?;
        pkcs11.initialize(CInitializeArgs::OsThreads).map_err(init)?;

        let slots = pkcs11.get_slots_with_token().map_err(init)?;
        let slot = slots.get(config.slot).copied().ok_or_else(|| {
            GeneratorError::Initialization(format!("no token in slot index {}", config.slot))
        })?;

        let session = pkcs11.open_rw_session(slot).map_err(init)?;
        session
            .login(UserType::User, Some(&AuthPin::new(config.pin.as_str().into())))
            .map_err(init)?;

        match self.inner.session.lock() {
            Ok(mut guard) => *guard = Some(HsmSession { pkcs11, session }),
            Err(_) => {
                return Err(GeneratorError::Initialization(
                    "session lock poisoned".to_string(),
                ))
            }
        }
        self.inner.set_state(BackendState::Ready);
        tracing::info!(
            "HSM key generator ready (library {}, slot index {}, session auth script {})",
            config.library,
            config.slot,
            config.sas
        );
        Ok(())
    }

    /// Construct a generator that writes descriptor files to
    /// `output_directory`.
    pub fn generator(&self, output_directory: PathBuf) -> HsmKeyGenerator {
        HsmKeyGenerator {
            inner: Arc::clone(&self.inner),
            output_directory,
        }
    }

    pub fn close(&self) {
        if let Ok(mut guard) = self.inner.session.lock() {
            // Dropping the session logs out and closes it.
            *guard = None;
        }
        self.inner.set_state(BackendState::Closed);
    }
}

/// Signs with a private key object inside the locked session.
struct SessionSigner<'a> {
    session: &'a Session,
    key: ObjectHandle,
}

impl CertificateSigner for SessionSigner<'_> {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, GeneratorError> {
        // Hash up front; raw Ecdsa is the one mechanism Cavium and SoftHSM2
        // both support.
        let hash = Sha256::digest(data);
        let raw = self
            .session
            .sign(&Mechanism::Ecdsa, self.key, &hash)
            .map_err(|e| GeneratorError::CertificateIssuance(e.to_string()))?;
        certificate::ecdsa_raw_to_der(&raw)
    }
}

/// Normalize the CKA_EC_POINT value to the uncompressed SEC1 point. Tokens
/// return it wrapped in a DER OCTET STRING; some return the bare point.
fn normalize_ec_point(bytes: &[u8]) -> Result<[u8; 65], GeneratorError> {
    let unwrapped = if bytes.len() == 67 && bytes[0] == 0x04 && bytes[1] == 0x41 {
        &bytes[2..]
    } else {
        bytes
    };
    let point: [u8; 65] = unwrapped.try_into().map_err(|_| {
        GeneratorError::KeyStoreOperation(format!(
            "unexpected EC point encoding ({} bytes)",
            bytes.len()
        ))
    })?;
    if point[0] != 0x04 {
        return Err(GeneratorError::KeyStoreOperation(
            "EC point is not uncompressed".to_string(),
        ));
    }
    Ok(point)
}

/// PKCS#11 implementation of the key generator capability.
pub struct HsmKeyGenerator {
    inner: Arc<CaviumInner>,
    output_directory: PathBuf,
}

impl std::fmt::Debug for HsmKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HsmKeyGenerator")
            .field("output_directory", &self.output_directory)
            .finish_non_exhaustive()
    }
}

impl HsmKeyGenerator {
    fn with_session<T>(
        &self,
        f: impl FnOnce(&Session) -> Result<T, GeneratorError>,
    ) -> Result<T, GeneratorError> {
        self.inner.ensure_ready()?;
        let guard = self.inner.session.lock().map_err(|_| {
            GeneratorError::KeyStoreOperation("session lock poisoned".to_string())
        })?;
        let hsm = guard.as_ref().ok_or(GeneratorError::BackendNotReady)?;
        f(&hsm.session)
    }

    fn generate_in_session(&self, session: &Session) -> Result<Address, GeneratorError> {
        let op = |e: cryptoki::error::Error| GeneratorError::KeyStoreOperation(e.to_string());

        let pub_template = vec![
            Attribute::Class(ObjectClass::PUBLIC_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::Token(true),
            Attribute::Verify(true),
            Attribute::EcParams(SECP256K1_OID_DER.to_vec()),
        ];
        let priv_template = vec![
            Attribute::Class(ObjectClass::PRIVATE_KEY),
            Attribute::KeyType(KeyType::EC),
            Attribute::Token(true),
            Attribute::Private(true),
            Attribute::Sensitive(true),
            Attribute::Sign(true),
        ];

        let (pub_handle, priv_handle) = session
            .generate_key_pair(&Mechanism::EccKeyPairGen, &pub_template, &priv_template)
            .map_err(op)?;

        match self.bind_generated_pair(session, pub_handle, priv_handle) {
            Ok(address) => Ok(address),
            Err(e) => {
                // Roll the pair back so no unlabeled orphans accumulate.
                let _ = session.destroy_object(priv_handle);
                let _ = session.destroy_object(pub_handle);
                Err(e)
            }
        }
    }

    /// Derive the address, issue and store the certificate, and label the
    /// generated pair. Called with freshly generated, still unlabeled
    /// handles; any error makes the caller destroy them.
    fn bind_generated_pair(
        &self,
        session: &Session,
        pub_handle: ObjectHandle,
        priv_handle: ObjectHandle,
    ) -> Result<Address, GeneratorError> {
        let op = |e: cryptoki::error::Error| GeneratorError::KeyStoreOperation(e.to_string());

        let attrs = session
            .get_attributes(pub_handle, &[AttributeType::EcPoint])
            .map_err(op)?;
        let point_bytes = attrs
            .iter()
            .find_map(|attr| {
                if let Attribute::EcPoint(bytes) = attr {
                    Some(bytes.clone())
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                GeneratorError::KeyStoreOperation("token returned no EC point".to_string())
            })?;
        let point = normalize_ec_point(&point_bytes)?;
        let address = Address::from_public_key(&point);
        let label = address.to_checksum_string();

        // Addresses are content-derived, so a label hit means a replayed
        // generation.
        let existing = session
            .find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::Label(label.as_bytes().to_vec()),
            ])
            .map_err(op)?;
        if !existing.is_empty() {
            return Err(GeneratorError::DuplicateAddress(label));
        }

        let signer = SessionSigner {
            session,
            key: priv_handle,
        };
        let cert = certificate::issue(
            &point,
            CERTIFICATE_COMMON_NAME,
            CERTIFICATE_VALIDITY_DAYS,
            &signer,
        )?;
        let cert_der = cert.to_der()?;

        let label_attr = Attribute::Label(label.as_bytes().to_vec());
        session
            .update_attributes(priv_handle, &[label_attr.clone()])
            .map_err(op)?;
        session
            .update_attributes(pub_handle, &[label_attr.clone()])
            .map_err(op)?;

        session
            .create_object(&[
                Attribute::Class(ObjectClass::CERTIFICATE),
                Attribute::CertificateType(CertificateType::X_509),
                Attribute::Token(true),
                label_attr,
                Attribute::Value(cert_der),
            ])
            .map_err(op)?;

        Ok(address)
    }

    /// Write the descriptor file next to the service's other operator
    /// artifacts. Best-effort: the key entry is already durable on the
    /// token, so a write failure only logs.
    fn write_descriptor(&self, address: &Address) {
        let descriptor = Descriptor::hsm(address, self.inner.config.slot as u64);
        let path = self
            .output_directory
            .join(format!("{}.toml", address.to_checksum_string()));
        let result = descriptor
            .render()
            .and_then(|text| {
                std::fs::write(&path, text)
                    .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))
            });
        if let Err(e) = result {
            tracing::warn!("Failed to write descriptor {}: {}", path.display(), e);
        }
    }

    fn find_by_label(
        session: &Session,
        class: ObjectClass,
        label: &str,
    ) -> Result<Vec<ObjectHandle>, GeneratorError> {
        session
            .find_objects(&[
                Attribute::Class(class),
                Attribute::Label(label.as_bytes().to_vec()),
            ])
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))
    }

    fn list_in_session(session: &Session) -> Result<Vec<Address>, GeneratorError> {
        let op = |e: cryptoki::error::Error| GeneratorError::KeyStoreOperation(e.to_string());

        let handles = session
            .find_objects(&[
                Attribute::Class(ObjectClass::PRIVATE_KEY),
                Attribute::KeyType(KeyType::EC),
            ])
            .map_err(op)?;

        let mut addresses = Vec::new();
        for handle in handles {
            let attrs = session
                .get_attributes(handle, &[AttributeType::Label])
                .map_err(op)?;
            for attr in attrs {
                if let Attribute::Label(label_bytes) = attr {
                    let Ok(label) = String::from_utf8(label_bytes) else {
                        continue;
                    };
                    match label.parse::<Address>() {
                        Ok(address) => addresses.push(address),
                        Err(_) => {
                            tracing::warn!("Skipping foreign key object: {}", label);
                        }
                    }
                }
            }
        }
        Ok(addresses)
    }
}

#[async_trait::async_trait]
impl KeyGenerator for HsmKeyGenerator {
    async fn generate(&self) -> Result<Address, GeneratorError> {
        let address = self.with_session(|session| self.generate_in_session(session))?;
        self.write_descriptor(&address);
        tracing::info!(
            "Generated new key with address: {}",
            address.to_checksum_string()
        );
        Ok(address)
    }

    async fn meta_data(&self, address: &Address) -> Result<Descriptor, GeneratorError> {
        let label = address.to_checksum_string();
        let found = self.with_session(|session| {
            Self::find_by_label(session, ObjectClass::PRIVATE_KEY, &label)
        })?;
        if found.is_empty() {
            return Err(GeneratorError::KeyStoreOperation(format!(
                "no key stored for address {}",
                label
            )));
        }
        Ok(Descriptor::hsm(address, self.inner.config.slot as u64))
    }

    async fn exists(&self, address: &Address) -> Result<bool, GeneratorError> {
        let label = address.to_checksum_string();
        let found = self.with_session(|session| {
            Self::find_by_label(session, ObjectClass::PRIVATE_KEY, &label)
        })?;
        Ok(!found.is_empty())
    }

    async fn list(&self) -> Result<Vec<Address>, GeneratorError> {
        self.with_session(Self::list_in_session)
    }

    async fn remove_all(&self) -> Result<RemovalReport, GeneratorError> {
        self.with_session(|session| {
            let addresses = Self::list_in_session(session)?;
            Ok(remove_entries(
                addresses,
                |label| {
                    let mut handles = Vec::new();
                    for class in [
                        ObjectClass::PRIVATE_KEY,
                        ObjectClass::PUBLIC_KEY,
                        ObjectClass::CERTIFICATE,
                    ] {
                        handles.extend(Self::find_by_label(session, class, label)?);
                    }
                    Ok(handles)
                },
                |handle| {
                    session
                        .destroy_object(handle)
                        .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))
                },
            ))
        })
    }
}

/// Fold per-entry lookup and destroy outcomes into a removal report. A
/// failing lookup or destroy is recorded against its own entry and never
/// stops the remaining entries from being attempted.
fn remove_entries<H>(
    addresses: Vec<Address>,
    mut lookup: impl FnMut(&str) -> Result<Vec<H>, GeneratorError>,
    mut destroy: impl FnMut(H) -> Result<(), GeneratorError>,
) -> RemovalReport {
    let mut report = RemovalReport::default();
    for address in addresses {
        let label = address.to_checksum_string();
        let handles = match lookup(&label) {
            Ok(handles) => handles,
            Err(e) => {
                tracing::warn!("Failed to look up key with address {}: {}", label, e);
                report.failed.push((address, e.to_string()));
                continue;
            }
        };

        let mut failure = None;
        for handle in handles {
            if let Err(e) = destroy(handle) {
                failure = Some(e.to_string());
            }
        }
        match failure {
            None => {
                tracing::debug!("Deleted key with address: {}", label);
                report.removed.push(address);
            }
            Some(reason) => {
                tracing::warn!("Failed to delete key with address {}: {}", label, reason);
                report.failed.push((address, reason));
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_resolution_prefers_table() {
        let table: toml::Table = r#"
            library = "/opt/cloudhsm/lib/libcloudhsm_pkcs11.so"
            pin = "alice:391019314"
            sas = "/opt/accountgenerator/scripts/sas.sh"
            slot = 1
        "#
        .parse()
        .unwrap();

        let config = CaviumConfig::resolve(Some(&table)).unwrap();
        assert_eq!(config.library, "/opt/cloudhsm/lib/libcloudhsm_pkcs11.so");
        assert_eq!(config.pin, "alice:391019314");
        assert_eq!(config.sas, "/opt/accountgenerator/scripts/sas.sh");
        assert_eq!(config.slot, 1);
    }

    #[test]
    fn test_config_slot_defaults_to_zero() {
        let table: toml::Table = r#"
            library = "/usr/lib/softhsm/libsofthsm2.so"
            pin = "1234"
            sas = "/scripts/sas.sh"
        "#
        .parse()
        .unwrap();

        let config = CaviumConfig::resolve(Some(&table)).unwrap();
        assert_eq!(config.slot, 0);
    }

    #[test]
    fn test_config_resolution_rejects_incomplete_table() {
        let table: toml::Table = r#"library = "/usr/lib/softhsm/libsofthsm2.so""#
            .parse()
            .unwrap();
        assert!(matches!(
            CaviumConfig::resolve(Some(&table)).unwrap_err(),
            GeneratorError::Configuration(_)
        ));
    }

    #[test]
    fn test_config_resolution_falls_back_to_environment() {
        std::env::set_var("AWS_HSM_LIB", "/usr/lib/softhsm/libsofthsm2.so");
        std::env::set_var("AWS_HSM_PIN", "env-pin");
        std::env::set_var("AWS_HSM_SAS", "/scripts/sas.sh");
        std::env::set_var("AWS_HSM_SLOT", "2");

        let config = CaviumConfig::resolve(None).unwrap();
        assert_eq!(config.library, "/usr/lib/softhsm/libsofthsm2.so");
        assert_eq!(config.pin, "env-pin");
        assert_eq!(config.slot, 2);

        std::env::remove_var("AWS_HSM_LIB");
        std::env::remove_var("AWS_HSM_PIN");
        std::env::remove_var("AWS_HSM_SAS");
        std::env::remove_var("AWS_HSM_SLOT");
    }

    #[test]
    fn test_debug_redacts_pin() {
        let config = CaviumConfig {
            library: "/usr/lib/softhsm/libsofthsm2.so".to_string(),
            pin: "super-secret".to_string(),
            sas: "/scripts/sas.sh".to_string(),
            slot: 0,
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_normalize_ec_point() {
        let mut wrapped = vec![0x04, 0x41];
        let mut point = vec![0x04];
        point.extend_from_slice(&[0xab; 64]);
        wrapped.extend_from_slice(&point);

        assert_eq!(normalize_ec_point(&wrapped).unwrap().to_vec(), point);
        assert_eq!(normalize_ec_point(&point).unwrap().to_vec(), point);

        assert!(normalize_ec_point(&[0u8; 10]).is_err());
        // Compressed points are rejected
        let mut compressed = vec![0x02];
        compressed.extend_from_slice(&[0xab; 64]);
        assert!(normalize_ec_point(&compressed).is_err());
    }

    fn removal_addresses() -> Vec<Address> {
        [
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
            "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
            "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect()
    }

    #[test]
    fn test_remove_entries_records_lookup_failure_per_item() {
        let addresses = removal_addresses();
        let victim = addresses[1];
        let victim_label = victim.to_checksum_string();

        let report = remove_entries(
            addresses.clone(),
            |label| {
                if label == victim_label {
                    Err(GeneratorError::KeyStoreOperation("find failed".to_string()))
                } else {
                    Ok(vec![0u32, 1])
                }
            },
            |_| Ok(()),
        );

        assert_eq!(report.removed, vec![addresses[0], addresses[2]]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, victim);
        assert!(report.failed[0].1.contains("find failed"));
        assert!(!report.is_complete());
    }

    #[test]
    fn test_remove_entries_records_destroy_failure_per_item() {
        let addresses = removal_addresses();
        let victim = addresses[0];

        let mut next = 0u32;
        let report = remove_entries(
            addresses.clone(),
            |_| {
                next += 1;
                Ok(vec![next])
            },
            |handle| {
                if handle == 1 {
                    Err(GeneratorError::KeyStoreOperation(
                        "destroy failed".to_string(),
                    ))
                } else {
                    Ok(())
                }
            },
        );

        assert_eq!(report.removed, vec![addresses[1], addresses[2]]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, victim);
    }

    #[tokio::test]
    async fn test_operations_fail_before_initialize() {
        let provider = CaviumProvider::new(CaviumConfig {
            library: "/nonexistent.so".to_string(),
            pin: "pin".to_string(),
            sas: "/scripts/sas.sh".to_string(),
            slot: 0,
        });
        let generator = provider.generator(PathBuf::from("."));

        assert!(matches!(
            generator.generate().await.unwrap_err(),
            GeneratorError::BackendNotReady
        ));
    }

    #[test]
    fn test_initialize_fails_for_missing_library() {
        let provider = CaviumProvider::new(CaviumConfig {
            library: "/nonexistent.so".to_string(),
            pin: "pin".to_string(),
            sas: "/scripts/sas.sh".to_string(),
            slot: 0,
        });
        assert!(matches!(
            provider.initialize().unwrap_err(),
            GeneratorError::Initialization(_)
        ));
    }
}
