//! File-based key generator backend
//!
//! Keys are generated in software and persisted as passphrase-encrypted
//! PKCS#8 PEM files named by their checksummed address, next to the
//! certificate PEM. The key file is claimed with `create_new` so two
//! concurrent generations can never race to the same derived address.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use openssl::bn::BigNumContext;
use openssl::ec::{EcGroup, EcKey, PointConversionForm};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::address::Address;
use crate::certificate::{
    self, CertificateSigner, SoftwareSigner, CERTIFICATE_COMMON_NAME, CERTIFICATE_VALIDITY_DAYS,
};
use crate::error::GeneratorError;
use crate::generator::{BackendState, Descriptor, KeyGenerator, RemovalReport};

const KEY_EXTENSION: &str = "key";
const CERT_EXTENSION: &str = "crt";

/// Resolved file-based backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FileBasedConfig {
    /// Directory holding the encrypted key files.
    pub directory: PathBuf,
    /// Passphrase protecting the PKCS#8 key files.
    pub password: String,
}

impl FileBasedConfig {
    /// Resolve configuration from the `[file-generator]` table when present,
    /// falling back to `FILE_GENERATOR_DIRECTORY` / `FILE_GENERATOR_PASSWORD`
    /// environment variables.
    pub fn resolve(table: Option<&toml::Table>) -> Result<Self, GeneratorError> {
        if let Some(table) = table {
            if !table.is_empty() {
                return table.clone().try_into().map_err(|e: toml::de::Error| {
                    GeneratorError::Configuration(format!(
                        "invalid [file-generator] table: {}",
                        e
                    ))
                });
            }
        }
        let directory = std::env::var("FILE_GENERATOR_DIRECTORY").map_err(|_| {
            GeneratorError::Configuration("FILE_GENERATOR_DIRECTORY was not set".to_string())
        })?;
        let password = std::env::var("FILE_GENERATOR_PASSWORD").map_err(|_| {
            GeneratorError::Configuration("FILE_GENERATOR_PASSWORD was not set".to_string())
        })?;
        Ok(Self {
            directory: directory.into(),
            password,
        })
    }
}

struct FileBasedInner {
    config: FileBasedConfig,
    state: RwLock<BackendState>,
    /// Serializes mutating store operations (`generate`, `remove_all`).
    /// `list`/`exists` run lock-free and may observe a state stale by one
    /// in-flight insertion.
    store_lock: Mutex<()>,
}

impl FileBasedInner {
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

/// Owns the keystore directory and constructs generators bound to it.
pub struct FileBasedProvider {
    inner: Arc<FileBasedInner>,
}

impl FileBasedProvider {
    pub fn new(config: FileBasedConfig) -> Self {
        Self {
            inner: Arc::new(FileBasedInner {
                config,
                state: RwLock::new(BackendState::Uninitialized),
                store_lock: Mutex::new(()),
            }),
        }
    }

    /// Create the keystore directory and verify it is writable. A failed
    /// initialization leaves the backend in `Uninitialized`.
    pub fn initialize(&self) -> Result<(), GeneratorError> {
        let directory = &self.inner.config.directory;
        fs::create_dir_all(directory).map_err(|e| {
            GeneratorError::Initialization(format!(
                "cannot create keystore directory {}: {}",
                directory.display(),
                e
            ))
        })?;

        let probe = directory.join(".accountgen-probe");
        fs::write(&probe, b"").map_err(|e| {
            GeneratorError::Initialization(format!(
                "keystore directory {} is not writable: {}",
                directory.display(),
                e
            ))
        })?;
        let _ = fs::remove_file(&probe);

        self.inner.set_state(BackendState::Ready);
        tracing::info!(
            "File-based key generator ready in {}",
            directory.display()
        );
        Ok(())
    }

    pub fn generator(&self) -> FileBasedKeyGenerator {
        FileBasedKeyGenerator {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn close(&self) {
        self.inner.set_state(BackendState::Closed);
    }
}

/// File-based implementation of the key generator capability.
pub struct FileBasedKeyGenerator {
    inner: Arc<FileBasedInner>,
}

impl std::fmt::Debug for FileBasedKeyGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBasedKeyGenerator")
            .finish_non_exhaustive()
    }
}

impl FileBasedKeyGenerator {
    fn key_path(&self, address: &Address) -> PathBuf {
        self.inner
            .config
            .directory
            .join(format!("{}.{}", address.to_checksum_string(), KEY_EXTENSION))
    }

    fn cert_path(&self, address: &Address) -> PathBuf {
        self.inner
            .config
            .directory
            .join(format!("{}.{}", address.to_checksum_string(), CERT_EXTENSION))
    }

    fn generate_locked(
        &self,
        signer_override: Option<&dyn CertificateSigner>,
    ) -> Result<Address, GeneratorError> {
        let op = |e: openssl::error::ErrorStack| GeneratorError::KeyStoreOperation(e.to_string());

        let group = EcGroup::from_curve_name(Nid::SECP256K1).map_err(op)?;
        let ec_key = EcKey::generate(&group).map_err(op)?;
        let mut ctx = BigNumContext::new().map_err(op)?;
        let point_bytes = ec_key
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
            .map_err(op)?;
        let point: [u8; 65] = point_bytes.as_slice().try_into().map_err(|_| {
            GeneratorError::KeyStoreOperation("unexpected EC point encoding".to_string())
        })?;
        let address = Address::from_public_key(&point);
        let pkey = PKey::from_ec_key(ec_key).map_err(op)?;

        let key_path = self.key_path(&address);
        let cert_path = self.cert_path(&address);

        // Atomic claim: addresses are content-derived, so an existing file
        // means a pathological RNG failure or a replayed generation.
        let mut key_file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&key_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(GeneratorError::DuplicateAddress(
                    address.to_checksum_string(),
                ))
            }
            Err(e) => return Err(GeneratorError::KeyStoreOperation(e.to_string())),
        };

        if let Err(e) = self.persist_entry(
            &mut key_file,
            &pkey,
            &point,
            signer_override,
            &cert_path,
        ) {
            // Roll the claim back so no partial entry is observable.
            drop(key_file);
            let _ = fs::remove_file(&key_path);
            let _ = fs::remove_file(&cert_path);
            return Err(e);
        }

        tracing::info!(
            "Generated new key with address: {}",
            address.to_checksum_string()
        );
        Ok(address)
    }

    fn persist_entry(
        &self,
        key_file: &mut fs::File,
        pkey: &PKey<Private>,
        point: &[u8; 65],
        signer_override: Option<&dyn CertificateSigner>,
        cert_path: &Path,
    ) -> Result<(), GeneratorError> {
        let software_signer = SoftwareSigner::new(pkey.clone());
        let signer = signer_override.unwrap_or(&software_signer);
        let cert = certificate::issue(
            point,
            CERTIFICATE_COMMON_NAME,
            CERTIFICATE_VALIDITY_DAYS,
            signer,
        )?;

        let key_pem = pkey
            .private_key_to_pem_pkcs8_passphrase(
                Cipher::aes_256_cbc(),
                self.inner.config.password.as_bytes(),
            )
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;
        key_file
            .write_all(&key_pem)
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;
        key_file
            .sync_all()
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;

        let cert_pem = cert.to_pem()?;
        let mut cert_file = fs::File::create(cert_path)
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;
        cert_file
            .write_all(&cert_pem)
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;
        cert_file
            .sync_all()
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;
        Ok(())
    }

    fn list_stored(&self) -> Result<Vec<Address>, GeneratorError> {
        let entries = fs::read_dir(&self.inner.config.directory)
            .map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;

        let mut addresses = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| GeneratorError::KeyStoreOperation(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(KEY_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match Address::from_str(stem) {
                Ok(address) => addresses.push(address),
                Err(_) => {
                    tracing::warn!("Skipping foreign key file: {}", path.display());
                }
            }
        }
        Ok(addresses)
    }
}

#[async_trait::async_trait]
impl KeyGenerator for FileBasedKeyGenerator {
    async fn generate(&self) -> Result<Address, GeneratorError> {
        self.inner.ensure_ready()?;
        let _guard = self.inner.store_lock.lock().await;
        self.generate_locked(None)
    }

    async fn meta_data(&self, address: &Address) -> Result<Descriptor, GeneratorError> {
        self.inner.ensure_ready()?;
        if !self.exists(address).await? {
            return Err(GeneratorError::KeyStoreOperation(format!(
                "no key stored for address {}",
                address.to_checksum_string()
            )));
        }
        Ok(Descriptor::file_based(address, &self.key_path(address)))
    }

    async fn exists(&self, address: &Address) -> Result<bool, GeneratorError> {
        self.inner.ensure_ready()?;
        match fs::metadata(self.key_path(address)) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GeneratorError::KeyStoreOperation(e.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<Address>, GeneratorError> {
        self.inner.ensure_ready()?;
        self.list_stored()
    }

    async fn remove_all(&self) -> Result<RemovalReport, GeneratorError> {
        self.inner.ensure_ready()?;
        let _guard = self.inner.store_lock.lock().await;

        let mut report = RemovalReport::default();
        for address in self.list_stored()? {
            // Certificate first: an undeletable certificate leaves the
            // entry intact and reported, never an orphaned file that no
            // listing will ever show again.
            match fs::remove_file(self.cert_path(&address)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(
                        "Failed to delete certificate for address {}: {}",
                        address.to_checksum_string(),
                        e
                    );
                    report.failed.push((address, e.to_string()));
                    continue;
                }
            }
            match fs::remove_file(self.key_path(&address)) {
                Ok(()) => {
                    tracing::debug!(
                        "Deleted key with address: {}",
                        address.to_checksum_string()
                    );
                    report.removed.push(address);
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to delete key with address {}: {}",
                        address.to_checksum_string(),
                        e
                    );
                    report.failed.push((address, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ready_generator() -> (TempDir, FileBasedProvider, FileBasedKeyGenerator) {
        let dir = TempDir::new().unwrap();
        let provider = FileBasedProvider::new(FileBasedConfig {
            directory: dir.path().to_path_buf(),
            password: "test-passphrase".to_string(),
        });
        provider.initialize().unwrap();
        let generator = provider.generator();
        (dir, provider, generator)
    }

    struct FailingSigner;

    impl CertificateSigner for FailingSigner {
        fn sign(&self, _data: &[u8]) -> Result<Vec<u8>, GeneratorError> {
            Err(GeneratorError::CertificateIssuance(
                "signer unavailable".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn test_generate_persists_and_lists() {
        let (_dir, _provider, generator) = ready_generator();

        let address = generator.generate().await.unwrap();
        let checksummed = address.to_checksum_string();
        assert_eq!(checksummed.len(), 42);
        assert!(checksummed.starts_with("0x"));
        // Checksum form is a pure function of the binary value
        let reparsed: Address = checksummed.parse().unwrap();
        assert_eq!(reparsed.to_checksum_string(), checksummed);

        assert!(generator.exists(&address).await.unwrap());
        let listed = generator.list().await.unwrap();
        assert_eq!(listed, vec![address]);
    }

    #[tokio::test]
    async fn test_generate_writes_key_and_certificate_files() {
        let (dir, _provider, generator) = ready_generator();

        let address = generator.generate().await.unwrap();
        let key_path = dir
            .path()
            .join(format!("{}.key", address.to_checksum_string()));
        let cert_path = dir
            .path()
            .join(format!("{}.crt", address.to_checksum_string()));

        let key_pem = fs::read_to_string(&key_path).unwrap();
        assert!(key_pem.contains("ENCRYPTED PRIVATE KEY"));

        let cert_pem = fs::read(&cert_path).unwrap();
        let cert = openssl::x509::X509::from_pem(&cert_pem).unwrap();
        // Address re-derived from the certificate's public key matches
        let group = EcGroup::from_curve_name(Nid::SECP256K1).unwrap();
        let mut ctx = BigNumContext::new().unwrap();
        let point = cert
            .public_key()
            .unwrap()
            .ec_key()
            .unwrap()
            .public_key()
            .to_bytes(&group, PointConversionForm::UNCOMPRESSED, &mut ctx)
            .unwrap();
        let point: [u8; 65] = point.as_slice().try_into().unwrap();
        assert_eq!(Address::from_public_key(&point), address);
    }

    #[tokio::test]
    async fn test_concurrent_generates_yield_unique_addresses() {
        let (_dir, provider, _generator) = ready_generator();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let generator = provider.generator();
            handles.push(tokio::spawn(
                async move { generator.generate().await },
            ));
        }

        let mut addresses = Vec::new();
        for handle in handles {
            addresses.push(handle.await.unwrap().unwrap());
        }
        let unique: std::collections::HashSet<_> = addresses.iter().collect();
        assert_eq!(unique.len(), addresses.len());

        let listed = provider.generator().list().await.unwrap();
        assert_eq!(listed.len(), addresses.len());
    }

    #[tokio::test]
    async fn test_failed_issuance_leaves_no_partial_entry() {
        let (_dir, _provider, generator) = ready_generator();

        let err = generator.generate_locked(Some(&FailingSigner)).unwrap_err();
        assert!(matches!(err, GeneratorError::CertificateIssuance(_)));

        assert!(generator.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_all_reports_partial_failure() {
        let (dir, _provider, generator) = ready_generator();

        let mut addresses = Vec::new();
        for _ in 0..3 {
            addresses.push(generator.generate().await.unwrap());
        }

        // Force one deletion to fail by replacing its key file with a
        // non-empty directory.
        let victim = addresses[1];
        let victim_path = dir
            .path()
            .join(format!("{}.key", victim.to_checksum_string()));
        fs::remove_file(&victim_path).unwrap();
        fs::create_dir(&victim_path).unwrap();
        fs::write(victim_path.join("pin"), b"x").unwrap();

        let report = generator.remove_all().await.unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, victim);
        assert!(!report.is_complete());

        let remaining = generator.list().await.unwrap();
        assert_eq!(remaining, vec![victim]);
    }

    #[tokio::test]
    async fn test_remove_all_reports_undeletable_certificate() {
        let (dir, _provider, generator) = ready_generator();

        let kept = generator.generate().await.unwrap();
        let victim = generator.generate().await.unwrap();

        // Force the certificate deletion to fail by replacing the file
        // with a non-empty directory.
        let cert_path = dir
            .path()
            .join(format!("{}.crt", victim.to_checksum_string()));
        fs::remove_file(&cert_path).unwrap();
        fs::create_dir(&cert_path).unwrap();
        fs::write(cert_path.join("pin"), b"x").unwrap();

        let report = generator.remove_all().await.unwrap();
        assert_eq!(report.removed, vec![kept]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, victim);

        // The failed entry stays fully intact, key file included
        assert_eq!(generator.list().await.unwrap(), vec![victim]);
        assert!(generator.exists(&victim).await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_distinguishes_absent_from_failure() {
        let (_dir, _provider, generator) = ready_generator();
        let address: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        assert!(!generator.exists(&address).await.unwrap());
    }

    #[tokio::test]
    async fn test_meta_data_describes_stored_entry() {
        let (dir, _provider, generator) = ready_generator();
        let address = generator.generate().await.unwrap();

        let descriptor = generator.meta_data(&address).await.unwrap();
        let text = descriptor.render().unwrap();
        assert!(text.contains(&address.to_checksum_string()));
        assert!(text.contains("file-based-signer"));
        assert!(text.contains(dir.path().to_str().unwrap()));

        let missing: Address = "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed".parse().unwrap();
        assert!(generator.meta_data(&missing).await.is_err());
    }

    #[tokio::test]
    async fn test_operations_fail_outside_ready() {
        let dir = TempDir::new().unwrap();
        let provider = FileBasedProvider::new(FileBasedConfig {
            directory: dir.path().to_path_buf(),
            password: "pw".to_string(),
        });
        let generator = provider.generator();

        // Uninitialized
        assert!(matches!(
            generator.generate().await.unwrap_err(),
            GeneratorError::BackendNotReady
        ));

        provider.initialize().unwrap();
        generator.generate().await.unwrap();

        // Closed
        provider.close();
        assert!(matches!(
            generator.list().await.unwrap_err(),
            GeneratorError::BackendNotReady
        ));
    }

    #[test]
    fn test_config_resolution_prefers_table() {
        let table: toml::Table = r#"
            directory = "/tmp/keys"
            password = "from-table"
        "#
        .parse()
        .unwrap();

        let config = FileBasedConfig::resolve(Some(&table)).unwrap();
        assert_eq!(config.directory, PathBuf::from("/tmp/keys"));
        assert_eq!(config.password, "from-table");
    }

    #[test]
    fn test_config_resolution_rejects_incomplete_table() {
        let table: toml::Table = r#"directory = "/tmp/keys""#.parse().unwrap();
        assert!(matches!(
            FileBasedConfig::resolve(Some(&table)).unwrap_err(),
            GeneratorError::Configuration(_)
        ));
    }

    #[test]
    fn test_config_resolution_falls_back_to_environment() {
        std::env::set_var("FILE_GENERATOR_DIRECTORY", "/tmp/env-keys");
        std::env::set_var("FILE_GENERATOR_PASSWORD", "from-env");

        let config = FileBasedConfig::resolve(None).unwrap();
        assert_eq!(config.directory, PathBuf::from("/tmp/env-keys"));
        assert_eq!(config.password, "from-env");

        std::env::remove_var("FILE_GENERATOR_DIRECTORY");
        std::env::remove_var("FILE_GENERATOR_PASSWORD");
    }
}
