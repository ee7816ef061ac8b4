//! X.509 certificate issuance
//!
//! Every stored key entry carries a short-lived self-signed certificate.
//! This is a structural requirement of the keystore container formats, not
//! a security artifact: clients never verify these certificates.
//!
//! The signature operation is delegated to a [`CertificateSigner`] because
//! the HSM backend signs with a key that never leaves the token. The openssl
//! builder cannot delegate signing, so the structure is first built and
//! signed with a throwaway scaffold key on the same curve; the to-be-signed
//! bytes are then extracted and re-signed by the backend signer.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, BigNumContext, MsbOption};
use openssl::ec::{EcGroup, EcKey, EcPoint};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::sign::Signer;
use openssl::x509::extension::{BasicConstraints, ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use crate::error::GeneratorError;

/// Common name placed in the subject and issuer of every issued certificate.
pub const CERTIFICATE_COMMON_NAME: &str = "AccountGenerator";

/// Validity window length of issued certificates.
pub const CERTIFICATE_VALIDITY_DAYS: u32 = 365;

// AlgorithmIdentifier for ecdsa-with-SHA256 (1.2.840.10045.4.3.2)
const ECDSA_WITH_SHA256: [u8; 12] = [
    0x30, 0x0A, 0x06, 0x08, 0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x04, 0x03, 0x02,
];

fn issuance(e: openssl::error::ErrorStack) -> GeneratorError {
    GeneratorError::CertificateIssuance(e.to_string())
}

/// Backend-provided signature operation over the to-be-signed certificate.
pub trait CertificateSigner {
    /// Returns a DER-encoded ECDSA-SHA256 signature over `data`.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, GeneratorError>;
}

/// Software signer backed by an in-process private key.
pub struct SoftwareSigner {
    pkey: PKey<openssl::pkey::Private>,
}

impl SoftwareSigner {
    pub fn new(pkey: PKey<openssl::pkey::Private>) -> Self {
        Self { pkey }
    }
}

impl CertificateSigner for SoftwareSigner {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, GeneratorError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.pkey).map_err(issuance)?;
        signer.sign_oneshot_to_vec(data).map_err(issuance)
    }
}

/// An issued, self-verified certificate.
#[derive(Debug)]
pub struct Certificate {
    x509: X509,
}

impl Certificate {
    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    pub fn to_der(&self) -> Result<Vec<u8>, GeneratorError> {
        self.x509.to_der().map_err(issuance)
    }

    pub fn to_pem(&self) -> Result<Vec<u8>, GeneratorError> {
        self.x509.to_pem().map_err(issuance)
    }
}

/// Issue a self-signed certificate binding the given public key point.
///
/// The signature is produced by `signer` and immediately self-verified
/// against the embedded public key; the validity window must contain now.
/// Either check failing aborts issuance so no partial entry is persisted
/// by callers.
pub fn issue(
    public_point: &[u8; 65],
    common_name: &str,
    validity_days: u32,
    signer: &dyn CertificateSigner,
) -> Result<Certificate, GeneratorError> {
    let public_key = public_key_from_point(public_point)?;
    let tbs = build_tbs(&public_key, common_name, validity_days)?;
    let signature = signer.sign(&tbs)?;
    let der = assemble_certificate(&tbs, &signature);
    let x509 = X509::from_der(&der).map_err(issuance)?;

    let verified = x509.verify(&public_key).unwrap_or(false);
    if !verified {
        return Err(GeneratorError::CertificateIssuance(
            "signature does not verify against the embedded public key".to_string(),
        ));
    }

    let now = Asn1Time::days_from_now(0).map_err(issuance)?;
    if x509.not_before() > now || x509.not_after() < now {
        return Err(GeneratorError::CertificateIssuance(
            "validity window does not contain the current time".to_string(),
        ));
    }

    Ok(Certificate { x509 })
}

/// Convert a raw `r || s` ECDSA signature (as returned by a PKCS#11 token)
/// to DER.
pub fn ecdsa_raw_to_der(raw: &[u8]) -> Result<Vec<u8>, GeneratorError> {
    if raw.is_empty() || raw.len() % 2 != 0 {
        return Err(GeneratorError::CertificateIssuance(format!(
            "unexpected raw signature length: {}",
            raw.len()
        )));
    }
    let (r, s) = raw.split_at(raw.len() / 2);
    let r = BigNum::from_slice(r).map_err(issuance)?;
    let s = BigNum::from_slice(s).map_err(issuance)?;
    let sig = EcdsaSig::from_private_components(r, s).map_err(issuance)?;
    sig.to_der().map_err(issuance)
}

fn public_key_from_point(point: &[u8; 65]) -> Result<PKey<Public>, GeneratorError> {
    let group = EcGroup::from_curve_name(Nid::SECP256K1).map_err(issuance)?;
    let mut ctx = BigNumContext::new().map_err(issuance)?;
    let ec_point = EcPoint::from_bytes(&group, point, &mut ctx).map_err(issuance)?;
    let ec_key = EcKey::from_public_key(&group, &ec_point).map_err(issuance)?;
    PKey::from_ec_key(ec_key).map_err(issuance)
}

fn build_tbs(
    public_key: &PKey<Public>,
    common_name: &str,
    validity_days: u32,
) -> Result<Vec<u8>, GeneratorError> {
    let mut builder = X509Builder::new().map_err(issuance)?;
    builder.set_version(2).map_err(issuance)?;

    // Random 63-bit non-negative serial
    let mut serial = BigNum::new().map_err(issuance)?;
    serial
        .rand(63, MsbOption::MAYBE_ZERO, false)
        .map_err(issuance)?;
    let serial = serial.to_asn1_integer().map_err(issuance)?;
    builder.set_serial_number(&serial).map_err(issuance)?;

    let mut name_builder = X509NameBuilder::new().map_err(issuance)?;
    name_builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .map_err(issuance)?;
    name_builder
        .append_entry_by_nid(Nid::LOCALITYNAME, "CT")
        .map_err(issuance)?;
    name_builder
        .append_entry_by_nid(Nid::COUNTRYNAME, "ZA")
        .map_err(issuance)?;
    let name = name_builder.build();

    builder.set_subject_name(&name).map_err(issuance)?;
    builder.set_issuer_name(&name).map_err(issuance)?;

    let not_before = Asn1Time::days_from_now(0).map_err(issuance)?;
    builder.set_not_before(&not_before).map_err(issuance)?;
    let not_after = Asn1Time::days_from_now(validity_days).map_err(issuance)?;
    builder.set_not_after(&not_after).map_err(issuance)?;

    builder.set_pubkey(public_key).map_err(issuance)?;

    builder
        .append_extension(BasicConstraints::new().critical().ca().build().map_err(issuance)?)
        .map_err(issuance)?;
    builder
        .append_extension(
            KeyUsage::new()
                .key_cert_sign()
                .digital_signature()
                .key_encipherment()
                .data_encipherment()
                .crl_sign()
                .build()
                .map_err(issuance)?,
        )
        .map_err(issuance)?;
    builder
        .append_extension(
            ExtendedKeyUsage::new()
                .server_auth()
                .client_auth()
                .other("anyExtendedKeyUsage")
                .build()
                .map_err(issuance)?,
        )
        .map_err(issuance)?;

    // Scaffold signature, replaced by the backend signer's signature.
    let group = EcGroup::from_curve_name(Nid::SECP256K1).map_err(issuance)?;
    let scaffold = EcKey::generate(&group).map_err(issuance)?;
    let scaffold = PKey::from_ec_key(scaffold).map_err(issuance)?;
    builder
        .sign(&scaffold, MessageDigest::sha256())
        .map_err(issuance)?;

    let der = builder.build().to_der().map_err(issuance)?;
    tbs_certificate(&der)
}

/// Measure the header and content length of the DER element at the start of
/// `buf`.
fn element(buf: &[u8]) -> Result<(usize, usize), GeneratorError> {
    let malformed =
        || GeneratorError::CertificateIssuance("malformed certificate encoding".to_string());
    if buf.len() < 2 {
        return Err(malformed());
    }
    let first = buf[1] as usize;
    if first < 0x80 {
        return Ok((2, first));
    }
    let n = first & 0x7f;
    if n == 0 || n > 4 || buf.len() < 2 + n {
        return Err(malformed());
    }
    let mut len = 0usize;
    for i in 0..n {
        len = (len << 8) | buf[2 + i] as usize;
    }
    Ok((2 + n, len))
}

/// Extract the TBSCertificate bytes (the first element of the outer
/// Certificate SEQUENCE), header included.
fn tbs_certificate(cert_der: &[u8]) -> Result<Vec<u8>, GeneratorError> {
    let malformed =
        || GeneratorError::CertificateIssuance("malformed certificate encoding".to_string());
    let (outer_header, outer_len) = element(cert_der)?;
    let content = cert_der
        .get(outer_header..outer_header + outer_len)
        .ok_or_else(malformed)?;
    let (tbs_header, tbs_len) = element(content)?;
    content
        .get(..tbs_header + tbs_len)
        .map(|s| s.to_vec())
        .ok_or_else(malformed)
}

fn der_length(len: usize) -> Vec<u8> {
    if len < 0x80 {
        return vec![len as u8];
    }
    let bytes = (len as u64).to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    let mut out = vec![0x80 | (8 - first) as u8];
    out.extend_from_slice(&bytes[first..]);
    out
}

/// Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, signature }
fn assemble_certificate(tbs: &[u8], signature_der: &[u8]) -> Vec<u8> {
    let mut bit_string = vec![0x03];
    bit_string.extend(der_length(signature_der.len() + 1));
    bit_string.push(0x00);
    bit_string.extend_from_slice(signature_der);

    let body_len = tbs.len() + ECDSA_WITH_SHA256.len() + bit_string.len();
    let mut out = Vec::with_capacity(body_len + 6);
    out.push(0x30);
    out.extend(der_length(body_len));
    out.extend_from_slice(tbs);
    out.extend_from_slice(&ECDSA_WITH_SHA256);
    out.extend(bit_string);
    out
}
