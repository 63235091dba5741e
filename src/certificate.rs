//! Certificate/key material and the built-in test certificate.
//!
//! Material is kept as PEM. The private key lives in a zeroizing buffer and is
//! only decoded to DER when an engine configuration is built.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use rcgen::{CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::Error;

/// Host name the built-in test certificate is issued for.
pub const TEST_CERT_HOST: &str = "localhost";

static TEST_CERT: Lazy<Result<Arc<CertKeyPair>, String>> = Lazy::new(|| {
    generate_self_signed(&[TEST_CERT_HOST])
        .map(Arc::new)
        .map_err(|e| e.to_string())
});

/// PEM certificate chain and private key.
#[derive(Clone)]
pub struct CertKeyPair {
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<Vec<u8>>,
}

impl CertKeyPair {
    /// Wrap PEM material. Fails unless the chain holds at least one
    /// certificate and the key parses.
    pub fn from_pem(cert_pem: impl Into<Vec<u8>>, key_pem: impl Into<Vec<u8>>) -> Result<Self, Error> {
        let pair = CertKeyPair {
            cert_pem: cert_pem.into(),
            key_pem: Zeroizing::new(key_pem.into()),
        };
        if pair.certificates()?.is_empty() {
            return Err(Error::Certificate("no certificate in PEM".into()));
        }
        pair.private_key()?;
        Ok(pair)
    }

    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// Decode the certificate chain, leaf first.
    pub fn certificates(&self) -> Result<Vec<CertificateDer<'static>>, Error> {
        rustls_pemfile::certs(&mut &self.cert_pem[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| Error::Certificate(format!("bad certificate PEM: {}", e)))
    }

    /// Decode the private key.
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>, Error> {
        rustls_pemfile::private_key(&mut &self.key_pem[..])
            .map_err(|e| Error::Certificate(format!("bad key PEM: {}", e)))?
            .ok_or_else(|| Error::Certificate("no private key in PEM".into()))
    }

    /// SHA-256 over the DER encoded leaf certificate.
    pub fn fingerprint(&self) -> Result<Vec<u8>, Error> {
        let certs = self.certificates()?;
        let leaf = certs
            .first()
            .ok_or_else(|| Error::Certificate("no certificate in PEM".into()))?;
        Ok(calculate_fingerprint(leaf.as_ref()))
    }

    /// Leaf fingerprint as a human-readable string, for example "AF:12:F6:...".
    pub fn fingerprint_str(&self) -> Result<String, Error> {
        Ok(format_fingerprint(&self.fingerprint()?))
    }
}

impl fmt::Debug for CertKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertKeyPair")
            .field("cert_pem", &self.cert_pem.len())
            .field("key_pem", &self.key_pem.len())
            .finish()
    }
}

/// Generate a self-signed P-256 certificate for the given names.
pub fn generate_self_signed(names: &[&str]) -> Result<CertKeyPair, Error> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Certificate(format!("key generation failed: {}", e)))?;

    let subject_alt_names = names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    let mut params = CertificateParams::new(subject_alt_names)
        .map_err(|e| Error::Certificate(format!("bad certificate params: {}", e)))?;

    let mut distinguished_name = DistinguishedName::new();
    distinguished_name.push(DnType::OrganizationName, "fifotls");
    if let Some(cn) = names.first() {
        distinguished_name.push(DnType::CommonName, *cn);
    }
    params.distinguished_name = distinguished_name;
    params.is_ca = IsCa::NoCa;

    // One year, starting a day back to tolerate clock skew.
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(1);
    params.not_after = now + time::Duration::days(365);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Certificate(format!("self signing failed: {}", e)))?;

    Ok(CertKeyPair {
        cert_pem: cert.pem().into_bytes(),
        key_pem: Zeroizing::new(key_pair.serialize_pem().into_bytes()),
    })
}

/// The built-in test certificate, issued for [`TEST_CERT_HOST`].
///
/// Generated once per process.
pub fn test_cert_key() -> Result<Arc<CertKeyPair>, Error> {
    (*TEST_CERT).clone().map_err(Error::Certificate)
}

/// Calculate a certificate fingerprint using SHA-256
pub fn calculate_fingerprint(cert_der: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hasher.finalize().to_vec()
}

/// Format a fingerprint as a colon-separated hex string
/// Example: "AF:12:F6:..."
pub fn format_fingerprint(fingerprint: &[u8]) -> String {
    fingerprint
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<String>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_round_trips_through_pem() {
        let pair = generate_self_signed(&["example.test"]).unwrap();
        assert_eq!(pair.certificates().unwrap().len(), 1);
        assert!(pair.private_key().is_ok());
        assert_eq!(pair.fingerprint().unwrap().len(), 32);

        let again = CertKeyPair::from_pem(pair.cert_pem().to_vec(), pair.key_pem.to_vec()).unwrap();
        assert_eq!(again.fingerprint().unwrap(), pair.fingerprint().unwrap());
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let err = CertKeyPair::from_pem(b"not a cert".to_vec(), b"not a key".to_vec()).unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_cert_is_shared() {
        let a = test_cert_key().unwrap();
        let b = test_cert_key().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_fingerprint_formatting() {
        let test_fingerprint = vec![0xAF, 0x12, 0xF6, 0x38, 0x2A];
        let formatted = format_fingerprint(&test_fingerprint);
        assert_eq!(formatted, "AF:12:F6:38:2A");

        let pair = test_cert_key().unwrap();
        let formatted = pair.fingerprint_str().unwrap();

        // 32 hex pairs with : between them
        assert_eq!(formatted.len(), 95);
        for segment in formatted.split(':') {
            assert_eq!(segment.len(), 2);
            assert!(u8::from_str_radix(segment, 16).is_ok());
        }
    }
}
