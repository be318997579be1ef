//! TLS secret validation.
//!
//! A serving secret must be a `kubernetes.io/tls` secret whose certificate
//! chain parses and whose private key is plausibly the leaf's: the key
//! algorithm family has to match the leaf's public key. A CA secret only
//! needs a parseable `ca.crt` bundle.

use k8s_openapi::api::core::v1::Secret;
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::cache::ObjectKey;

pub(crate) const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";
pub(crate) const TLS_CERT_KEY: &str = "tls.crt";
pub(crate) const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub(crate) const CA_CERT_KEY: &str = "ca.crt";

/// A validated secret, carried in the DAG and inlined into listener
/// filter chains at translation time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TlsSecret {
    pub key: ObjectKey,
    /// PEM certificate chain, leaf first.
    pub cert_pem: Vec<u8>,
    /// PEM private key. Empty for CA-only secrets.
    pub key_pem: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum SecretError {
    #[error("secret is not of type {TLS_SECRET_TYPE}")]
    NotTlsType,

    #[error("secret is missing data key {0:?}")]
    MissingData(&'static str),

    #[error("certificate chain does not parse: {0}")]
    InvalidCertificate(String),

    #[error("private key does not parse")]
    InvalidPrivateKey,

    #[error("private key does not match the leaf certificate")]
    KeyMismatch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum KeyFamily {
    Rsa,
    Ec,
    // pkcs8 doesn't expose its algorithm without decoding the inner
    // structure. accept it rather than reject working configs.
    Unknown,
}

/// Validate a serving certificate secret.
pub(crate) fn tls_secret(key: ObjectKey, secret: &Secret) -> Result<TlsSecret, SecretError> {
    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return Err(SecretError::NotTlsType);
    }

    let data = secret.data.as_ref();
    let cert_pem = data
        .and_then(|d| d.get(TLS_CERT_KEY))
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
        .ok_or(SecretError::MissingData(TLS_CERT_KEY))?;
    let key_pem = data
        .and_then(|d| d.get(TLS_PRIVATE_KEY_KEY))
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
        .ok_or(SecretError::MissingData(TLS_PRIVATE_KEY_KEY))?;

    let leaf_family = parse_cert_chain(&cert_pem)?;
    let key_family = parse_private_key(&key_pem)?;

    match (leaf_family, key_family) {
        (_, KeyFamily::Unknown) => {}
        (leaf, key) if leaf == key => {}
        _ => return Err(SecretError::KeyMismatch),
    }

    Ok(TlsSecret {
        key,
        cert_pem,
        key_pem,
    })
}

/// Validate a CA bundle secret (`ca.crt`, or the cert of a TLS secret
/// doing double duty).
pub(crate) fn ca_secret(key: ObjectKey, secret: &Secret) -> Result<TlsSecret, SecretError> {
    let data = secret.data.as_ref();
    let ca_pem = data
        .and_then(|d| d.get(CA_CERT_KEY))
        .or_else(|| data.and_then(|d| d.get(TLS_CERT_KEY)))
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
        .ok_or(SecretError::MissingData(CA_CERT_KEY))?;

    parse_cert_chain(&ca_pem)?;

    Ok(TlsSecret {
        key,
        cert_pem: ca_pem,
        key_pem: Vec::new(),
    })
}

/// Parse every certificate in the PEM bundle; return the leaf's key
/// family.
fn parse_cert_chain(pem: &[u8]) -> Result<KeyFamily, SecretError> {
    let mut reader = std::io::Cursor::new(pem);
    let certs: Vec<_> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|err| SecretError::InvalidCertificate(err.to_string()))?;

    if certs.is_empty() {
        return Err(SecretError::InvalidCertificate(
            "no certificates in bundle".to_string(),
        ));
    }

    let mut leaf_family = KeyFamily::Unknown;
    for (i, der) in certs.iter().enumerate() {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|err| SecretError::InvalidCertificate(err.to_string()))?;
        if i == 0 {
            let algorithm = &cert.public_key().algorithm.algorithm;
            leaf_family = if *algorithm == OID_PKCS1_RSAENCRYPTION {
                KeyFamily::Rsa
            } else if *algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY {
                KeyFamily::Ec
            } else {
                KeyFamily::Unknown
            };
        }
    }

    Ok(leaf_family)
}

fn parse_private_key(pem: &[u8]) -> Result<KeyFamily, SecretError> {
    let mut reader = std::io::Cursor::new(pem);
    for item in rustls_pemfile::read_all(&mut reader) {
        match item.map_err(|_| SecretError::InvalidPrivateKey)? {
            rustls_pemfile::Item::Pkcs1Key(_) => return Ok(KeyFamily::Rsa),
            rustls_pemfile::Item::Sec1Key(_) => return Ok(KeyFamily::Ec),
            rustls_pemfile::Item::Pkcs8Key(_) => return Ok(KeyFamily::Unknown),
            _ => continue,
        }
    }
    Err(SecretError::InvalidPrivateKey)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    use crate::dag::fixtures::{TLS_CERT as EC_CERT, TLS_KEY as EC_KEY};

    fn secret(type_: Option<&str>, data: &[(&str, &str)]) -> Secret {
        Secret {
            type_: type_.map(|t| t.to_string()),
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_secret_accepted() {
        let s = secret(
            Some(TLS_SECRET_TYPE),
            &[(TLS_CERT_KEY, EC_CERT), (TLS_PRIVATE_KEY_KEY, EC_KEY)],
        );
        let validated = tls_secret(ObjectKey::new("default", "s"), &s).unwrap();
        assert_eq!(validated.cert_pem, EC_CERT.as_bytes());
        assert_eq!(validated.key_pem, EC_KEY.as_bytes());
    }

    #[test]
    fn test_ca_secret_accepts_cert_bundle() {
        let s = secret(Some("Opaque"), &[(CA_CERT_KEY, EC_CERT)]);
        let validated = ca_secret(ObjectKey::new("default", "ca"), &s).unwrap();
        assert!(validated.key_pem.is_empty());
    }

    #[test]
    fn test_wrong_type_rejected() {
        let s = secret(Some("Opaque"), &[(TLS_CERT_KEY, EC_CERT), (TLS_PRIVATE_KEY_KEY, EC_KEY)]);
        let err = tls_secret(ObjectKey::new("default", "s"), &s).unwrap_err();
        assert!(matches!(err, SecretError::NotTlsType));
    }

    #[test]
    fn test_missing_key_rejected() {
        let s = secret(Some(TLS_SECRET_TYPE), &[(TLS_CERT_KEY, EC_CERT)]);
        let err = tls_secret(ObjectKey::new("default", "s"), &s).unwrap_err();
        assert!(matches!(err, SecretError::MissingData(TLS_PRIVATE_KEY_KEY)));
    }

    #[test]
    fn test_garbage_cert_rejected() {
        let s = secret(
            Some(TLS_SECRET_TYPE),
            &[(TLS_CERT_KEY, "not a pem"), (TLS_PRIVATE_KEY_KEY, EC_KEY)],
        );
        let err = tls_secret(ObjectKey::new("default", "s"), &s).unwrap_err();
        assert!(matches!(err, SecretError::InvalidCertificate(_)));
    }

    #[test]
    fn test_ca_secret_needs_ca_crt() {
        let s = secret(Some("Opaque"), &[("other", "zzz")]);
        let err = ca_secret(ObjectKey::new("default", "ca"), &s).unwrap_err();
        assert!(matches!(err, SecretError::MissingData(CA_CERT_KEY)));
    }
}
