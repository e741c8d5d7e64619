//! Domain-keyed TLS credentials and SNI-based certificate resolution.
//!
//! Certificates change rarely, so the store is a plain read/write-locked map
//! rather than a hot-swapped snapshot like the route table. Lookups during the
//! handshake take the read lock only.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use pki_types::CertificateDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use serde::Serialize;

use crate::error::Error;

#[derive(Debug, Clone)]
struct StoredCertificate {
    key: Arc<CertifiedKey>,
    added_at: DateTime<Utc>,
}

/// Listing entry for one stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateInfo {
    /// Domain the credential is served for.
    pub domain: String,
    /// When it was added.
    pub added_at: DateTime<Utc>,
}

/// TLS credentials keyed by domain.
#[derive(Debug, Default)]
pub struct CertificateStore {
    certs: RwLock<BTreeMap<String, StoredCertificate>>,
}

impl CertificateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the credential for `domain`.
    pub fn insert(&self, domain: &str, key: Arc<CertifiedKey>) {
        let domain = domain.to_ascii_lowercase();
        tracing::info!(%domain, "Certificate added");
        self.certs.write().insert(
            domain,
            StoredCertificate {
                key,
                added_at: Utc::now(),
            },
        );
    }

    /// Parse a PEM certificate chain and private key and store them for `domain`.
    pub fn insert_pem(&self, domain: &str, cert_pem: &[u8], key_pem: &[u8]) -> Result<(), Error> {
        let key = certified_key_from_pem(cert_pem, key_pem)?;
        self.insert(domain, Arc::new(key));
        Ok(())
    }

    /// Remove the credential for `domain`. Returns whether one was present.
    pub fn remove(&self, domain: &str) -> bool {
        let removed = self.certs.write().remove(&domain.to_ascii_lowercase()).is_some();
        if removed {
            tracing::info!(%domain, "Certificate removed");
        }
        removed
    }

    /// List stored domains in lexicographic order.
    pub fn list(&self) -> Vec<CertificateInfo> {
        self.certs
            .read()
            .iter()
            .map(|(domain, stored)| CertificateInfo {
                domain: domain.clone(),
                added_at: stored.added_at,
            })
            .collect()
    }

    /// Number of stored credentials.
    pub fn len(&self) -> usize {
        self.certs.read().len()
    }

    /// Whether the store holds no credentials.
    pub fn is_empty(&self) -> bool {
        self.certs.read().is_empty()
    }

    /// Pick the credential for a requested server name.
    ///
    /// An exact domain match wins. An unknown or missing server name gets the
    /// lexicographically first stored credential as a default.
    pub fn lookup(&self, server_name: Option<&str>) -> Result<Arc<CertifiedKey>, Error> {
        let certs = self.certs.read();

        if let Some(name) = server_name {
            if let Some(stored) = certs.get(&name.to_ascii_lowercase()) {
                return Ok(stored.key.clone());
            }
        }

        let (domain, stored) = certs.iter().next().ok_or(Error::NoCertificateAvailable)?;
        tracing::debug!(requested = ?server_name, default = %domain, "Serving default certificate");
        Ok(stored.key.clone())
    }
}

impl ResolvesServerCert for CertificateStore {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        match self.lookup(server_name) {
            Ok(key) => Some(key),
            Err(error) => {
                tracing::warn!(?server_name, %error, "TLS handshake has no certificate");
                None
            }
        }
    }
}

/// Build a signing credential from a PEM certificate chain and PEM private key.
pub fn certified_key_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<CertifiedKey, Error> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidCertificate(format!("certificate chain: {}", e)))?;
    if certs.is_empty() {
        return Err(Error::InvalidCertificate("no certificates in PEM".into()));
    }

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::InvalidCertificate(format!("private key: {}", e)))?
        .ok_or_else(|| Error::InvalidCertificate("no private key in PEM".into()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| Error::InvalidCertificate(e.to_string()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Loads a credential from certificate and key files on disk.
pub fn load_certified_key<P: AsRef<Path>>(cert_path: P, key_path: P) -> Result<CertifiedKey, Error> {
    let read = |path: &Path| {
        std::fs::read(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })
    };
    let cert_pem = read(cert_path.as_ref())?;
    let key_pem = read(key_path.as_ref())?;
    certified_key_from_pem(&cert_pem, &key_pem)
}
