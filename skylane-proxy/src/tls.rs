//! TLS termination for the HTTPS listener.
//!
//! The server config resolves its certificate per handshake from the shared
//! [`CertificateStore`], so certificates added through the admin API are
//! served without rebuilding the acceptor.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use skylane_core::CertificateStore;

/// Builds a TLS acceptor that picks certificates from `store` by SNI.
pub fn acceptor(store: Arc<CertificateStore>) -> Result<TlsAcceptor, rustls::Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(store);

    // Connections are served over HTTP/1.1 only.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Loads the startup certificate from PEM files into `store` under `domain`.
pub fn load_default_certificate<P: AsRef<Path>>(
    store: &CertificateStore,
    domain: &str,
    cert_path: P,
    key_path: P,
) -> Result<(), skylane_core::Error> {
    let key = skylane_core::tls::load_certified_key(cert_path, key_path)?;
    store.insert(domain, Arc::new(key));
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pki_types::{CertificateDer, ServerName};
    use rustls::{ClientConfig, RootCertStore};
    use tokio_rustls::TlsConnector;

    pub(crate) struct Generated {
        pub(crate) cert_pem: String,
        pub(crate) key_pem: String,
        der: CertificateDer<'static>,
    }

    pub(crate) fn generate(domain: &str) -> Generated {
        let generated = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        Generated {
            cert_pem: generated.cert.pem(),
            key_pem: generated.key_pair.serialize_pem(),
            der: generated.cert.der().clone(),
        }
    }

    pub(crate) fn connector(roots: &[&Generated]) -> TlsConnector {
        let mut store = RootCertStore::empty();
        for generated in roots {
            store.add(generated.der.clone()).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(store)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Runs one handshake for `sni` and returns the server-side SNI, or the
    /// client error.
    async fn handshake(
        acceptor: TlsAcceptor,
        connector: TlsConnector,
        sni: &'static str,
    ) -> Result<Option<String>, std::io::Error> {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let server = tokio::spawn(async move {
            acceptor
                .accept(server_io)
                .await
                .map(|stream| stream.get_ref().1.server_name().map(str::to_string))
        });
        let name = ServerName::try_from(sni).unwrap();
        // Keep the client open until the server finishes its side of the handshake.
        let _client = connector.connect(name, client_io).await?;
        server.await.unwrap()
    }

    #[tokio::test]
    async fn serves_certificate_matching_sni() {
        let store = Arc::new(CertificateStore::new());
        let x = generate("x.com");
        let y = generate("y.com");
        store.insert_pem("x.com", x.cert_pem.as_bytes(), x.key_pem.as_bytes()).unwrap();
        store.insert_pem("y.com", y.cert_pem.as_bytes(), y.key_pem.as_bytes()).unwrap();
        let acceptor = acceptor(store).unwrap();

        // Each client trusts only the certificate for the name it asks for.
        let sni = handshake(acceptor.clone(), connector(&[&x]), "x.com").await.unwrap();
        assert_eq!(sni.as_deref(), Some("x.com"));
        let sni = handshake(acceptor, connector(&[&y]), "y.com").await.unwrap();
        assert_eq!(sni.as_deref(), Some("y.com"));
    }

    #[tokio::test]
    async fn empty_store_fails_handshake() {
        let x = generate("x.com");
        let acceptor = acceptor(Arc::new(CertificateStore::new())).unwrap();
        assert!(handshake(acceptor, connector(&[&x]), "x.com").await.is_err());
    }
}
