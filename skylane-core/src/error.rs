//! Errors raised while routing requests or resolving certificates.

/// Routing and certificate errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The resolved rule has no upstream with a reachable address.
    #[error("no upstream available")]
    NoUpstreamAvailable,

    /// The certificate store is empty.
    #[error("no certificate available")]
    NoCertificateAvailable,

    /// PEM material could not be turned into a usable credential.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Certificate files could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// The file that failed.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}
