//! Control plane error types.

/// Errors surfaced to callers of the control plane.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A service reference was not of the form `namespace/name`.
    #[error("malformed service reference {0:?}: expected namespace/name")]
    MalformedServiceReference(String),

    /// The referenced service has no known ready endpoint.
    #[error("service {0} has no ready endpoints")]
    UnresolvedService(String),

    /// The data plane did not accept a route table push. The previously
    /// published table stays in effect.
    #[error("data plane rejected route update: {0}")]
    PublishRejected(String),

    /// No routing intent is stored under the given id.
    #[error("routing intent {0} not found")]
    IntentNotFound(String),

    /// A relayed data plane request failed.
    #[error("data plane request failed: {message}")]
    DataPlane {
        /// Status the data plane answered with, if it answered at all.
        status: Option<u16>,
        /// What went wrong.
        message: String,
    },
}
