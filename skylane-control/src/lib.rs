//! Skylane Control
//!
//! The control plane. It mirrors cluster services and endpoints into a
//! [`TopologyCache`], turns routing intents into complete route tables with
//! the [`RouteSynchronizer`] and pushes them to the data plane through the
//! [`DataPlaneClient`]. Its REST API is in [`api`].

pub mod api;
pub mod client;
pub mod discovery;
pub mod error;
pub mod synchronizer;

pub use self::client::DataPlaneClient;
pub use self::discovery::TopologyCache;
pub use self::error::Error;
pub use self::synchronizer::{RouteIntent, RouteSynchronizer};
