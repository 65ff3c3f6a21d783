//! ZRE proximity node: tokio host for `zre-core`.
//!
//! [`Node`] discovers peers on the local network with UDP beacons, keeps a
//! TCP link to each of them and delivers what it observes as [`Event`]s.

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod logging;
pub mod node;
pub mod transport;

pub use config::{Config, ConfigError};
pub use error::Error;
pub use node::Node;
pub use zre_core::{Event, EventKind, Headers, NodeId, Payload};
