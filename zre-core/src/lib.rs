//! ZRE proximity protocol core.
//! Host-driven: no I/O; host passes inputs and receives actions.

pub mod beacon;
pub mod core;
pub mod event;
pub mod group;
pub mod identity;
pub mod liveness;
pub mod peer;
pub mod protocol;
pub mod wire;

pub use beacon::{Beacon, BeaconError, DISCOVERY_PORT};
pub use crate::core::{Action, CommandError, NodeCore, ProtocolError};
pub use event::{Event, EventKind, Payload};
pub use group::GroupRegistry;
pub use identity::{NodeId, NodeIdentity};
pub use liveness::{Liveness, Timeouts, TimeoutsError};
pub use peer::{Peer, PeerTable};
pub use protocol::{Envelope, Headers, Message, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
