//! Peer-to-peer networking: wire protocol, relay, and sync coordination.

pub mod protocol;
pub mod relay;
pub mod sync;

pub use protocol::{FrameReader, Message, MessageType};
pub use relay::Relay;
pub use sync::SyncCoordinator;
