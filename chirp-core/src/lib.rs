//! Chirp core: tracker store, protocol types and peer wire helpers.
//! Host-driven: no I/O; the host owns sockets and locking.

pub mod error;
pub mod protocol;
pub mod tracker;
pub mod wire;

pub use error::TrackerError;
pub use protocol::{Directory, Message, PUBLIC_CHANNEL, SYSTEM_SENDER};
pub use tracker::{Delivery, PeerRecord, Tracker};
