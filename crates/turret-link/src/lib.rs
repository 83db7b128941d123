pub mod bridge;
pub mod serial;

pub use bridge::{Bridge, BridgeEvent, LinkConfig, LinkError, LinkHealth};
pub use serial::{SerialReader, SerialWriter};
