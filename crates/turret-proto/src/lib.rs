pub mod telemetry;
pub mod wire;

pub use telemetry::SystemTelemetry;
pub use wire::{Ack, Command, CommandFrame, CommandKind, Inbound, Push, StatusReport};
