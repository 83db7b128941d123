pub mod decision;
pub mod mode;

pub use decision::{AimConfig, CycleDecision, DecisionEngine, HoldReason};
pub use mode::{EngagementOrder, EngagementPhase, FireAuthority, Mode, ModeMachine};
