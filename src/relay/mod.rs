//! The forwarding pipeline: rule resolution, filtering, fan-out and routing.

pub mod dispatcher;
pub mod filter;
pub mod router;
pub mod rules;
pub mod types;

pub use dispatcher::Dispatcher;
pub use router::Router;
pub use rules::{Binding, RuleResolver};
pub use types::{DropReason, InboundEvent, RelayOutcome, TargetOutcome};
