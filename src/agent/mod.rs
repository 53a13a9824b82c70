//! Measurement agent
//!
//! Shared runtime state ([`context`]), remote start/stop ([`control`]),
//! delivery bookkeeping ([`tracker`]), the single measurement cycle
//! ([`cycle`]), and the process-level wiring around it ([`lifecycle`]).

pub mod context;
pub mod control;
pub mod cycle;
pub mod lifecycle;
pub mod tracker;

pub use context::{AgentContext, SequenceCounter};
pub use control::{dispatch_method, ControlState, MethodRoute, METHOD_TABLE};
pub use cycle::{Agent, CycleOutcome, CycleSettings, CycleState};
pub use lifecycle::{AgentLifecycle, LifecycleError};
pub use tracker::{DeliveryCounters, DeliveryTracker, FailureCounts, SendStatus};
