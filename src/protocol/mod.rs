//! Wire-level message types, delivery outcomes, and device topics
//!
//! Shared vocabulary between the agent core and the cloud transport.

pub mod events;
pub mod messages;
pub mod topics;

pub use events::*;
pub use messages::*;
pub use topics::*;
