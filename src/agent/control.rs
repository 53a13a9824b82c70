//! Remote start/stop control
//!
//! [`ControlState`] is the single long-lived flag the cloud can flip through
//! device methods. Method names are resolved through [`METHOD_TABLE`]; names
//! not in the table change nothing and still receive a 200 acknowledgement.

use crate::protocol::messages::MethodAck;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Whether the agent is currently permitted to send telemetry
#[derive(Debug)]
pub struct ControlState {
    enabled: AtomicBool,
}

impl ControlState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new(true)
    }
}

/// State transition applied by a recognised method
pub type Transition = fn(&ControlState);

/// One entry of the method dispatch table
#[derive(Debug, Clone, Copy)]
pub struct MethodRoute {
    pub name: &'static str,
    pub transition: Transition,
    pub response: &'static str,
}

fn start_sending(state: &ControlState) {
    state.set(true);
}

fn stop_sending(state: &ControlState) {
    state.set(false);
}

/// Every method that mutates [`ControlState`]
pub static METHOD_TABLE: [MethodRoute; 2] = [
    MethodRoute {
        name: "start",
        transition: start_sending,
        response: "Successfully started",
    },
    MethodRoute {
        name: "stop",
        transition: stop_sending,
        response: "Successfully stopped",
    },
];

/// Response text for methods outside the table
pub const DEFAULT_METHOD_RESPONSE: &str = "This is the response from the device";

/// Look up a method route by name
pub fn route_for(method_name: &str) -> Option<&'static MethodRoute> {
    METHOD_TABLE.iter().find(|route| route.name == method_name)
}

/// Apply `method_name` to `state` and build its acknowledgement
pub fn dispatch_method(state: &ControlState, method_name: &str) -> MethodAck {
    match route_for(method_name) {
        Some(route) => {
            (route.transition)(state);
            info!(
                method = route.name,
                enabled = state.get(),
                "Control state updated by device method"
            );
            MethodAck::ok(route.response)
        }
        None => {
            info!(method = method_name, "Unrecognized device method acknowledged");
            MethodAck::ok(DEFAULT_METHOD_RESPONSE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initially_enabled() {
        assert!(ControlState::default().get());
    }

    #[test]
    fn test_stop_then_start() {
        let state = ControlState::default();

        let ack = dispatch_method(&state, "stop");
        assert!(!state.get());
        assert_eq!(ack.status, 200);
        assert_eq!(ack.response, json!({"Response": "Successfully stopped"}));

        let ack = dispatch_method(&state, "start");
        assert!(state.get());
        assert_eq!(ack.response, json!({"Response": "Successfully started"}));
    }

    #[test]
    fn test_unknown_method_leaves_state_unchanged() {
        let state = ControlState::new(false);

        let ack = dispatch_method(&state, "reboot");

        assert!(!state.get());
        assert_eq!(ack.status, 200);
        assert_eq!(
            ack.response,
            json!({"Response": "This is the response from the device"})
        );
    }

    #[test]
    fn test_method_names_are_case_sensitive() {
        let state = ControlState::default();
        dispatch_method(&state, "STOP");
        assert!(state.get());
    }

    #[test]
    fn test_table_names_are_unique() {
        let mut names: Vec<&str> = METHOD_TABLE.iter().map(|r| r.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), METHOD_TABLE.len());
    }
}
