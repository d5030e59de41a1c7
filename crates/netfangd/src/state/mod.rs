//! Network state machine
//!
//! Classifies every network the appliance joins and drives the plugins:
//! - WAITING_FOR_NETWORK: no link
//! - CONNECTING / RECONNECTING: link up, classification pending
//! - CONNECTED_{HOME,KNOWN,NEW,BLACKLISTED}: stable, classified
//! - SCANNING_IN_PROGRESS → SCAN_COMPLETED → PERFORMING_ACTION: scan cycle
//! - DISCONNECTED: link lost, processes for the old network cancelled

pub mod admin;
pub mod machine;
pub mod types;

pub use admin::{AdminAction, AdminRequest, AdminResponse};
pub use machine::StateMachine;
pub use types::{LinkEvent, MachineSnapshot, NetworkState, StateUpdate};
