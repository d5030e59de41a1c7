//! NetFang daemon library
//!
//! Classifies every network the appliance joins and drives reconnaissance
//! plugins against it.

pub mod alert_bus;
pub mod builtin;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod plugin;
pub mod registry;
pub mod state;
pub mod supervisor;

pub use alert_bus::{AlertBus, DashboardEvent, PluginLogLine, Subscription};
pub use daemon::{ControlMessage, Daemon, DaemonHandle};
pub use dispatcher::{OutcomeKind, PluginDispatcher, PluginOutcome};
pub use error::{AdminError, PluginError, SupervisorError};
pub use plugin::{Hook, HookContext, HookReply, Plugin, Precondition};
pub use registry::{PluginDescriptor, PluginRegistry};
pub use state::{AdminAction, AdminRequest, LinkEvent, NetworkState, StateMachine};
pub use supervisor::{ProcessStatus, ProcessSupervisor, ScanRequest, SupervisorEvent};
