//! Cluster agent daemon.
//!
//! One dispatcher process multiplexes the listening sockets and forks a
//! worker per accepted connection; each worker runs the blocking command
//! loop in [`command`] against the collaborators in [`components`].

pub mod command;
pub mod components;
pub mod config;

#[cfg(unix)]
pub mod dispatcher;
#[cfg(unix)]
pub mod signals;
#[cfg(unix)]
pub mod worker;

pub use command::{CloseReason, CommandProtocol, ProtocolState};
pub use components::{
    CatalogConfiguration, ComponentLifecycle, Configuration, InvalidValue, ParamLookup,
    ScriptLifecycle, Services,
};
pub use config::AgentConfig;
#[cfg(unix)]
pub use dispatcher::{Dispatcher, DispatcherState};
