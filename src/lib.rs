//! fwconverge - firewall policy convergence
//!
//! Compiles tenant-scoped firewall rules into per-instance packet-filter
//! configuration. Every mutating operation loads the stored rules and remote
//! instances, works out which local instances are affected, renders their
//! configuration files and writes them atomically before asking the live
//! filter to reload.

pub mod affected;
pub mod cli;
pub mod compiler;
pub mod config;
pub mod control;
pub mod core;
pub mod engine;
pub mod errors;
pub mod lookup;
pub mod pipeline;
pub mod query;
pub mod resolve;
pub mod store;

pub use crate::core::{
    Action, Instance, InstanceRecord, PortTarget, Protocol, RemoteInstance, Rule, RuleInput, Side,
    Target, Wildcard,
};
pub use control::{FilterControl, FilterStatus, LoggingFilterControl};
pub use engine::{ChangeRequest, DeleteRequest, Engine, InstanceRequest, OpReport, ReloadFailure};
pub use errors::{FwError, Result};
pub use query::{RemoteRef, RemoteTargets, RuleRef, TagSelector};
