//! devrunner core - platform-independent supervision of a local dev server
//!
//! This crate provides the supervisor state machine, port probing, session
//! logs and the traits that platform-specific process managers implement.

mod config;
mod error;
mod logs;
mod notifier;
mod probe;
mod process;
mod process_manager_trait;
mod state;
mod supervisor;
mod termination;

#[cfg(test)]
pub(crate) mod testing;

pub use config::*;
pub use error::*;
pub use logs::*;
pub use notifier::*;
pub use probe::*;
pub use process::*;
pub use process_manager_trait::*;
pub use state::*;
pub use supervisor::{StartOutcome, StatusReport, Supervisor};
pub use termination::*;
