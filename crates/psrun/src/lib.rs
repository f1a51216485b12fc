//! psrun: asynchronous PowerShell script execution on remote Windows hosts.
//!
//! Remote hosts are reachable only through a synchronous SSH command channel.
//! This crate stages a script and a wrapper on the host, launches the wrapper
//! detached from the caller, and lets the caller poll for output, completion
//! and exit status without blocking.
//!
//! The channel and the elevation strategy are traits
//! ([`channel::SecureChannel`], [`elevation::ElevationMethod`]); the crate
//! ships an OpenSSH-backed channel and sudo, dzdo and su elevation.

#![forbid(unsafe_code)]
// Library documentation is in progress. Public API types have docs;
// internal types will be documented in future releases.
#![allow(missing_docs)]

pub mod channel;
pub mod config;
pub mod elevation;
pub mod model;
pub mod runner;
pub mod shell;
pub mod upload;
pub mod wrapper;

pub use crate::model::*;
pub use crate::runner::{ErrorCode, PowershellRunner, RunnerError, RunnerResult};
