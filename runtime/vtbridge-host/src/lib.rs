//!
//! vtbridge-host - Host-side Leaf Types
//!
//! This crate provides the pieces shared by every adapter call the
//! virtual-table bridge makes into host code:
//!
//! - `Value`, `ColumnValue` and `FilterArg` plus the raw marshaling routines
//!   that move them across the SQLite value ABI
//! - `HostError` and `ErrorKind`, the exception bridge between host failures
//!   and SQLite result codes, with thread-local pending/last-failure slots
//! - `BridgeConfig`, the process-wide configuration (limits, diagnostics,
//!   per-module options)
//! - The reentrant host lock every adapter call holds while host code runs
//!
//! Everything here is a leaf: nothing depends on the adapters in `vtbridge`.
//!

pub mod config;
pub mod exception;
pub mod host;
pub mod value;

pub use config::{BridgeConfig, ConfigError, Diagnostics, Limits, ModuleOptions};
pub use exception::{
    CallSite, ErrorKind, FailureOrigin, HostError, HostResult, clear_unraisable_hook, pending,
    raise, record_failure, report_unraisable, set_unraisable_hook, take_last_failure,
    take_pending,
};
pub use host::HostGuard;
pub use value::{ColumnValue, FilterArg, Value};
