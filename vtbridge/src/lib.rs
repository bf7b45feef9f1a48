//!
//! vtbridge - SQLite Virtual-Table Protocol Bridge
//!
//! Lets Rust objects serve as SQLite virtual tables. A `TableFactory` is
//! registered as a module on a `rusqlite::Connection`; the bridge fills the
//! engine's `sqlite3_module` callback table with adapters that:
//!
//! - build tables through Create/Connect and declare their schema
//! - negotiate BestIndex in tuple form (`IndexPlan`) or object form (`IndexInfo`)
//! - drive cursors through Filter/Eof/Column/Next/Rowid/Close
//! - dispatch Update into delete, insert and change calls
//! - relay transaction, savepoint, rename, integrity and FindFunction hooks
//! - answer xShadowName through a fixed pool of trampolines
//!
//! Every call into host code holds the host lock, checks for pending
//! failures, catches panics and converts failures to engine result codes
//! with the call site attached. See `vtbridge_host` for values, errors and
//! configuration.
//!
//! ## Example
//!
//! ```ignore
//! let conn = Connection::open_in_memory()?;
//! register_module(&conn, "series", SeriesFactory, ModuleOptions::default())?;
//! conn.execute_batch("CREATE VIRTUAL TABLE nums USING series(1, 10)")?;
//! ```
//!

mod call;
mod cursor;
mod index;
mod module;
mod overload;
mod shadow;
mod table;
mod update;

pub use cursor::VirtualCursor;
pub use index::{
    Constraint, ConstraintOp, ConstraintUsage, DistinctMode, FUNCTION_CONSTRAINT_MAX,
    FUNCTION_CONSTRAINT_MIN, IndexInfo, IndexPlan, OrderBy, SCAN_UNIQUE,
};
pub use module::{
    CreateArgs, RegisterError, TableFactory, VTabConfig, drop_modules, register_module,
    register_module_arc, register_module_configured,
};
pub use overload::{FunctionOverload, ScalarFunction};
pub use shadow::{SHADOW_POOL_CAPACITY, ShadowNamePool};
pub use table::{TableCapabilities, VirtualTable};
pub use update::{ConflictMode, UpdateContext};

pub use vtbridge_host::{
    BridgeConfig, ColumnValue, ConfigError, ErrorKind, FailureOrigin, FilterArg, HostError,
    HostResult, ModuleOptions, Value, clear_unraisable_hook, pending, raise, set_unraisable_hook,
    take_last_failure,
};
