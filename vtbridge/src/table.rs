//!
//! Table Adapter
//!
//! `TableAdapter` is the `sqlite3_vtab` the engine holds for each table a
//! module creates or connects. It owns the host table object, the capability
//! flags the table reported when it was constructed, and the function
//! overloads handed out through FindFunction.
//!
//! Optional hooks are gated by `TableCapabilities`: a hook whose flag is
//! clear is never called and the bridge answers with its default (success,
//! or a read-only failure for mutation).
//!

use std::ffi::{c_char, c_int};

use rusqlite::ffi;
use vtbridge_host::{ColumnValue, HostError, HostResult, ModuleOptions, record_failure};

use crate::call::{
    Ident, adapter_call, borrow_str, engine_message, fail_vtab, teardown_call, unraisable,
};
use crate::cursor::VirtualCursor;
use crate::index::{self, Constraint, IndexInfo, IndexPlan, OrderBy};
use crate::overload::{FunctionOverload, OverloadRegistry};
use crate::update::UpdateContext;

/// Optional hooks a table implements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCapabilities {
    pub disconnect: bool,
    pub update: bool,
    /// Begin, Sync, Commit and Rollback.
    pub transactions: bool,
    /// Savepoint, Release and RollbackTo.
    pub savepoints: bool,
    pub rename: bool,
    pub integrity: bool,
    pub find_function: bool,
}

impl TableCapabilities {
    pub fn all() -> Self {
        Self {
            disconnect: true,
            update: true,
            transactions: true,
            savepoints: true,
            rename: true,
            integrity: true,
            find_function: true,
        }
    }
}

/// A virtual table implemented in Rust.
///
/// `open` and `destroy` are mandatory. Every other hook only runs when the
/// matching flag is set in `capabilities`.
pub trait VirtualTable: Send {
    /// Read once, right after Create/Connect.
    fn capabilities(&self) -> TableCapabilities {
        TableCapabilities::default()
    }

    /// Tuple-form BestIndex. Only usable constraints are offered.
    ///
    /// `Ok(None)` means no index is available.
    fn best_index(
        &mut self,
        constraints: &[Constraint],
        order_bys: &[OrderBy],
    ) -> HostResult<Option<IndexPlan>> {
        let _ = (constraints, order_bys);
        Ok(None)
    }

    /// Object-form BestIndex. Returning false rejects the plan.
    fn best_index_object(&mut self, info: &IndexInfo) -> HostResult<bool> {
        let _ = info;
        Ok(true)
    }

    fn open(&mut self) -> HostResult<Box<dyn VirtualCursor>>;

    /// Inverse of Create. Runs before the table's storage is dropped.
    fn destroy(&mut self) -> HostResult<()>;

    /// Inverse of Connect.
    fn disconnect(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn update_delete_row(&mut self, ctx: &UpdateContext<'_>, rowid: i64) -> HostResult<()> {
        let _ = (ctx, rowid);
        Err(HostError::read_only("table does not support DELETE"))
    }

    /// Insert a row. `rowid` is `None` when the table must choose one, and
    /// the returned rowid is only read back in that case.
    fn update_insert_row(
        &mut self,
        ctx: &UpdateContext<'_>,
        rowid: Option<i64>,
        values: &[ColumnValue],
    ) -> HostResult<i64> {
        let _ = (ctx, rowid, values);
        Err(HostError::read_only("table does not support INSERT"))
    }

    fn update_change_row(
        &mut self,
        ctx: &UpdateContext<'_>,
        old_rowid: i64,
        new_rowid: i64,
        values: &[ColumnValue],
    ) -> HostResult<()> {
        let _ = (ctx, old_rowid, new_rowid, values);
        Err(HostError::read_only("table does not support UPDATE"))
    }

    fn begin(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn commit(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn rollback(&mut self) -> HostResult<()> {
        Ok(())
    }

    fn savepoint(&mut self, level: i32) -> HostResult<()> {
        let _ = level;
        Ok(())
    }

    fn release(&mut self, level: i32) -> HostResult<()> {
        let _ = level;
        Ok(())
    }

    fn rollback_to(&mut self, level: i32) -> HostResult<()> {
        let _ = level;
        Ok(())
    }

    /// Returning an error vetoes the rename.
    fn rename(&mut self, new_name: &str) -> HostResult<()> {
        let _ = new_name;
        Ok(())
    }

    /// `Ok(Some(text))` reports a problem; the text is relayed verbatim.
    fn integrity(
        &mut self,
        schema: &str,
        table: &str,
        is_quick: bool,
    ) -> HostResult<Option<String>> {
        let _ = (schema, table, is_quick);
        Ok(None)
    }

    fn find_function(&mut self, name: &str, nargs: i32) -> HostResult<Option<FunctionOverload>> {
        let _ = (name, nargs);
        Ok(None)
    }
}

#[repr(C)]
pub(crate) struct TableAdapter {
    base: ffi::sqlite3_vtab,
    pub(crate) table: Box<dyn VirtualTable>,
    pub(crate) capabilities: TableCapabilities,
    pub(crate) options: ModuleOptions,
    pub(crate) ident: Ident,
    pub(crate) db: *mut ffi::sqlite3,
    pub(crate) overloads: OverloadRegistry,
}

impl TableAdapter {
    pub(crate) fn new(
        table: Box<dyn VirtualTable>,
        capabilities: TableCapabilities,
        options: ModuleOptions,
        ident: Ident,
        db: *mut ffi::sqlite3,
    ) -> Self {
        Self {
            base: unsafe { std::mem::zeroed() },
            table,
            capabilities,
            options,
            ident,
            db,
            overloads: OverloadRegistry::default(),
        }
    }

    /// # Safety
    /// `vtab` must have been produced by `TableAdapter::into_raw`.
    pub(crate) unsafe fn from_vtab<'a>(vtab: *mut ffi::sqlite3_vtab) -> &'a mut TableAdapter {
        unsafe { &mut *vtab.cast::<TableAdapter>() }
    }

    pub(crate) fn into_raw(self: Box<Self>) -> *mut ffi::sqlite3_vtab {
        Box::into_raw(self).cast()
    }

    /// Run one host method on the table inside an adapter call.
    pub(crate) fn call<T>(
        &mut self,
        method: &'static str,
        f: impl FnOnce(&mut dyn VirtualTable) -> HostResult<T>,
    ) -> HostResult<T> {
        let ident = &self.ident;
        let table = &mut *self.table;
        adapter_call(method, ident, || f(table))
    }

    /// Like `call`, but the host method runs even with a failure pending.
    pub(crate) fn teardown<T>(
        &mut self,
        method: &'static str,
        f: impl FnOnce(&mut dyn VirtualTable) -> HostResult<T>,
    ) -> HostResult<T> {
        let ident = &self.ident;
        let table = &mut *self.table;
        teardown_call(method, ident, || f(table))
    }
}

impl Drop for TableAdapter {
    fn drop(&mut self) {
        if !self.base.zErrMsg.is_null() {
            unsafe { ffi::sqlite3_free(self.base.zErrMsg.cast()) };
            self.base.zErrMsg = std::ptr::null_mut();
        }
    }
}

pub(crate) unsafe extern "C" fn x_best_index(
    vtab: *mut ffi::sqlite3_vtab,
    info: *mut ffi::sqlite3_index_info,
) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    match unsafe { index::negotiate(adapter, info) } {
        Ok(rc) => rc,
        Err(err) => unsafe { fail_vtab(vtab, err) },
    }
}

pub(crate) unsafe extern "C" fn x_disconnect(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    let mut adapter = unsafe { Box::from_raw(vtab.cast::<TableAdapter>()) };
    if adapter.capabilities.disconnect {
        if let Err(err) = adapter.teardown("Disconnect", |table| table.disconnect()) {
            unraisable(err);
        }
    }
    tracing::debug!(
        module = %adapter.ident.module,
        table = %adapter.ident.table,
        "disconnected virtual table"
    );
    ffi::SQLITE_OK
}

pub(crate) unsafe extern "C" fn x_destroy(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    match adapter.teardown("Destroy", |table| table.destroy()) {
        Ok(()) => {
            let adapter = unsafe { Box::from_raw(vtab.cast::<TableAdapter>()) };
            tracing::debug!(
                module = %adapter.ident.module,
                table = %adapter.ident.table,
                "destroyed virtual table"
            );
            ffi::SQLITE_OK
        }
        // The table stays alive; the engine keeps it registered.
        Err(err) => unsafe { fail_vtab(vtab, err) },
    }
}

unsafe fn optional_hook(
    vtab: *mut ffi::sqlite3_vtab,
    method: &'static str,
    enabled: fn(&TableCapabilities) -> bool,
    f: impl FnOnce(&mut dyn VirtualTable) -> HostResult<()>,
) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    if !enabled(&adapter.capabilities) {
        return ffi::SQLITE_OK;
    }
    match adapter.call(method, f) {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => unsafe { fail_vtab(vtab, err) },
    }
}

pub(crate) unsafe extern "C" fn x_begin(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { optional_hook(vtab, "Begin", |c| c.transactions, |t| t.begin()) }
}

pub(crate) unsafe extern "C" fn x_sync(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { optional_hook(vtab, "Sync", |c| c.transactions, |t| t.sync()) }
}

pub(crate) unsafe extern "C" fn x_commit(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { optional_hook(vtab, "Commit", |c| c.transactions, |t| t.commit()) }
}

pub(crate) unsafe extern "C" fn x_rollback(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    unsafe { optional_hook(vtab, "Rollback", |c| c.transactions, |t| t.rollback()) }
}

pub(crate) unsafe extern "C" fn x_savepoint(vtab: *mut ffi::sqlite3_vtab, level: c_int) -> c_int {
    unsafe { optional_hook(vtab, "Savepoint", |c| c.savepoints, |t| t.savepoint(level)) }
}

pub(crate) unsafe extern "C" fn x_release(vtab: *mut ffi::sqlite3_vtab, level: c_int) -> c_int {
    unsafe { optional_hook(vtab, "Release", |c| c.savepoints, |t| t.release(level)) }
}

pub(crate) unsafe extern "C" fn x_rollback_to(vtab: *mut ffi::sqlite3_vtab, level: c_int) -> c_int {
    unsafe { optional_hook(vtab, "RollbackTo", |c| c.savepoints, |t| t.rollback_to(level)) }
}

pub(crate) unsafe extern "C" fn x_rename(
    vtab: *mut ffi::sqlite3_vtab,
    new_name: *const c_char,
) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    let new_name = match unsafe { borrow_str(new_name) } {
        Ok(Some(name)) => name.to_string(),
        Ok(None) => return ffi::SQLITE_MISUSE,
        Err(err) => return unsafe { fail_vtab(vtab, err.with_frame(adapter.ident.site("Rename"))) },
    };
    if adapter.capabilities.rename {
        if let Err(err) = adapter.call("Rename", |table| table.rename(&new_name)) {
            return unsafe { fail_vtab(vtab, err) };
        }
    }
    tracing::debug!(
        module = %adapter.ident.module,
        from = %adapter.ident.table,
        to = %new_name,
        "renamed virtual table"
    );
    adapter.ident.table = new_name;
    ffi::SQLITE_OK
}

pub(crate) unsafe extern "C" fn x_integrity(
    vtab: *mut ffi::sqlite3_vtab,
    schema: *const c_char,
    table_name: *const c_char,
    flags: c_int,
    pz_err: *mut *mut c_char,
) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    if !adapter.capabilities.integrity {
        return ffi::SQLITE_OK;
    }
    let result = adapter.call("Integrity", |table| {
        let schema = unsafe { borrow_str(schema) }?.unwrap_or("main");
        let table_name = unsafe { borrow_str(table_name) }?.unwrap_or_default();
        table.integrity(schema, table_name, flags & 1 != 0)
    });
    match result {
        Ok(None) => ffi::SQLITE_OK,
        Ok(Some(problem)) => {
            if !pz_err.is_null() {
                unsafe { *pz_err = engine_message(&problem) };
            }
            ffi::SQLITE_OK
        }
        Err(err) => unsafe { fail_vtab(vtab, err) },
    }
}

/// Drop a table object whose schema the engine rejected.
pub(crate) fn discard(ident: &Ident, table: Box<dyn VirtualTable>) {
    if let Err(err) = adapter_call("Discard", ident, move || {
        drop(table);
        Ok(())
    }) {
        record_failure(err);
    }
}
