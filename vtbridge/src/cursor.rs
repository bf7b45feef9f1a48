//!
//! Cursor Adapter
//!
//! One `CursorAdapter` per Open call. It drives the host cursor through the
//! scan protocol:
//!
//!   Opened --Filter--> Filtered --Eof--> Row | Done
//!   Row --Next--> Filtered
//!
//! Close is valid from every state and always frees the cursor, whatever the
//! host's close hook returns.
//!

use std::ffi::{c_char, c_int};
use std::slice;

use rusqlite::ffi;
use smallvec::SmallVec;
use vtbridge_host::value::{filter_arg_from_raw, set_result};
use vtbridge_host::{ColumnValue, FilterArg, HostError, HostResult, Value};

use crate::call::{
    Ident, adapter_call, borrow_str, fail_context, fail_vtab, teardown_call, unraisable,
};
use crate::table::TableAdapter;

/// A scan over a virtual table.
pub trait VirtualCursor: Send {
    /// Start a scan. `args` are ordered by the argument slots BestIndex assigned.
    fn filter(
        &mut self,
        index_number: i32,
        index_string: Option<&str>,
        args: &[FilterArg],
    ) -> HostResult<()>;

    /// A failure here ends the scan as if no rows were left.
    fn eof(&self) -> HostResult<bool>;

    /// Value of column `index`; -1 asks for the rowid.
    fn column(&self, index: i32) -> HostResult<Value>;

    /// Column fetch during an UPDATE that leaves this column unchanged.
    ///
    /// Only called for modules that declared no-change support.
    fn column_no_change(&self, index: i32) -> HostResult<ColumnValue> {
        self.column(index).map(ColumnValue::Value)
    }

    /// Advance. Running past the last row is reported by `eof`, not here.
    fn next(&mut self) -> HostResult<()>;

    fn rowid(&self) -> HostResult<i64>;

    fn close(&mut self) -> HostResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    Opened,
    Filtered,
    Row,
    Done,
}

#[repr(C)]
struct CursorAdapter {
    base: ffi::sqlite3_vtab_cursor,
    cursor: Box<dyn VirtualCursor>,
    state: CursorState,
    no_change: bool,
    ident: Ident,
}

impl CursorAdapter {
    unsafe fn from_raw<'a>(cursor: *mut ffi::sqlite3_vtab_cursor) -> &'a mut CursorAdapter {
        unsafe { &mut *cursor.cast::<CursorAdapter>() }
    }

    fn call<T>(
        &mut self,
        method: &'static str,
        f: impl FnOnce(&mut dyn VirtualCursor) -> HostResult<T>,
    ) -> HostResult<T> {
        let ident = &self.ident;
        let cursor = &mut *self.cursor;
        adapter_call(method, ident, || f(cursor))
    }

    fn close(&mut self) -> HostResult<()> {
        let ident = &self.ident;
        let cursor = &mut *self.cursor;
        teardown_call("Close", ident, || cursor.close())
    }

    fn require_filtered(&self, method: &'static str) -> HostResult<()> {
        if self.state == CursorState::Opened {
            return Err(HostError::misuse(format!("{} called before Filter", method))
                .with_frame(self.ident.site(method)));
        }
        Ok(())
    }

    fn vtab(&self) -> *mut ffi::sqlite3_vtab {
        self.base.pVtab
    }
}

pub(crate) unsafe extern "C" fn x_open(
    vtab: *mut ffi::sqlite3_vtab,
    pp_cursor: *mut *mut ffi::sqlite3_vtab_cursor,
) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    match adapter.call("Open", |table| table.open()) {
        Ok(cursor) => {
            let cursor = Box::new(CursorAdapter {
                base: unsafe { std::mem::zeroed() },
                cursor,
                state: CursorState::Opened,
                no_change: adapter.options.understands_no_change_column,
                ident: adapter.ident.clone(),
            });
            unsafe { *pp_cursor = Box::into_raw(cursor).cast() };
            ffi::SQLITE_OK
        }
        Err(err) => unsafe { fail_vtab(vtab, err) },
    }
}

pub(crate) unsafe extern "C" fn x_close(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let mut adapter = unsafe { Box::from_raw(cursor.cast::<CursorAdapter>()) };
    if let Err(err) = adapter.close() {
        unraisable(err);
    }
    ffi::SQLITE_OK
}

pub(crate) unsafe extern "C" fn x_filter(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    index_number: c_int,
    index_string: *const c_char,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) -> c_int {
    let adapter = unsafe { CursorAdapter::from_raw(cursor) };
    let result = adapter.call("Filter", |host| {
        let index_string = unsafe { borrow_str(index_string) }?;
        let mut args: SmallVec<[FilterArg; 4]> = SmallVec::new();
        if argc > 0 && !argv.is_null() {
            for value in unsafe { slice::from_raw_parts(argv, argc as usize) } {
                args.push(unsafe { filter_arg_from_raw(*value) }?);
            }
        }
        host.filter(index_number, index_string, &args)
    });
    match result {
        Ok(()) => {
            adapter.state = CursorState::Filtered;
            ffi::SQLITE_OK
        }
        Err(err) => {
            adapter.state = CursorState::Done;
            unsafe { fail_vtab(adapter.vtab(), err) }
        }
    }
}

pub(crate) unsafe extern "C" fn x_next(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let adapter = unsafe { CursorAdapter::from_raw(cursor) };
    let result = adapter
        .require_filtered("Next")
        .and_then(|()| adapter.call("Next", |cursor| cursor.next()));
    match result {
        Ok(()) => {
            adapter.state = CursorState::Filtered;
            ffi::SQLITE_OK
        }
        Err(err) => unsafe { fail_vtab(adapter.vtab(), err) },
    }
}

pub(crate) unsafe extern "C" fn x_eof(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    let adapter = unsafe { CursorAdapter::from_raw(cursor) };
    let result = adapter
        .require_filtered("Eof")
        .and_then(|()| adapter.call("Eof", |cursor| cursor.eof()));
    match result {
        Ok(false) => {
            adapter.state = CursorState::Row;
            0
        }
        Ok(true) => {
            adapter.state = CursorState::Done;
            1
        }
        // Treated as the end of the scan.
        Err(err) => {
            adapter.state = CursorState::Done;
            unraisable(err);
            1
        }
    }
}

pub(crate) unsafe extern "C" fn x_column(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    ctx: *mut ffi::sqlite3_context,
    index: c_int,
) -> c_int {
    let adapter = unsafe { CursorAdapter::from_raw(cursor) };
    let no_change = adapter.no_change && unsafe { ffi::sqlite3_vtab_nochange(ctx) } != 0;
    let result = adapter.require_filtered("Column").and_then(|()| {
        if no_change {
            adapter.call("ColumnNoChange", |cursor| match cursor.column_no_change(index)? {
                // Leaving the result unset tells the engine the value is unchanged.
                ColumnValue::Unchanged => Ok(()),
                ColumnValue::Value(value) => unsafe { set_result(ctx, &value) },
            })
        } else {
            adapter.call("Column", |cursor| {
                let value = cursor.column(index)?;
                unsafe { set_result(ctx, &value) }
            })
        }
    });
    match result {
        Ok(()) => ffi::SQLITE_OK,
        Err(err) => unsafe { fail_context(ctx, err) },
    }
}

pub(crate) unsafe extern "C" fn x_rowid(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    p_rowid: *mut ffi::sqlite3_int64,
) -> c_int {
    let adapter = unsafe { CursorAdapter::from_raw(cursor) };
    let result = adapter
        .require_filtered("Rowid")
        .and_then(|()| adapter.call("Rowid", |cursor| cursor.rowid()));
    match result {
        Ok(rowid) => {
            unsafe { *p_rowid = rowid };
            ffi::SQLITE_OK
        }
        Err(err) => unsafe { fail_vtab(adapter.vtab(), err) },
    }
}
