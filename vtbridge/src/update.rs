//!
//! Update Dispatch
//!
//! xUpdate carries DELETE, INSERT and UPDATE through one entry point; the
//! shape is decided by the argument count and which rowids are NULL:
//!
//! - one argument: DELETE of that rowid
//! - argv[0] NULL: INSERT, argv[1] is the requested rowid or NULL
//! - otherwise: UPDATE from rowid argv[0] to rowid argv[1]
//!
//! Column values start at argv[2]. For modules that understand no-change
//! columns, values the engine flags as unchanged arrive as
//! `ColumnValue::Unchanged`.
//!

use std::ffi::c_int;
use std::marker::PhantomData;
use std::slice;

use rusqlite::ffi;
use vtbridge_host::value::{column_value_from_raw, value_from_raw};
use vtbridge_host::{ColumnValue, HostError, HostResult};

use crate::call::fail_vtab;
use crate::table::TableAdapter;

/// ON CONFLICT mode of the statement running an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    Rollback,
    Ignore,
    Fail,
    Abort,
    Replace,
}

impl ConflictMode {
    fn from_code(code: c_int) -> Self {
        match code {
            ffi::SQLITE_ROLLBACK => ConflictMode::Rollback,
            ffi::SQLITE_IGNORE => ConflictMode::Ignore,
            ffi::SQLITE_FAIL => ConflictMode::Fail,
            ffi::SQLITE_REPLACE => ConflictMode::Replace,
            _ => ConflictMode::Abort,
        }
    }
}

/// Engine state available to a table while one update runs.
pub struct UpdateContext<'a> {
    db: *mut ffi::sqlite3,
    _call: PhantomData<&'a ()>,
}

impl UpdateContext<'_> {
    fn new(db: *mut ffi::sqlite3) -> Self {
        Self {
            db,
            _call: PhantomData,
        }
    }

    pub fn on_conflict(&self) -> ConflictMode {
        if self.db.is_null() {
            return ConflictMode::Abort;
        }
        ConflictMode::from_code(unsafe { ffi::sqlite3_vtab_on_conflict(self.db) })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum UpdateOp {
    Delete {
        rowid: i64,
    },
    Insert {
        rowid: Option<i64>,
        values: Vec<ColumnValue>,
    },
    Change {
        old_rowid: i64,
        new_rowid: i64,
        values: Vec<ColumnValue>,
    },
}

/// # Safety
/// Every pointer in `args` must be a valid `sqlite3_value` for this call.
unsafe fn decode(args: &[*mut ffi::sqlite3_value], no_change: bool) -> HostResult<UpdateOp> {
    let Some((&first, rest)) = args.split_first() else {
        return Err(HostError::misuse("update called without arguments"));
    };
    let old = unsafe { value_from_raw(first) }?;
    let Some((&second, columns)) = rest.split_first() else {
        return Ok(UpdateOp::Delete {
            rowid: old.to_rowid()?,
        });
    };
    let new = unsafe { value_from_raw(second) }?;
    let values = columns
        .iter()
        .map(|&v| unsafe { column_value_from_raw(v, no_change) })
        .collect::<HostResult<Vec<_>>>()?;

    if old.is_null() {
        let rowid = if new.is_null() { None } else { Some(new.to_rowid()?) };
        Ok(UpdateOp::Insert { rowid, values })
    } else {
        Ok(UpdateOp::Change {
            old_rowid: old.to_rowid()?,
            new_rowid: new.to_rowid()?,
            values,
        })
    }
}

pub(crate) unsafe extern "C" fn x_update(
    vtab: *mut ffi::sqlite3_vtab,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
    p_rowid: *mut ffi::sqlite3_int64,
) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    if !adapter.capabilities.update {
        let err = HostError::read_only(format!("table {} is read-only", adapter.ident.table))
            .with_frame(adapter.ident.site("Update"));
        return unsafe { fail_vtab(vtab, err) };
    }

    let args: &[*mut ffi::sqlite3_value] = if argc > 0 && !argv.is_null() {
        unsafe { slice::from_raw_parts(argv, argc as usize) }
    } else {
        &[]
    };
    let no_change = adapter.options.understands_no_change_column;
    let ctx = UpdateContext::new(adapter.db);

    let result = adapter.call("Update", |table| match unsafe { decode(args, no_change) }? {
        UpdateOp::Delete { rowid } => table.update_delete_row(&ctx, rowid).map(|()| None),
        UpdateOp::Insert { rowid: Some(rowid), values } => {
            table.update_insert_row(&ctx, Some(rowid), &values)?;
            Ok(Some(rowid))
        }
        UpdateOp::Insert { rowid: None, values } => {
            table.update_insert_row(&ctx, None, &values).map(Some)
        }
        UpdateOp::Change {
            old_rowid,
            new_rowid,
            values,
        } => table
            .update_change_row(&ctx, old_rowid, new_rowid, &values)
            .map(|()| None),
    });

    match result {
        Ok(Some(rowid)) => {
            if !p_rowid.is_null() {
                unsafe { *p_rowid = rowid };
            }
            ffi::SQLITE_OK
        }
        Ok(None) => ffi::SQLITE_OK,
        Err(err) => unsafe { fail_vtab(vtab, err) },
    }
}
