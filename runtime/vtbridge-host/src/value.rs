//!
//! Value Marshaling
//!
//! Host values and their conversion to and from SQLite's typed values.
//!
//! - `Value` covers the five storage classes: NULL, INTEGER, FLOAT, TEXT, BLOB
//! - `ColumnValue` adds the "unchanged" sentinel used by no-change aware
//!   tables during UPDATE
//! - `FilterArg` adds IN-list groups delivered to a cursor's filter
//!
//! Text and blob results are checked against the effective length limit
//! (the smaller of the connection's SQLITE_LIMIT_LENGTH and the configured
//! `max_value_bytes`) before they reach the engine.
//!

use std::ffi::{c_char, c_uchar, c_void};
use std::ptr;
use std::slice;

use rusqlite::ffi;

use crate::config;
use crate::exception::{ErrorKind, HostError, HostResult};

/// A host value in one of SQLite's storage classes.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Blob(_) => "blob",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b),
            _ => None,
        }
    }

    /// Coerce to a 64-bit rowid.
    ///
    /// Integral floats inside the i64 range are accepted; anything else is a
    /// mismatch, and integral floats outside the range are a range failure.
    pub fn to_rowid(&self) -> HostResult<i64> {
        match self {
            Value::Integer(i) => Ok(*i),
            Value::Float(f) if f.fract() == 0.0 => {
                if *f >= i64::MIN as f64 && *f < i64::MAX as f64 {
                    Ok(*f as i64)
                } else {
                    Err(HostError::range(format!("rowid {} does not fit in 64 bits", f)))
                }
            }
            other => Err(HostError::mismatch(format!(
                "rowid must be an integer, not {}",
                other.type_name()
            ))),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

impl TryFrom<u64> for Value {
    type Error = HostError;

    fn try_from(v: u64) -> HostResult<Self> {
        i64::try_from(v)
            .map(Value::Integer)
            .map_err(|_| HostError::range(format!("{} does not fit in a 64-bit signed integer", v)))
    }
}

impl TryFrom<i128> for Value {
    type Error = HostError;

    fn try_from(v: i128) -> HostResult<Self> {
        i64::try_from(v)
            .map(Value::Integer)
            .map_err(|_| HostError::range(format!("{} does not fit in a 64-bit signed integer", v)))
    }
}

/// A column value that may be the "unchanged" sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Value(Value),
    Unchanged,
}

impl ColumnValue {
    pub fn is_unchanged(&self) -> bool {
        matches!(self, ColumnValue::Unchanged)
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            ColumnValue::Value(v) => Some(v),
            ColumnValue::Unchanged => None,
        }
    }
}

impl From<Value> for ColumnValue {
    fn from(v: Value) -> Self {
        ColumnValue::Value(v)
    }
}

/// One positional argument handed to a cursor's filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterArg {
    Value(Value),
    /// Right-hand side of an IN constraint the table asked to receive whole.
    Set(Vec<Value>),
}

impl FilterArg {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FilterArg::Value(v) => Some(v),
            FilterArg::Set(_) => None,
        }
    }

    pub fn as_set(&self) -> Option<&[Value]> {
        match self {
            FilterArg::Set(values) => Some(values),
            FilterArg::Value(_) => None,
        }
    }
}

/// Read an engine value.
///
/// # Safety
/// `value` must be a valid `sqlite3_value` for the duration of the call.
pub unsafe fn value_from_raw(value: *mut ffi::sqlite3_value) -> HostResult<Value> {
    unsafe {
        match ffi::sqlite3_value_type(value) {
            ffi::SQLITE_INTEGER => Ok(Value::Integer(ffi::sqlite3_value_int64(value))),
            ffi::SQLITE_FLOAT => Ok(Value::Float(ffi::sqlite3_value_double(value))),
            ffi::SQLITE_TEXT => {
                let text = ffi::sqlite3_value_text(value);
                let len = ffi::sqlite3_value_bytes(value) as usize;
                if text.is_null() {
                    if len == 0 {
                        return Ok(Value::Text(String::new()));
                    }
                    return Err(HostError::exhausted(
                        ErrorKind::NoMem,
                        "out of memory reading text value",
                    ));
                }
                let bytes = slice::from_raw_parts(text, len);
                let s = std::str::from_utf8(bytes)?;
                Ok(Value::Text(s.to_string()))
            }
            ffi::SQLITE_BLOB => {
                let blob = ffi::sqlite3_value_blob(value);
                let len = ffi::sqlite3_value_bytes(value) as usize;
                if blob.is_null() || len == 0 {
                    return Ok(Value::Blob(Vec::new()));
                }
                Ok(Value::Blob(slice::from_raw_parts(blob.cast::<u8>(), len).to_vec()))
            }
            _ => Ok(Value::Null),
        }
    }
}

/// Read an UPDATE argument, surfacing the unchanged sentinel when allowed.
///
/// # Safety
/// `value` must be a valid `sqlite3_value` for the duration of the call.
pub unsafe fn column_value_from_raw(
    value: *mut ffi::sqlite3_value,
    no_change_aware: bool,
) -> HostResult<ColumnValue> {
    unsafe {
        if no_change_aware && ffi::sqlite3_value_nochange(value) != 0 {
            return Ok(ColumnValue::Unchanged);
        }
        value_from_raw(value).map(ColumnValue::Value)
    }
}

/// Read a filter argument, expanding IN-list groups into sets.
///
/// # Safety
/// `value` must be a valid `sqlite3_value` handed to xFilter.
pub unsafe fn filter_arg_from_raw(value: *mut ffi::sqlite3_value) -> HostResult<FilterArg> {
    unsafe {
        if ffi::sqlite3_value_type(value) != ffi::SQLITE_NULL {
            return value_from_raw(value).map(FilterArg::Value);
        }
        let mut item: *mut ffi::sqlite3_value = ptr::null_mut();
        let mut rc = ffi::sqlite3_vtab_in_first(value, &mut item);
        if rc != ffi::SQLITE_OK && rc != ffi::SQLITE_DONE {
            // Not an IN-list group, just a NULL argument.
            return Ok(FilterArg::Value(Value::Null));
        }
        let mut values = Vec::new();
        while rc == ffi::SQLITE_OK {
            values.push(value_from_raw(item)?);
            rc = ffi::sqlite3_vtab_in_next(value, &mut item);
        }
        if rc != ffi::SQLITE_DONE {
            return Err(HostError::engine(rc, "failed reading IN-list values"));
        }
        Ok(FilterArg::Set(values))
    }
}

/// Effective maximum text/blob length for values handed to `db`.
///
/// # Safety
/// `db` must be null or a valid open connection.
pub unsafe fn value_limit(db: *mut ffi::sqlite3) -> u64 {
    let engine = if db.is_null() {
        i32::MAX as u64
    } else {
        unsafe { ffi::sqlite3_limit(db, ffi::SQLITE_LIMIT_LENGTH, -1).max(0) as u64 }
    };
    match config::current().limits.max_value_bytes {
        Some(max) => engine.min(max),
        None => engine,
    }
}

/// Hand a host value to the engine as a function or column result.
///
/// Oversized text/blob values set SQLITE_TOOBIG on the context and fail.
///
/// # Safety
/// `ctx` must be a valid `sqlite3_context` for the current callback.
pub unsafe fn set_result(ctx: *mut ffi::sqlite3_context, value: &Value) -> HostResult<()> {
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_result_null(ctx),
            Value::Integer(i) => ffi::sqlite3_result_int64(ctx, *i),
            Value::Float(f) => ffi::sqlite3_result_double(ctx, *f),
            Value::Text(s) => {
                check_length(ctx, "text", s.len())?;
                ffi::sqlite3_result_text64(
                    ctx,
                    s.as_ptr().cast::<c_char>(),
                    s.len() as u64,
                    ffi::SQLITE_TRANSIENT(),
                    ffi::SQLITE_UTF8 as c_uchar,
                );
            }
            Value::Blob(b) => {
                check_length(ctx, "blob", b.len())?;
                ffi::sqlite3_result_blob64(
                    ctx,
                    b.as_ptr().cast::<c_void>(),
                    b.len() as u64,
                    ffi::SQLITE_TRANSIENT(),
                );
            }
        }
    }
    Ok(())
}

unsafe fn check_length(ctx: *mut ffi::sqlite3_context, what: &str, len: usize) -> HostResult<()> {
    let limit = unsafe { value_limit(ffi::sqlite3_context_db_handle(ctx)) };
    if len as u64 > limit {
        unsafe { ffi::sqlite3_result_error_toobig(ctx) };
        return Err(HostError::exhausted(
            ErrorKind::TooBig,
            format!("{} value of {} bytes exceeds the {} byte limit", what, len, limit),
        ));
    }
    Ok(())
}
