//!
//! Function Overloads
//!
//! A table may replace a scalar function for calls whose first argument is
//! one of its columns (xFindFunction). The overload can also claim an
//! operator code in the function-constraint range, which turns
//! `func(column, expr)` in a WHERE clause into a constraint BestIndex sees.
//!
//! Overloads handed to the engine are retained by the table for its whole
//! lifetime, since prepared statements keep the pointer the bridge returned.
//!

use std::ffi::{c_char, c_int, c_void};
use std::slice;
use std::sync::Arc;

use rusqlite::ffi;
use vtbridge_host::value::{set_result, value_from_raw};
use vtbridge_host::{HostError, HostResult, Value};

use crate::call::{Ident, adapter_call, borrow_str, fail_context, unraisable};
use crate::index::{FUNCTION_CONSTRAINT_MAX, FUNCTION_CONSTRAINT_MIN};
use crate::table::TableAdapter;

/// A scalar function implementation.
pub trait ScalarFunction: Send + Sync {
    fn call(&self, args: &[Value]) -> HostResult<Value>;
}

impl<F> ScalarFunction for F
where
    F: Fn(&[Value]) -> HostResult<Value> + Send + Sync,
{
    fn call(&self, args: &[Value]) -> HostResult<Value> {
        self(args)
    }
}

/// FindFunction answer.
#[derive(Clone)]
pub struct FunctionOverload {
    pub function: Arc<dyn ScalarFunction>,
    /// Operator code offered to BestIndex, in 150..=255.
    pub constraint_op: Option<i32>,
}

impl FunctionOverload {
    pub fn new(function: impl ScalarFunction + 'static) -> Self {
        Self {
            function: Arc::new(function),
            constraint_op: None,
        }
    }

    pub fn from_arc(function: Arc<dyn ScalarFunction>) -> Self {
        Self {
            function,
            constraint_op: None,
        }
    }

    pub fn with_constraint_op(mut self, op: i32) -> Self {
        self.constraint_op = Some(op);
        self
    }

    fn result_code(&self) -> HostResult<c_int> {
        match self.constraint_op {
            None => Ok(1),
            Some(op) if (FUNCTION_CONSTRAINT_MIN..=FUNCTION_CONSTRAINT_MAX).contains(&op) => Ok(op),
            Some(op) => Err(HostError::protocol(format!(
                "constraint operator {} is outside {}..={}",
                op, FUNCTION_CONSTRAINT_MIN, FUNCTION_CONSTRAINT_MAX
            ))),
        }
    }
}

impl std::fmt::Debug for FunctionOverload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionOverload")
            .field("constraint_op", &self.constraint_op)
            .finish_non_exhaustive()
    }
}

struct OverloadEntry {
    name: String,
    nargs: i32,
    function: Arc<dyn ScalarFunction>,
    ident: Ident,
}

/// Overloads installed on one table, in the order they were handed out.
#[derive(Default)]
pub(crate) struct OverloadRegistry {
    entries: Vec<Box<OverloadEntry>>,
}

impl OverloadRegistry {
    /// Retain `function` and return the user-data pointer for the engine.
    fn install(
        &mut self,
        name: &str,
        nargs: i32,
        function: Arc<dyn ScalarFunction>,
        ident: &Ident,
    ) -> *mut c_void {
        let index = match self
            .entries
            .iter()
            .position(|e| e.name == name && e.nargs == nargs && Arc::ptr_eq(&e.function, &function))
        {
            Some(index) => index,
            None => {
                self.entries.push(Box::new(OverloadEntry {
                    name: name.to_string(),
                    nargs,
                    function,
                    ident: ident.clone(),
                }));
                self.entries.len() - 1
            }
        };
        let entry: &OverloadEntry = &self.entries[index];
        (entry as *const OverloadEntry).cast_mut().cast()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

pub(crate) type FunctionPtr =
    Option<unsafe extern "C" fn(*mut ffi::sqlite3_context, c_int, *mut *mut ffi::sqlite3_value)>;

pub(crate) unsafe extern "C" fn x_find_function(
    vtab: *mut ffi::sqlite3_vtab,
    nargs: c_int,
    name: *const c_char,
    px_func: *mut FunctionPtr,
    pp_arg: *mut *mut c_void,
) -> c_int {
    let adapter = unsafe { TableAdapter::from_vtab(vtab) };
    if !adapter.capabilities.find_function {
        return 0;
    }
    let name = match unsafe { borrow_str(name) } {
        Ok(Some(name)) => name,
        Ok(None) => return 0,
        Err(err) => {
            unraisable(err.with_frame(adapter.ident.site("FindFunction")));
            return 0;
        }
    };

    let overload = match adapter.call("FindFunction", |table| table.find_function(name, nargs)) {
        Ok(Some(overload)) => overload,
        Ok(None) => return 0,
        Err(err) => {
            unraisable(err);
            return 0;
        }
    };
    let code = match overload.result_code() {
        Ok(code) => code,
        Err(err) => {
            unraisable(err.with_frame(adapter.ident.site("FindFunction").detail(name)));
            return 0;
        }
    };

    let ident = adapter.ident.clone();
    let arg = adapter.overloads.install(name, nargs, overload.function, &ident);
    tracing::trace!(
        table = %ident.table,
        function = name,
        nargs,
        code,
        installed = adapter.overloads.len(),
        "function overload installed"
    );
    unsafe {
        *px_func = Some(call_overload);
        *pp_arg = arg;
    }
    code
}

unsafe extern "C" fn call_overload(
    ctx: *mut ffi::sqlite3_context,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
) {
    let entry = unsafe { &*ffi::sqlite3_user_data(ctx).cast::<OverloadEntry>() };
    let result = adapter_call("FunctionOverload", &entry.ident, || {
        let mut args = Vec::with_capacity(argc.max(0) as usize);
        if argc > 0 && !argv.is_null() {
            for value in unsafe { slice::from_raw_parts(argv, argc as usize) } {
                args.push(unsafe { value_from_raw(*value) }?);
            }
        }
        let value = entry.function.call(&args)?;
        unsafe { set_result(ctx, &value) }
    });
    if let Err(err) = result {
        unsafe { fail_context(ctx, err) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtbridge_host::ErrorKind;

    fn ident() -> Ident {
        Ident::new(Arc::from("docs"), "notes")
    }

    #[test]
    fn test_closures_are_functions() {
        let f = |args: &[Value]| -> HostResult<Value> { Ok(Value::Integer(args.len() as i64)) };
        let result = ScalarFunction::call(&f, &[Value::Null, Value::Null]).unwrap();
        assert_eq!(result, Value::Integer(2));
    }

    #[test]
    fn test_constraint_op_range() {
        let f = |_: &[Value]| -> HostResult<Value> { Ok(Value::Null) };
        assert_eq!(FunctionOverload::new(f).result_code().unwrap(), 1);
        assert_eq!(FunctionOverload::new(f).with_constraint_op(150).result_code().unwrap(), 150);
        assert_eq!(FunctionOverload::new(f).with_constraint_op(255).result_code().unwrap(), 255);
        let err = FunctionOverload::new(f).with_constraint_op(149).result_code().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Error);
        assert!(FunctionOverload::new(f).with_constraint_op(256).result_code().is_err());
    }

    #[test]
    fn test_registry_reuses_identical_entries() {
        let mut registry = OverloadRegistry::default();
        let f: Arc<dyn ScalarFunction> =
            Arc::new(|_: &[Value]| -> HostResult<Value> { Ok(Value::Null) });
        let g: Arc<dyn ScalarFunction> =
            Arc::new(|_: &[Value]| -> HostResult<Value> { Ok(Value::Integer(1)) });

        let a = registry.install("upper", 1, f.clone(), &ident());
        let b = registry.install("upper", 1, f.clone(), &ident());
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);

        let c = registry.install("upper", 1, g, &ident());
        assert_ne!(a, c);
        let d = registry.install("upper", 2, f, &ident());
        assert_ne!(a, d);
        assert_eq!(registry.len(), 3);
    }
}
