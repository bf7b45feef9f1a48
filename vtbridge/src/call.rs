//!
//! Adapter Call Scope
//!
//! Every engine -> host callback runs through `adapter_call`, which:
//!
//! - takes the host lock for the duration of the call
//! - fails fast with any failure host code raised earlier and left pending,
//!   except on teardown (`teardown_call`), where the host method still runs
//! - catches panics so they never unwind into the engine
//! - attaches the module/table/method call site to any failure
//!
//! The remaining helpers hand failures back to the engine in the shape each
//! callback expects: a zErrMsg on the vtab, a `*pzErr` out-parameter, an
//! error result on a function context, or an unraisable diagnostic.
//!

use std::ffi::{CStr, c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::Arc;

use rusqlite::ffi;
use vtbridge_host::{
    CallSite, HostError, HostGuard, HostResult, record_failure, report_unraisable, take_pending,
};

/// Names identifying the table a call is made on.
#[derive(Debug, Clone)]
pub(crate) struct Ident {
    pub module: Arc<str>,
    pub table: String,
}

impl Ident {
    pub fn new(module: Arc<str>, table: impl Into<String>) -> Self {
        Self {
            module,
            table: table.into(),
        }
    }

    pub fn site(&self, method: &'static str) -> CallSite {
        let site = CallSite::new(method).module(&*self.module);
        if self.table.is_empty() {
            site
        } else {
            site.table(&self.table)
        }
    }
}

pub(crate) fn adapter_call<T>(
    method: &'static str,
    ident: &Ident,
    f: impl FnOnce() -> HostResult<T>,
) -> HostResult<T> {
    let _guard = HostGuard::enter();
    trace_call(method, ident);

    let result = match take_pending() {
        Some(earlier) => Err(earlier),
        None => run_host(f),
    };
    result.map_err(|err| err.with_frame(ident.site(method)))
}

/// Like `adapter_call`, for Close, Disconnect and Destroy.
///
/// The host method always runs so its resources are released. A failure left
/// pending beforehand is chained behind the method's own failure, or reported
/// as unraisable when the method succeeds.
pub(crate) fn teardown_call<T>(
    method: &'static str,
    ident: &Ident,
    f: impl FnOnce() -> HostResult<T>,
) -> HostResult<T> {
    let _guard = HostGuard::enter();
    trace_call(method, ident);

    let earlier = take_pending();
    let result = run_host(f).map_err(|err| err.with_frame(ident.site(method)));
    match (result, earlier) {
        (result, None) => result,
        (Ok(value), Some(earlier)) => {
            report_unraisable(earlier.with_frame(ident.site(method)));
            Ok(value)
        }
        (Err(err), Some(earlier)) => Err(err.chain(earlier)),
    }
}

fn trace_call(method: &'static str, ident: &Ident) {
    tracing::trace!(
        method,
        module = %ident.module,
        table = %ident.table,
        depth = HostGuard::depth(),
        "adapter call"
    );
}

fn run_host<T>(f: impl FnOnce() -> HostResult<T>) -> HostResult<T> {
    let result = panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(HostError::from_panic(payload)));

    // Host code may raise without returning an error.
    match (result, take_pending()) {
        (result, None) => result,
        (Ok(_), Some(raised)) => Err(raised),
        (Err(err), Some(raised)) => Err(err.chain(raised)),
    }
}

/// Copy `s` into memory allocated with `sqlite3_malloc`.
pub(crate) fn engine_string(s: &str) -> HostResult<*mut c_char> {
    if s.as_bytes().contains(&0) {
        return Err(HostError::protocol(format!(
            "string {:?} contains an interior NUL byte",
            s
        )));
    }
    unsafe {
        let buf = ffi::sqlite3_malloc64(s.len() as u64 + 1).cast::<c_char>();
        if buf.is_null() {
            return Err(HostError::exhausted(
                vtbridge_host::ErrorKind::NoMem,
                "out of memory copying string",
            ));
        }
        ptr::copy_nonoverlapping(s.as_ptr().cast::<c_char>(), buf, s.len());
        *buf.add(s.len()) = 0;
        Ok(buf)
    }
}

/// Engine-owned copy of an error message. Interior NULs are replaced.
pub(crate) fn engine_message(message: &str) -> *mut c_char {
    let cleaned;
    let message = if message.contains('\0') {
        cleaned = message.replace('\0', "\u{fffd}");
        &cleaned
    } else {
        message
    };
    engine_string(message).unwrap_or(ptr::null_mut())
}

/// Borrow a NUL-terminated engine string.
///
/// # Safety
/// `s` must be null or a valid NUL-terminated string outliving `'a`.
pub(crate) unsafe fn borrow_str<'a>(s: *const c_char) -> HostResult<Option<&'a str>> {
    if s.is_null() {
        return Ok(None);
    }
    Ok(Some(unsafe { CStr::from_ptr(s) }.to_str()?))
}

/// Report a failure through the vtab's zErrMsg and return its code.
///
/// # Safety
/// `vtab` must be a live `sqlite3_vtab`.
pub(crate) unsafe fn fail_vtab(vtab: *mut ffi::sqlite3_vtab, err: HostError) -> c_int {
    let code = err.result_code();
    unsafe {
        if !(*vtab).zErrMsg.is_null() {
            ffi::sqlite3_free((*vtab).zErrMsg.cast());
        }
        (*vtab).zErrMsg = engine_message(err.message());
    }
    record_failure(err);
    code
}

/// Report a failure through a `*pzErr` out-parameter and return its code.
///
/// # Safety
/// `pz_err` must be null or point to writable storage for a string pointer.
pub(crate) unsafe fn fail_out(pz_err: *mut *mut c_char, err: HostError) -> c_int {
    let code = err.result_code();
    if !pz_err.is_null() {
        unsafe { *pz_err = engine_message(err.message()) };
    }
    record_failure(err);
    code
}

/// Report a failure as the result of a function or column context.
///
/// # Safety
/// `ctx` must be the context of the running callback.
pub(crate) unsafe fn fail_context(ctx: *mut ffi::sqlite3_context, err: HostError) -> c_int {
    let code = err.result_code();
    let message = err.message().as_bytes();
    unsafe {
        ffi::sqlite3_result_error(ctx, message.as_ptr().cast::<c_char>(), message.len() as c_int);
        ffi::sqlite3_result_error_code(ctx, code);
    }
    record_failure(err);
    code
}

/// Surface a failure on a path whose result the engine ignores.
pub(crate) fn unraisable(err: HostError) {
    report_unraisable(err);
}
