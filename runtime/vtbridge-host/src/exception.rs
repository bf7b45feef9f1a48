//!
//! Exception Bridge
//!
//! Converts host-side failures into SQLite result codes plus a message, and
//! SQLite result codes back into host errors. Failures carry the call sites
//! they crossed so they can be attributed after the engine has reported them.
//!
//! Three thread-local slots back the bridge (the same storage model as the
//! runtime's pending-exception cell):
//!
//! - PENDING: a failure raised by host code that no adapter call has consumed
//!   yet. Every adapter entry checks it first and fails with it.
//! - LAST_FAILURE: the most recent failure the bridge reported to the engine.
//!   An unconsumed older failure is chained behind a newer one, never lost.
//! - UNRAISABLE_HOOK: receives failures from best-effort paths whose result
//!   the engine ignores (Close, Disconnect, ShadowName, FindFunction, Eof).
//!

use std::any::Any;
use std::cell::RefCell;
use std::fmt;

use rusqlite::ffi;
use thiserror::Error;

use crate::config;

/// Longest failure chain kept in a slot before the oldest entry is dropped.
const MAX_CHAIN: usize = 8;

thread_local! {
    static PENDING: RefCell<Option<HostError>> = const { RefCell::new(None) };
    static LAST_FAILURE: RefCell<Option<HostError>> = const { RefCell::new(None) };
    static UNRAISABLE_HOOK: RefCell<Option<Box<dyn Fn(&HostError)>>> = const { RefCell::new(None) };
}

pub type HostResult<T> = Result<T, HostError>;

/// Error categories, one per SQLite primary result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Error,
    Internal,
    Permission,
    Abort,
    Busy,
    Locked,
    NoMem,
    ReadOnly,
    Interrupt,
    IoErr,
    Corrupt,
    NotFound,
    Full,
    CantOpen,
    Protocol,
    Empty,
    Schema,
    TooBig,
    Constraint,
    Mismatch,
    Misuse,
    NoLfs,
    Auth,
    Format,
    Range,
    NotADb,
    /// A scoped handle was used after the call that created it returned.
    OutOfScope,
}

impl ErrorKind {
    pub fn result_code(self) -> i32 {
        match self {
            ErrorKind::Error => ffi::SQLITE_ERROR,
            ErrorKind::Internal => ffi::SQLITE_INTERNAL,
            ErrorKind::Permission => ffi::SQLITE_PERM,
            ErrorKind::Abort => ffi::SQLITE_ABORT,
            ErrorKind::Busy => ffi::SQLITE_BUSY,
            ErrorKind::Locked => ffi::SQLITE_LOCKED,
            ErrorKind::NoMem => ffi::SQLITE_NOMEM,
            ErrorKind::ReadOnly => ffi::SQLITE_READONLY,
            ErrorKind::Interrupt => ffi::SQLITE_INTERRUPT,
            ErrorKind::IoErr => ffi::SQLITE_IOERR,
            ErrorKind::Corrupt => ffi::SQLITE_CORRUPT,
            ErrorKind::NotFound => ffi::SQLITE_NOTFOUND,
            ErrorKind::Full => ffi::SQLITE_FULL,
            ErrorKind::CantOpen => ffi::SQLITE_CANTOPEN,
            ErrorKind::Protocol => ffi::SQLITE_PROTOCOL,
            ErrorKind::Empty => ffi::SQLITE_EMPTY,
            ErrorKind::Schema => ffi::SQLITE_SCHEMA,
            ErrorKind::TooBig => ffi::SQLITE_TOOBIG,
            ErrorKind::Constraint => ffi::SQLITE_CONSTRAINT,
            ErrorKind::Mismatch => ffi::SQLITE_MISMATCH,
            ErrorKind::Misuse | ErrorKind::OutOfScope => ffi::SQLITE_MISUSE,
            ErrorKind::NoLfs => ffi::SQLITE_NOLFS,
            ErrorKind::Auth => ffi::SQLITE_AUTH,
            ErrorKind::Format => ffi::SQLITE_FORMAT,
            ErrorKind::Range => ffi::SQLITE_RANGE,
            ErrorKind::NotADb => ffi::SQLITE_NOTADB,
        }
    }

    /// Classify a (possibly extended) SQLite result code.
    pub fn from_code(code: i32) -> Self {
        match code & 0xff {
            ffi::SQLITE_INTERNAL => ErrorKind::Internal,
            ffi::SQLITE_PERM => ErrorKind::Permission,
            ffi::SQLITE_ABORT => ErrorKind::Abort,
            ffi::SQLITE_BUSY => ErrorKind::Busy,
            ffi::SQLITE_LOCKED => ErrorKind::Locked,
            ffi::SQLITE_NOMEM => ErrorKind::NoMem,
            ffi::SQLITE_READONLY => ErrorKind::ReadOnly,
            ffi::SQLITE_INTERRUPT => ErrorKind::Interrupt,
            ffi::SQLITE_IOERR => ErrorKind::IoErr,
            ffi::SQLITE_CORRUPT => ErrorKind::Corrupt,
            ffi::SQLITE_NOTFOUND => ErrorKind::NotFound,
            ffi::SQLITE_FULL => ErrorKind::Full,
            ffi::SQLITE_CANTOPEN => ErrorKind::CantOpen,
            ffi::SQLITE_PROTOCOL => ErrorKind::Protocol,
            ffi::SQLITE_EMPTY => ErrorKind::Empty,
            ffi::SQLITE_SCHEMA => ErrorKind::Schema,
            ffi::SQLITE_TOOBIG => ErrorKind::TooBig,
            ffi::SQLITE_CONSTRAINT => ErrorKind::Constraint,
            ffi::SQLITE_MISMATCH => ErrorKind::Mismatch,
            ffi::SQLITE_MISUSE => ErrorKind::Misuse,
            ffi::SQLITE_NOLFS => ErrorKind::NoLfs,
            ffi::SQLITE_AUTH => ErrorKind::Auth,
            ffi::SQLITE_FORMAT => ErrorKind::Format,
            ffi::SQLITE_RANGE => ErrorKind::Range,
            ffi::SQLITE_NOTADB => ErrorKind::NotADb,
            _ => ErrorKind::Error,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "SQLError",
            ErrorKind::Internal => "InternalError",
            ErrorKind::Permission => "PermissionsError",
            ErrorKind::Abort => "AbortError",
            ErrorKind::Busy => "BusyError",
            ErrorKind::Locked => "LockedError",
            ErrorKind::NoMem => "NoMemError",
            ErrorKind::ReadOnly => "ReadOnlyError",
            ErrorKind::Interrupt => "InterruptError",
            ErrorKind::IoErr => "IOError",
            ErrorKind::Corrupt => "CorruptError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::Full => "FullError",
            ErrorKind::CantOpen => "CantOpenError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::Empty => "EmptyError",
            ErrorKind::Schema => "SchemaChangeError",
            ErrorKind::TooBig => "TooBigError",
            ErrorKind::Constraint => "ConstraintError",
            ErrorKind::Mismatch => "MismatchError",
            ErrorKind::Misuse => "MisuseError",
            ErrorKind::NoLfs => "NoLFSError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::Format => "FormatError",
            ErrorKind::Range => "RangeError",
            ErrorKind::NotADb => "NotADBError",
            ErrorKind::OutOfScope => "OutOfScopeError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOrigin {
    /// Raised inside a host method body.
    Host,
    /// A host method answered with a value of the wrong shape or range.
    Protocol,
    /// SQLite itself reported a non-OK status.
    Engine,
    /// A fixed resource ran out (shadow-name slots, value size limits).
    Exhausted,
}

/// Adapter call-site context attached to a failure as it crosses the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    pub method: &'static str,
    pub module: Option<String>,
    pub table: Option<String>,
    pub detail: Option<String>,
}

impl CallSite {
    pub fn new(method: &'static str) -> Self {
        Self {
            method,
            module: None,
            table: None,
            detail: None,
        }
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.method)?;
        if let Some(module) = &self.module {
            write!(f, " module={}", module)?;
        }
        if let Some(table) = &self.table {
            write!(f, " table={}", table)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// A failure travelling between host code and the engine.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct HostError {
    kind: ErrorKind,
    origin: FailureOrigin,
    message: String,
    extended_code: Option<i32>,
    frames: Vec<CallSite>,
    #[source]
    previous: Option<Box<HostError>>,
}

impl HostError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: FailureOrigin::Host,
            message: message.into(),
            extended_code: None,
            frames: Vec::new(),
            previous: None,
        }
    }

    /// A generic host failure (SQLITE_ERROR).
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message)
    }

    /// The host answered with a malformed value.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Error, message).with_origin(FailureOrigin::Protocol)
    }

    /// SQLite reported `code`; the extended code is preserved.
    pub fn engine(code: i32, message: impl Into<String>) -> Self {
        let mut err =
            Self::new(ErrorKind::from_code(code), message).with_origin(FailureOrigin::Engine);
        err.extended_code = Some(code);
        err
    }

    pub fn exhausted(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message).with_origin(FailureOrigin::Exhausted)
    }

    pub fn out_of_scope(what: &str) -> Self {
        Self::new(
            ErrorKind::OutOfScope,
            format!("{} is no longer in scope", what),
        )
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, message)
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Misuse, message)
    }

    pub fn mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Mismatch, message)
    }

    pub fn range(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Range, message)
    }

    pub fn read_only(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadOnly, message)
    }

    /// Convert a caught panic payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "host code panicked".to_string()
        };
        Self::new(ErrorKind::Error, format!("panic in host code: {}", message))
    }

    pub fn with_origin(mut self, origin: FailureOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_extended_code(mut self, code: i32) -> Self {
        self.kind = ErrorKind::from_code(code);
        self.extended_code = Some(code);
        self
    }

    pub fn with_frame(mut self, site: CallSite) -> Self {
        self.push_frame(site);
        self
    }

    pub fn push_frame(&mut self, site: CallSite) {
        if config::current().diagnostics.call_context {
            self.frames.push(site);
        }
    }

    /// Attach `earlier` at the end of this failure's chain.
    ///
    /// The combined chain keeps at most `MAX_CHAIN` failures. Older ones past
    /// that are dropped with a warning.
    pub fn chain(mut self, earlier: HostError) -> Self {
        let mut older = Vec::new();
        let mut next = self.previous.take().map(|b| *b);
        while let Some(mut err) = next {
            next = err.previous.take().map(|b| *b);
            older.push(err);
        }
        let mut next = Some(earlier);
        while let Some(mut err) = next {
            next = err.previous.take().map(|b| *b);
            older.push(err);
        }
        if older.len() >= MAX_CHAIN {
            for dropped in older.drain(MAX_CHAIN - 1..) {
                tracing::warn!(
                    kind = %dropped.kind,
                    message = %dropped.message,
                    "failure chain full, discarding oldest unconsumed failure"
                );
            }
        }
        self.previous = older.into_iter().rev().fold(None, |tail, mut err| {
            err.previous = tail;
            Some(Box::new(err))
        });
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn origin(&self) -> FailureOrigin {
        self.origin
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The code handed back to the engine.
    pub fn result_code(&self) -> i32 {
        self.extended_code.unwrap_or_else(|| self.kind.result_code())
    }

    pub fn frames(&self) -> &[CallSite] {
        &self.frames
    }

    pub fn previous(&self) -> Option<&HostError> {
        self.previous.as_deref()
    }

    /// Render the failure, its call sites and every chained failure.
    pub fn report(&self) -> String {
        let mut out = String::new();
        let mut current = Some(self);
        let mut first = true;
        while let Some(err) = current {
            if !first {
                out.push_str("while handling the above, an earlier failure was pending:\n");
            }
            out.push_str(&format!("{}: {}\n", err.kind, err.message));
            for frame in &err.frames {
                out.push_str(&format!("  at {}\n", frame));
            }
            first = false;
            current = err.previous();
        }
        out
    }
}

impl From<rusqlite::Error> for HostError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::SqliteFailure(e, msg) => {
                HostError::engine(e.extended_code, msg.unwrap_or_else(|| e.to_string()))
            }
            other => HostError::error(other.to_string()),
        }
    }
}

impl From<std::str::Utf8Error> for HostError {
    fn from(err: std::str::Utf8Error) -> Self {
        HostError::mismatch(format!("invalid UTF-8: {}", err))
    }
}

impl From<std::ffi::NulError> for HostError {
    fn from(err: std::ffi::NulError) -> Self {
        HostError::error(format!("string contains an interior NUL byte: {}", err))
    }
}

/// Raise a failure from host code; the next adapter entry fails with it.
pub fn raise(err: HostError) {
    PENDING.with(|slot| {
        let mut slot = slot.borrow_mut();
        let err = match slot.take() {
            Some(earlier) => err.chain(earlier),
            None => err,
        };
        *slot = Some(err);
    });
}

/// Check if a raised failure is waiting to be consumed.
pub fn pending() -> bool {
    PENDING.with(|slot| slot.borrow().is_some())
}

pub fn take_pending() -> Option<HostError> {
    PENDING.with(|slot| slot.borrow_mut().take())
}

/// Remember a failure the bridge reported to the engine.
pub fn record_failure(err: HostError) {
    tracing::debug!(
        kind = %err.kind,
        code = err.result_code(),
        message = %err.message,
        "adapter call failed"
    );
    LAST_FAILURE.with(|slot| {
        let mut slot = slot.borrow_mut();
        let err = match slot.take() {
            Some(earlier) => err.chain(earlier),
            None => err,
        };
        *slot = Some(err);
    });
}

/// Take the most recent reported failure (with older unconsumed ones chained).
pub fn take_last_failure() -> Option<HostError> {
    LAST_FAILURE.with(|slot| slot.borrow_mut().take())
}

/// Install the unraisable hook for the current thread.
pub fn set_unraisable_hook(hook: impl Fn(&HostError) + 'static) {
    UNRAISABLE_HOOK.with(|slot| *slot.borrow_mut() = Some(Box::new(hook)));
}

pub fn clear_unraisable_hook() {
    UNRAISABLE_HOOK.with(|slot| *slot.borrow_mut() = None);
}

/// Surface a failure whose result the engine ignores.
pub fn report_unraisable(err: HostError) {
    if config::current().diagnostics.log_unraisable {
        tracing::warn!(
            kind = %err.kind,
            message = %err.message,
            frames = err.frames.len(),
            "unraisable failure in best-effort adapter call"
        );
    }
    let hook = UNRAISABLE_HOOK.with(|slot| slot.borrow_mut().take());
    if let Some(hook) = hook {
        hook(&err);
        UNRAISABLE_HOOK.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_none() {
                *slot = Some(hook);
            }
        });
    }
}
