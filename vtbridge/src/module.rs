//!
//! Module Adapter
//!
//! Registration wires a `TableFactory` into the engine's `sqlite3_module`
//! callback table. The callback table, the factory and the module's
//! shadow-name slot live in one boxed `ModuleAux` handed to
//! `sqlite3_create_module_v2`; the engine frees it through the module
//! destructor when the module is replaced, dropped, or the connection closes.
//!
//! Which slots are filled depends on the module options:
//!
//! - Rename and the savepoint family are left empty for read-only modules
//! - xShadowName is set only for ABI version 3 and later
//! - eponymous modules share Connect/Disconnect for Create/Destroy, and
//!   eponymous-only modules have no Create/Destroy at all
//!

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::sync::Arc;

use rusqlite::{Connection, ffi};
use thiserror::Error;
use vtbridge_host::{ConfigError, FailureOrigin, HostError, HostResult, ModuleOptions, config};

use crate::call::{Ident, adapter_call, fail_out};
use crate::cursor::{x_close, x_column, x_eof, x_filter, x_next, x_open, x_rowid};
use crate::overload::x_find_function;
use crate::shadow::{ModuleId, ShadowNameFn, ShadowNamePool, ShadowSlot};
use crate::table::{
    TableAdapter, VirtualTable, discard, x_begin, x_best_index, x_commit, x_destroy, x_disconnect,
    x_integrity, x_release, x_rename, x_rollback, x_rollback_to, x_savepoint, x_sync,
};
use crate::update::x_update;

/// Builds table objects for one module.
pub trait TableFactory: Send + Sync + 'static {
    /// Called by CREATE VIRTUAL TABLE. Returns the `CREATE TABLE` text that
    /// fixes the table's columns, and the table object.
    fn create(&self, args: &CreateArgs<'_>) -> HostResult<(String, Box<dyn VirtualTable>)>;

    /// Called for every later reference to an existing table.
    fn connect(&self, args: &CreateArgs<'_>) -> HostResult<(String, Box<dyn VirtualTable>)> {
        self.create(args)
    }

    /// Whether `<table>_<suffix>` is one of this module's shadow tables.
    fn shadow_name(&self, suffix: &str) -> HostResult<bool> {
        let _ = suffix;
        Ok(false)
    }
}

/// Options for `CreateArgs::configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VTabConfig {
    ConstraintSupport(bool),
    Innocuous,
    DirectOnly,
    UsesAllSchemas,
}

impl VTabConfig {
    fn code(self) -> c_int {
        match self {
            VTabConfig::ConstraintSupport(_) => 1,
            VTabConfig::Innocuous => 2,
            VTabConfig::DirectOnly => 3,
            VTabConfig::UsesAllSchemas => 4,
        }
    }
}

/// Arguments of one Create or Connect call.
pub struct CreateArgs<'a> {
    db: *mut ffi::sqlite3,
    pub module: &'a str,
    pub database: &'a str,
    pub table: &'a str,
    /// Arguments from the `USING module(...)` clause, verbatim.
    pub args: &'a [String],
}

impl CreateArgs<'_> {
    /// Only valid while Create/Connect is running.
    pub fn configure(&self, config: VTabConfig) -> HostResult<()> {
        let rc = unsafe {
            match config {
                VTabConfig::ConstraintSupport(on) => {
                    ffi::sqlite3_vtab_config(self.db, config.code(), on as c_int)
                }
                _ => ffi::sqlite3_vtab_config(self.db, config.code()),
            }
        };
        if rc != ffi::SQLITE_OK {
            return Err(HostError::engine(rc, format!("vtab config {:?} rejected", config)));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("invalid module options: {0}")]
    Config(#[from] ConfigError),

    #[error("module '{0}' has no entry in the bridge configuration")]
    NotConfigured(String),

    #[error(transparent)]
    Host(#[from] HostError),
}

impl RegisterError {
    /// The failure as the bridge records it.
    pub fn into_host_error(self) -> HostError {
        match self {
            RegisterError::Host(err) => err,
            other => HostError::misuse(other.to_string()),
        }
    }
}

struct ModuleAux {
    module: ffi::sqlite3_module,
    name: Arc<str>,
    factory: Arc<dyn TableFactory>,
    options: ModuleOptions,
    _shadow: Option<ShadowSlot>,
}

#[repr(C)]
union ModuleZeroHack {
    bytes: [u8; size_of::<ffi::sqlite3_module>()],
    module: ffi::sqlite3_module,
}

const ZERO_MODULE: ffi::sqlite3_module = unsafe {
    ModuleZeroHack {
        bytes: [0_u8; size_of::<ffi::sqlite3_module>()],
    }
    .module
};

fn build_module(options: &ModuleOptions, shadow: Option<ShadowNameFn>) -> ffi::sqlite3_module {
    let mut module = ffi::sqlite3_module {
        iVersion: options.abi_version,
        xCreate: Some(x_create),
        xConnect: Some(x_connect),
        xBestIndex: Some(x_best_index),
        xDisconnect: Some(x_disconnect),
        xDestroy: Some(x_destroy),
        xOpen: Some(x_open),
        xClose: Some(x_close),
        xFilter: Some(x_filter),
        xNext: Some(x_next),
        xEof: Some(x_eof),
        xColumn: Some(x_column),
        xRowid: Some(x_rowid),
        xUpdate: Some(x_update),
        xBegin: Some(x_begin),
        xSync: Some(x_sync),
        xCommit: Some(x_commit),
        xRollback: Some(x_rollback),
        xFindFunction: Some(x_find_function),
        xIntegrity: Some(x_integrity),
        ..ZERO_MODULE
    };
    if !options.read_only {
        module.xRename = Some(x_rename);
    }
    // The engine calls xSavepoint from xBegin without checking iVersion.
    if !options.read_only && options.abi_version >= 2 {
        module.xSavepoint = Some(x_savepoint);
        module.xRelease = Some(x_release);
        module.xRollbackTo = Some(x_rollback_to);
    }
    if options.abi_version >= 3 {
        module.xShadowName = shadow;
    }
    if options.eponymous {
        module.xCreate = module.xConnect;
        module.xDestroy = module.xDisconnect;
    } else if options.eponymous_only {
        module.xCreate = None;
        module.xDestroy = None;
    }
    module
}

unsafe extern "C" fn free_aux(aux: *mut c_void) {
    let aux = unsafe { Box::from_raw(aux.cast::<ModuleAux>()) };
    tracing::debug!(module = %aux.name, "module released");
}

/// Register `factory` as module `name` on `conn`.
///
/// For ABI version 3 and later a shadow-name slot is taken from the
/// process-wide pool first; if none is free nothing is registered.
pub fn register_module(
    conn: &Connection,
    name: &str,
    factory: impl TableFactory,
    options: ModuleOptions,
) -> Result<(), RegisterError> {
    register_module_arc(conn, name, Arc::new(factory), options)
}

/// Register `factory` with the options installed for `name` in the bridge
/// configuration.
pub fn register_module_configured(
    conn: &Connection,
    name: &str,
    factory: impl TableFactory,
) -> Result<(), RegisterError> {
    let config = config::current();
    let options = config
        .module(name)
        .cloned()
        .ok_or_else(|| RegisterError::NotConfigured(name.to_string()))?;
    register_module(conn, name, factory, options)
}

pub fn register_module_arc(
    conn: &Connection,
    name: &str,
    factory: Arc<dyn TableFactory>,
    options: ModuleOptions,
) -> Result<(), RegisterError> {
    options.validate()?;
    let c_name = CString::new(name).map_err(HostError::from)?;
    let name: Arc<str> = Arc::from(name);

    let shadow = if options.abi_version >= 3 {
        Some(ShadowNamePool::allocate(ModuleId::next(), name.clone(), factory.clone())?)
    } else {
        None
    };
    let module = build_module(&options, shadow.as_ref().map(ShadowSlot::trampoline));
    let slot = shadow.as_ref().map(ShadowSlot::index);
    let aux = Box::new(ModuleAux {
        module,
        name: name.clone(),
        factory,
        options,
        _shadow: shadow,
    });
    let module_ptr: *const ffi::sqlite3_module = &aux.module;
    let aux_ptr = Box::into_raw(aux);

    // On failure the engine has already run `free_aux`.
    let rc = unsafe {
        ffi::sqlite3_create_module_v2(
            conn.handle(),
            c_name.as_ptr(),
            module_ptr,
            aux_ptr.cast(),
            Some(free_aux),
        )
    };
    if rc != ffi::SQLITE_OK {
        let message = unsafe { engine_error(conn.handle()) };
        let message = format!("registering module {}: {}", name, message);
        return Err(HostError::engine(rc, message).into());
    }
    tracing::debug!(module = %name, shadow_slot = ?slot, "module registered");
    Ok(())
}

/// Drop every module on `conn` whose name is not in `keep`.
pub fn drop_modules(conn: &Connection, keep: &[&str]) -> HostResult<()> {
    let names = keep
        .iter()
        .map(|name| CString::new(*name))
        .collect::<Result<Vec<_>, _>>()?;
    let mut list: Vec<*const c_char> = names.iter().map(|n| n.as_ptr()).collect();
    list.push(std::ptr::null());
    let rc = unsafe { ffi::sqlite3_drop_modules(conn.handle(), list.as_mut_ptr()) };
    if rc != ffi::SQLITE_OK {
        return Err(HostError::engine(rc, "dropping modules failed"));
    }
    tracing::debug!(kept = keep.len(), "modules dropped");
    Ok(())
}

unsafe fn engine_error(db: *mut ffi::sqlite3) -> String {
    let msg = unsafe { ffi::sqlite3_errmsg(db) };
    if msg.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}

unsafe fn read_argv(argc: c_int, argv: *const *const c_char) -> HostResult<Vec<String>> {
    let mut out = Vec::with_capacity(argc.max(0) as usize);
    for i in 0..argc.max(0) as usize {
        let arg = unsafe { *argv.add(i) };
        if arg.is_null() {
            out.push(String::new());
        } else {
            out.push(unsafe { CStr::from_ptr(arg) }.to_str()?.to_string());
        }
    }
    if out.len() < 3 {
        return Err(HostError::misuse(format!(
            "constructor received {} arguments, expected at least 3",
            out.len()
        )));
    }
    Ok(out)
}

unsafe extern "C" fn x_create(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    unsafe { construct("Create", db, aux, argc, argv, pp_vtab, pz_err) }
}

unsafe extern "C" fn x_connect(
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    unsafe { construct("Connect", db, aux, argc, argv, pp_vtab, pz_err) }
}

unsafe fn construct(
    method: &'static str,
    db: *mut ffi::sqlite3,
    aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    let aux = unsafe { &*aux.cast::<ModuleAux>() };
    let argv = match unsafe { read_argv(argc, argv) } {
        Ok(argv) => argv,
        Err(err) => {
            let site = Ident::new(aux.name.clone(), String::new()).site(method);
            return unsafe { fail_out(pz_err, err.with_frame(site)) };
        }
    };
    let ident = Ident::new(aux.name.clone(), argv[2].as_str());
    let args = CreateArgs {
        db,
        module: &argv[0],
        database: &argv[1],
        table: &argv[2],
        args: &argv[3..],
    };

    let result = adapter_call(method, &ident, || {
        let (schema, table) = if method == "Connect" {
            aux.factory.connect(&args)
        } else {
            aux.factory.create(&args)
        }?;
        let capabilities = table.capabilities();
        Ok((schema, table, capabilities))
    });
    let (schema, table, capabilities) = match result {
        Ok(built) => built,
        Err(err) => return unsafe { fail_out(pz_err, err) },
    };

    let declared = match CString::new(schema.as_str()) {
        Ok(sql) => {
            let rc = unsafe { ffi::sqlite3_declare_vtab(db, sql.as_ptr()) };
            if rc == ffi::SQLITE_OK {
                Ok(())
            } else {
                let message = unsafe { engine_error(db) };
                Err(HostError::engine(rc, format!("declaring schema failed: {}", message)))
            }
        }
        Err(e) => Err(HostError::from(e).with_origin(FailureOrigin::Protocol)),
    };
    if let Err(err) = declared {
        discard(&ident, table);
        let err = err.with_frame(ident.site(method).detail(schema));
        return unsafe { fail_out(pz_err, err) };
    }

    tracing::debug!(
        module = %ident.module,
        database = %args.database,
        table = %ident.table,
        method,
        "virtual table constructed"
    );
    let adapter = Box::new(TableAdapter::new(table, capabilities, aux.options.clone(), ident, db));
    unsafe { *pp_vtab = adapter.into_raw() };
    ffi::SQLITE_OK
}
