//! Scoped handle over the planner's `sqlite3_index_info`.

use std::ffi::{CStr, c_int};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::thread::{self, ThreadId};

use rusqlite::ffi;
use vtbridge_host::value::value_from_raw;
use vtbridge_host::{HostError, HostResult, Value};

use super::{Constraint, ConstraintOp, OrderBy};
use crate::call::engine_string;

/// DISTINCT/GROUP BY handling the planner requests from a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistinctMode {
    /// Rows must be produced in full and in the requested order.
    Ordered,
    /// Rows only need to be grouped by the ORDER BY columns.
    Grouped,
    /// Duplicate rows may be omitted.
    Distinct,
    /// Duplicates may be omitted and order within groups is free.
    DistinctUnordered,
}

struct Scope {
    info: AtomicPtr<ffi::sqlite3_index_info>,
    thread: ThreadId,
}

/// The planner's index-info structure, valid only while BestIndex runs.
///
/// The handle may be cloned and kept, but every accessor fails with an
/// out-of-scope error once the BestIndex call that produced it has returned.
#[derive(Clone)]
pub struct IndexInfo {
    scope: Arc<Scope>,
}

impl std::fmt::Debug for IndexInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexInfo")
            .field("in_scope", &!self.scope.info.load(Ordering::Acquire).is_null())
            .finish()
    }
}

impl IndexInfo {
    pub(crate) fn new(info: *mut ffi::sqlite3_index_info) -> Self {
        Self {
            scope: Arc::new(Scope {
                info: AtomicPtr::new(info),
                thread: thread::current().id(),
            }),
        }
    }

    /// End the validity window.
    pub(crate) fn invalidate(&self) {
        self.scope.info.store(ptr::null_mut(), Ordering::Release);
    }

    fn raw(&self) -> HostResult<*mut ffi::sqlite3_index_info> {
        let info = self.scope.info.load(Ordering::Acquire);
        if info.is_null() {
            return Err(HostError::out_of_scope("IndexInfo"));
        }
        if thread::current().id() != self.scope.thread {
            return Err(HostError::misuse("IndexInfo used from another thread"));
        }
        Ok(info)
    }

    fn with<T>(&self, f: impl FnOnce(&ffi::sqlite3_index_info) -> T) -> HostResult<T> {
        let info = self.raw()?;
        Ok(f(unsafe { &*info }))
    }

    fn with_mut<T>(&self, f: impl FnOnce(&mut ffi::sqlite3_index_info) -> T) -> HostResult<T> {
        let info = self.raw()?;
        Ok(f(unsafe { &mut *info }))
    }

    fn check_constraint(&self, i: usize) -> HostResult<*mut ffi::sqlite3_index_info> {
        let info = self.raw()?;
        let count = unsafe { (*info).nConstraint.max(0) as usize };
        if i >= count {
            return Err(HostError::range(format!(
                "constraint {} out of range (0..{})",
                i, count
            )));
        }
        Ok(info)
    }

    pub fn is_in_scope(&self) -> bool {
        self.raw().is_ok()
    }

    pub fn constraint_count(&self) -> HostResult<usize> {
        self.with(|info| info.nConstraint.max(0) as usize)
    }

    pub fn constraints(&self) -> HostResult<Vec<Constraint>> {
        let info = self.raw()?;
        Ok(unsafe { super::read_constraints(info) })
    }

    pub fn constraint(&self, i: usize) -> HostResult<Constraint> {
        let info = self.check_constraint(i)?;
        let c = unsafe { &*(*info).aConstraint.add(i) };
        Ok(Constraint {
            column: c.iColumn,
            op: ConstraintOp::from_code(c.op),
            usable: c.usable != 0,
        })
    }

    pub fn order_bys(&self) -> HostResult<Vec<OrderBy>> {
        let info = self.raw()?;
        Ok(unsafe { super::read_order_bys(info) })
    }

    /// Collation sequence of constraint `i`, when the planner reports one.
    pub fn collation(&self, i: usize) -> HostResult<Option<String>> {
        let info = self.check_constraint(i)?;
        unsafe {
            let name = ffi::sqlite3_vtab_collation(info, i as c_int);
            if name.is_null() {
                return Ok(None);
            }
            Ok(Some(CStr::from_ptr(name).to_str()?.to_string()))
        }
    }

    /// Right-hand value of constraint `i` if it is known while planning.
    ///
    /// Absent for parameterized or computed right-hand sides.
    pub fn rhs_value(&self, i: usize) -> HostResult<Option<Value>> {
        let info = self.check_constraint(i)?;
        unsafe {
            let mut value: *mut ffi::sqlite3_value = ptr::null_mut();
            match ffi::sqlite3_vtab_rhs_value(info, i as c_int, &mut value) {
                ffi::SQLITE_OK if !value.is_null() => Ok(Some(value_from_raw(value)?)),
                ffi::SQLITE_OK | ffi::SQLITE_NOTFOUND => Ok(None),
                rc => Err(HostError::engine(rc, "failed reading constraint value")),
            }
        }
    }

    /// Whether constraint `i` is an IN operator that can be handled whole.
    pub fn is_in_constraint(&self, i: usize) -> HostResult<bool> {
        let info = self.check_constraint(i)?;
        Ok(unsafe { ffi::sqlite3_vtab_in(info, i as c_int, -1) } != 0)
    }

    /// Ask for the IN list of constraint `i` to reach Filter as one set.
    ///
    /// Returns false when the planner cannot deliver it that way.
    pub fn set_in_constraint(&self, i: usize, filter_all: bool) -> HostResult<bool> {
        let info = self.check_constraint(i)?;
        Ok(unsafe { ffi::sqlite3_vtab_in(info, i as c_int, filter_all as c_int) } != 0)
    }

    /// Zero-based Filter argument slot assigned to constraint `i`.
    pub fn argv_index(&self, i: usize) -> HostResult<Option<usize>> {
        let info = self.check_constraint(i)?;
        let argv = unsafe { (*(*info).aConstraintUsage.add(i)).argvIndex };
        Ok((argv > 0).then(|| argv as usize - 1))
    }

    pub fn set_argv_index(&self, i: usize, slot: Option<usize>) -> HostResult<()> {
        let info = self.check_constraint(i)?;
        let argv = match slot {
            None => 0,
            Some(slot) => c_int::try_from(slot)
                .ok()
                .and_then(|s| s.checked_add(1))
                .ok_or_else(|| HostError::range(format!("argument slot {} is too large", slot)))?,
        };
        unsafe { (*(*info).aConstraintUsage.add(i)).argvIndex = argv };
        Ok(())
    }

    pub fn omit(&self, i: usize) -> HostResult<bool> {
        let info = self.check_constraint(i)?;
        Ok(unsafe { (*(*info).aConstraintUsage.add(i)).omit } != 0)
    }

    pub fn set_omit(&self, i: usize, omit: bool) -> HostResult<()> {
        let info = self.check_constraint(i)?;
        unsafe { (*(*info).aConstraintUsage.add(i)).omit = omit as _ };
        Ok(())
    }

    pub fn index_number(&self) -> HostResult<i32> {
        self.with(|info| info.idxNum)
    }

    pub fn set_index_number(&self, n: i32) -> HostResult<()> {
        self.with_mut(|info| info.idxNum = n)
    }

    pub fn index_string(&self) -> HostResult<Option<String>> {
        let info = self.raw()?;
        unsafe { Ok(crate::call::borrow_str((*info).idxStr)?.map(str::to_string)) }
    }

    /// Set the index string handed to Filter.
    ///
    /// The string is copied into engine memory and freed by the engine.
    pub fn set_index_string(&self, s: Option<&str>) -> HostResult<()> {
        let info = self.raw()?;
        let new = match s {
            Some(s) => engine_string(s)?,
            None => ptr::null_mut(),
        };
        unsafe {
            free_index_string(info);
            (*info).idxStr = new;
            (*info).needToFreeIdxStr = (!new.is_null()) as c_int;
        }
        Ok(())
    }

    pub fn order_by_consumed(&self) -> HostResult<bool> {
        self.with(|info| info.orderByConsumed != 0)
    }

    pub fn set_order_by_consumed(&self, consumed: bool) -> HostResult<()> {
        self.with_mut(|info| info.orderByConsumed = consumed as c_int)
    }

    pub fn estimated_cost(&self) -> HostResult<f64> {
        self.with(|info| info.estimatedCost)
    }

    pub fn set_estimated_cost(&self, cost: f64) -> HostResult<()> {
        self.with_mut(|info| info.estimatedCost = cost)
    }

    pub fn estimated_rows(&self) -> HostResult<i64> {
        self.with(|info| info.estimatedRows)
    }

    pub fn set_estimated_rows(&self, rows: i64) -> HostResult<()> {
        self.with_mut(|info| info.estimatedRows = rows)
    }

    pub fn scan_flags(&self) -> HostResult<i32> {
        self.with(|info| info.idxFlags)
    }

    pub fn set_scan_flags(&self, flags: i32) -> HostResult<()> {
        self.with_mut(|info| info.idxFlags = flags)
    }

    /// Bitmask of columns the statement reads; bit 63 covers columns 63 and up.
    pub fn columns_used(&self) -> HostResult<u64> {
        self.with(|info| info.colUsed)
    }

    pub fn distinct(&self) -> HostResult<DistinctMode> {
        let info = self.raw()?;
        Ok(match unsafe { ffi::sqlite3_vtab_distinct(info) } {
            1 => DistinctMode::Grouped,
            2 => DistinctMode::Distinct,
            3 => DistinctMode::DistinctUnordered,
            _ => DistinctMode::Ordered,
        })
    }
}

/// Release an index string the bridge allocated earlier in the same call.
///
/// # Safety
/// `info` must be the index info of the running xBestIndex call.
pub(crate) unsafe fn free_index_string(info: *mut ffi::sqlite3_index_info) {
    unsafe {
        if (*info).needToFreeIdxStr != 0 && !(*info).idxStr.is_null() {
            ffi::sqlite3_free((*info).idxStr.cast());
        }
        (*info).idxStr = ptr::null_mut();
        (*info).needToFreeIdxStr = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtbridge_host::ErrorKind;

    #[test]
    fn test_access_after_invalidate_is_out_of_scope() {
        let mut constraints = [ffi::sqlite3_index_constraint {
            iColumn: 1,
            op: ffi::SQLITE_INDEX_CONSTRAINT_EQ as u8,
            usable: 1,
            iTermOffset: 0,
        }];
        let mut usage = [ffi::sqlite3_index_constraint_usage { argvIndex: 0, omit: 0 }];
        let mut raw: ffi::sqlite3_index_info = unsafe { std::mem::zeroed() };
        raw.nConstraint = 1;
        raw.aConstraint = constraints.as_mut_ptr();
        raw.aConstraintUsage = usage.as_mut_ptr();

        let info = IndexInfo::new(&mut raw);
        let kept = info.clone();
        info.set_argv_index(0, Some(0)).unwrap();
        info.set_index_number(9).unwrap();
        assert_eq!(kept.argv_index(0).unwrap(), Some(0));
        assert_eq!(kept.constraint(0).unwrap().op, ConstraintOp::Eq);
        assert_eq!(info.constraint(1).unwrap_err().kind(), ErrorKind::Range);

        info.invalidate();
        assert!(!kept.is_in_scope());
        let err = kept.index_number().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfScope);
        assert_eq!(err.message(), "IndexInfo is no longer in scope");
        assert_eq!(kept.set_omit(0, true).unwrap_err().kind(), ErrorKind::OutOfScope);

        assert_eq!(raw.idxNum, 9);
        assert_eq!(usage[0].argvIndex, 1);
        assert_eq!(usage[0].omit, 0);
    }

    #[test]
    fn test_index_string_is_engine_owned() {
        let mut raw: ffi::sqlite3_index_info = unsafe { std::mem::zeroed() };
        let info = IndexInfo::new(&mut raw);
        info.set_index_string(Some("first")).unwrap();
        info.set_index_string(Some("second")).unwrap();
        assert_eq!(info.index_string().unwrap().as_deref(), Some("second"));
        assert_eq!(raw.needToFreeIdxStr, 1);
        unsafe { free_index_string(&mut raw) };
        assert!(raw.idxStr.is_null());
    }
}
