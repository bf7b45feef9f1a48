//! BestIndex answers and their validation.

use std::ffi::c_int;

use rusqlite::ffi;
use smallvec::SmallVec;
use vtbridge_host::{HostError, HostResult, record_failure};

use super::info::{IndexInfo, free_index_string};
use super::{read_constraints, read_order_bys};
use crate::call::engine_string;
use crate::table::TableAdapter;

/// A table's decision for one usable constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConstraintUsage {
    #[default]
    Unused,
    /// Deliver the right-hand value to Filter at this zero-based slot.
    Argument(usize),
    /// As `Argument`; when the flag is set the engine skips re-checking.
    ArgumentOmit(usize, bool),
}

impl ConstraintUsage {
    fn assignment(self) -> Option<(usize, bool)> {
        match self {
            ConstraintUsage::Unused => None,
            ConstraintUsage::Argument(slot) => Some((slot, false)),
            ConstraintUsage::ArgumentOmit(slot, omit) => Some((slot, omit)),
        }
    }
}

impl From<Option<usize>> for ConstraintUsage {
    fn from(slot: Option<usize>) -> Self {
        slot.map_or(ConstraintUsage::Unused, ConstraintUsage::Argument)
    }
}

/// Tuple-form BestIndex answer.
///
/// Every field left at its default keeps the documented default: no
/// constraint usage, index number 0, no index string, ORDER BY not
/// satisfied, and the engine's own (very large) cost estimate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexPlan {
    /// One entry per usable constraint, in the order they were offered.
    pub usage: Option<Vec<ConstraintUsage>>,
    pub index_number: i32,
    pub index_string: Option<String>,
    pub order_by_satisfied: bool,
    pub estimated_cost: Option<f64>,
}

impl IndexPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn usage(mut self, usage: impl IntoIterator<Item = impl Into<ConstraintUsage>>) -> Self {
        self.usage = Some(usage.into_iter().map(Into::into).collect());
        self
    }

    pub fn index_number(mut self, n: i32) -> Self {
        self.index_number = n;
        self
    }

    pub fn index_string(mut self, s: impl Into<String>) -> Self {
        self.index_string = Some(s.into());
        self
    }

    pub fn order_by_satisfied(mut self, satisfied: bool) -> Self {
        self.order_by_satisfied = satisfied;
        self
    }

    pub fn estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = Some(cost);
        self
    }
}

/// Check zero-based slots and compact them to dense 1-based positions.
///
/// `assigned` holds one optional `(slot, omit)` per constraint; slots must be
/// below `bound` and distinct.
pub(crate) fn compact_slots(
    assigned: &[Option<(usize, bool)>],
    bound: usize,
) -> HostResult<Vec<Option<(c_int, bool)>>> {
    let mut slots: SmallVec<[usize; 8]> = SmallVec::new();
    for (i, entry) in assigned.iter().enumerate() {
        if let Some((slot, _)) = entry {
            if *slot >= bound {
                return Err(HostError::protocol(format!(
                    "constraint {} has argument slot {} but only {} slots are available",
                    i, slot, bound
                )));
            }
            if slots.contains(slot) {
                return Err(HostError::protocol(format!(
                    "argument slot {} is assigned to more than one constraint",
                    slot
                )));
            }
            slots.push(*slot);
        }
    }
    slots.sort_unstable();

    Ok(assigned
        .iter()
        .map(|entry| {
            entry.map(|(slot, omit)| {
                let position = slots.iter().position(|s| *s == slot).unwrap_or(0);
                (position as c_int + 1, omit)
            })
        })
        .collect())
}

/// Run BestIndex for `adapter` against the planner's `info`.
///
/// Returns the code for the engine; malformed answers and host failures come
/// back as errors.
///
/// # Safety
/// `info` must be the index info of the running xBestIndex call.
pub(crate) unsafe fn negotiate(
    adapter: &mut TableAdapter,
    info: *mut ffi::sqlite3_index_info,
) -> HostResult<c_int> {
    if adapter.options.bestindex_is_object {
        unsafe { negotiate_object(adapter, info) }
    } else {
        unsafe { negotiate_tuple(adapter, info) }
    }
}

unsafe fn negotiate_tuple(
    adapter: &mut TableAdapter,
    info: *mut ffi::sqlite3_index_info,
) -> HostResult<c_int> {
    let all = unsafe { read_constraints(info) };
    let usable: SmallVec<[usize; 8]> = (0..all.len()).filter(|&i| all[i].usable).collect();
    let constraints: Vec<_> = usable.iter().map(|&i| all[i]).collect();
    let order_bys = unsafe { read_order_bys(info) };

    let plan = adapter.call("BestIndex", |table| table.best_index(&constraints, &order_bys))?;
    let Some(plan) = plan else {
        return Ok(ffi::SQLITE_OK);
    };

    let site = || adapter.ident.site("BestIndex");
    let positions = match &plan.usage {
        None => vec![None; usable.len()],
        Some(usage) => {
            if usage.len() != usable.len() {
                return Err(HostError::protocol(format!(
                    "constraint usage has {} entries but {} constraints are usable",
                    usage.len(),
                    usable.len()
                ))
                .with_frame(site()));
            }
            let assigned: Vec<_> = usage.iter().map(|u| u.assignment()).collect();
            compact_slots(&assigned, usable.len()).map_err(|e| e.with_frame(site()))?
        }
    };
    let index_string = match &plan.index_string {
        Some(s) => engine_string(s).map_err(|e| e.with_frame(site()))?,
        None => std::ptr::null_mut(),
    };

    unsafe {
        for (k, &i) in usable.iter().enumerate() {
            if let Some((argv, omit)) = positions[k] {
                let usage = &mut *(*info).aConstraintUsage.add(i);
                usage.argvIndex = argv;
                usage.omit = omit as _;
            }
        }
        free_index_string(info);
        (*info).idxNum = plan.index_number;
        (*info).idxStr = index_string;
        (*info).needToFreeIdxStr = (!index_string.is_null()) as c_int;
        (*info).orderByConsumed = plan.order_by_satisfied as c_int;
        if let Some(cost) = plan.estimated_cost {
            (*info).estimatedCost = cost;
        }
    }
    tracing::trace!(
        table = %adapter.ident.table,
        index_number = plan.index_number,
        arguments = positions.iter().flatten().count(),
        "tuple plan accepted"
    );
    Ok(ffi::SQLITE_OK)
}

unsafe fn negotiate_object(
    adapter: &mut TableAdapter,
    info: *mut ffi::sqlite3_index_info,
) -> HostResult<c_int> {
    let handle = IndexInfo::new(info);
    let answer = adapter.call("BestIndex", |table| table.best_index_object(&handle));
    handle.invalidate();

    match answer {
        Ok(true) => {}
        Ok(false) => {
            unsafe { free_index_string(info) };
            return Ok(ffi::SQLITE_CONSTRAINT);
        }
        Err(err) => {
            unsafe { free_index_string(info) };
            record_failure(err);
            return Ok(ffi::SQLITE_CONSTRAINT);
        }
    }

    let normalized = unsafe { normalize_object_usage(info) };
    if let Err(err) = normalized {
        unsafe { free_index_string(info) };
        return Err(err.with_frame(adapter.ident.site("BestIndex")));
    }
    Ok(ffi::SQLITE_OK)
}

/// Compact the argv indexes an object-form table wrote in place.
unsafe fn normalize_object_usage(info: *mut ffi::sqlite3_index_info) -> HostResult<()> {
    let constraints = unsafe { read_constraints(info) };
    let mut assigned = Vec::with_capacity(constraints.len());
    for (i, constraint) in constraints.iter().enumerate() {
        let usage = unsafe { &*(*info).aConstraintUsage.add(i) };
        if usage.argvIndex < 0 {
            return Err(HostError::protocol(format!(
                "constraint {} has negative argument index {}",
                i, usage.argvIndex
            )));
        }
        if usage.argvIndex == 0 {
            assigned.push(None);
            continue;
        }
        if !constraint.usable {
            return Err(HostError::protocol(format!(
                "constraint {} is not usable but was given an argument slot",
                i
            )));
        }
        assigned.push(Some((usage.argvIndex as usize - 1, usage.omit != 0)));
    }

    let positions = compact_slots(&assigned, constraints.len())?;
    for (i, position) in positions.iter().enumerate() {
        if let Some((argv, _)) = position {
            unsafe { (*(*info).aConstraintUsage.add(i)).argvIndex = *argv };
        }
    }
    Ok(())
}
