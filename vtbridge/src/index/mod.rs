//!
//! Index Negotiation
//!
//! The BestIndex exchange between the query planner and a table. Two forms
//! are supported, picked per module at registration:
//!
//! - Tuple form: the table sees only the usable constraints plus the
//!   ORDER BY terms and answers with an `IndexPlan`
//! - Object form: the table receives an `IndexInfo` handle and mutates the
//!   planner's structure in place, answering true to accept the plan
//!
//! In both forms argument slots are zero-based ordering keys. After the table
//! answers, the bridge checks them (range, uniqueness, usability) and compacts
//! them into the dense 1-based positions the engine expects, so Filter always
//! receives gap-free arguments in slot order.
//!

mod info;
mod plan;

pub use info::{DistinctMode, IndexInfo};
pub use plan::{ConstraintUsage, IndexPlan};

pub(crate) use plan::negotiate;

use rusqlite::ffi;

/// `IndexInfo::set_scan_flags` bit: the scan visits at most one row.
pub const SCAN_UNIQUE: i32 = ffi::SQLITE_INDEX_SCAN_UNIQUE;

/// Lowest operator code a FindFunction overload may claim.
pub const FUNCTION_CONSTRAINT_MIN: i32 = ffi::SQLITE_INDEX_CONSTRAINT_FUNCTION;
/// Highest operator code a FindFunction overload may claim.
pub const FUNCTION_CONSTRAINT_MAX: i32 = 255;

/// Operator of a WHERE-clause constraint offered to BestIndex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
    Like,
    Glob,
    Regexp,
    Ne,
    IsNot,
    IsNotNull,
    IsNull,
    Is,
    Limit,
    Offset,
    /// A function overload returned by FindFunction with this operator code.
    Function(u8),
    Other(u8),
}

impl ConstraintOp {
    pub fn from_code(code: u8) -> Self {
        match code as i32 {
            ffi::SQLITE_INDEX_CONSTRAINT_EQ => ConstraintOp::Eq,
            ffi::SQLITE_INDEX_CONSTRAINT_GT => ConstraintOp::Gt,
            ffi::SQLITE_INDEX_CONSTRAINT_LE => ConstraintOp::Le,
            ffi::SQLITE_INDEX_CONSTRAINT_LT => ConstraintOp::Lt,
            ffi::SQLITE_INDEX_CONSTRAINT_GE => ConstraintOp::Ge,
            ffi::SQLITE_INDEX_CONSTRAINT_MATCH => ConstraintOp::Match,
            ffi::SQLITE_INDEX_CONSTRAINT_LIKE => ConstraintOp::Like,
            ffi::SQLITE_INDEX_CONSTRAINT_GLOB => ConstraintOp::Glob,
            ffi::SQLITE_INDEX_CONSTRAINT_REGEXP => ConstraintOp::Regexp,
            ffi::SQLITE_INDEX_CONSTRAINT_NE => ConstraintOp::Ne,
            ffi::SQLITE_INDEX_CONSTRAINT_ISNOT => ConstraintOp::IsNot,
            ffi::SQLITE_INDEX_CONSTRAINT_ISNOTNULL => ConstraintOp::IsNotNull,
            ffi::SQLITE_INDEX_CONSTRAINT_ISNULL => ConstraintOp::IsNull,
            ffi::SQLITE_INDEX_CONSTRAINT_IS => ConstraintOp::Is,
            ffi::SQLITE_INDEX_CONSTRAINT_LIMIT => ConstraintOp::Limit,
            ffi::SQLITE_INDEX_CONSTRAINT_OFFSET => ConstraintOp::Offset,
            c if c >= FUNCTION_CONSTRAINT_MIN => ConstraintOp::Function(code),
            _ => ConstraintOp::Other(code),
        }
    }

    pub fn code(self) -> u8 {
        let code = match self {
            ConstraintOp::Eq => ffi::SQLITE_INDEX_CONSTRAINT_EQ,
            ConstraintOp::Gt => ffi::SQLITE_INDEX_CONSTRAINT_GT,
            ConstraintOp::Le => ffi::SQLITE_INDEX_CONSTRAINT_LE,
            ConstraintOp::Lt => ffi::SQLITE_INDEX_CONSTRAINT_LT,
            ConstraintOp::Ge => ffi::SQLITE_INDEX_CONSTRAINT_GE,
            ConstraintOp::Match => ffi::SQLITE_INDEX_CONSTRAINT_MATCH,
            ConstraintOp::Like => ffi::SQLITE_INDEX_CONSTRAINT_LIKE,
            ConstraintOp::Glob => ffi::SQLITE_INDEX_CONSTRAINT_GLOB,
            ConstraintOp::Regexp => ffi::SQLITE_INDEX_CONSTRAINT_REGEXP,
            ConstraintOp::Ne => ffi::SQLITE_INDEX_CONSTRAINT_NE,
            ConstraintOp::IsNot => ffi::SQLITE_INDEX_CONSTRAINT_ISNOT,
            ConstraintOp::IsNotNull => ffi::SQLITE_INDEX_CONSTRAINT_ISNOTNULL,
            ConstraintOp::IsNull => ffi::SQLITE_INDEX_CONSTRAINT_ISNULL,
            ConstraintOp::Is => ffi::SQLITE_INDEX_CONSTRAINT_IS,
            ConstraintOp::Limit => ffi::SQLITE_INDEX_CONSTRAINT_LIMIT,
            ConstraintOp::Offset => ffi::SQLITE_INDEX_CONSTRAINT_OFFSET,
            ConstraintOp::Function(code) | ConstraintOp::Other(code) => return code,
        };
        code as u8
    }
}

/// One WHERE-clause term on a table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraint {
    /// Column index; -1 is the rowid.
    pub column: i32,
    pub op: ConstraintOp,
    pub usable: bool,
}

/// One ORDER BY term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: i32,
    pub desc: bool,
}

/// # Safety
/// `info` must be the index info of the running xBestIndex call.
pub(crate) unsafe fn read_constraints(info: *const ffi::sqlite3_index_info) -> Vec<Constraint> {
    unsafe {
        let info = &*info;
        if info.nConstraint <= 0 || info.aConstraint.is_null() {
            return Vec::new();
        }
        std::slice::from_raw_parts(info.aConstraint, info.nConstraint as usize)
            .iter()
            .map(|c| Constraint {
                column: c.iColumn,
                op: ConstraintOp::from_code(c.op),
                usable: c.usable != 0,
            })
            .collect()
    }
}

/// # Safety
/// `info` must be the index info of the running xBestIndex call.
pub(crate) unsafe fn read_order_bys(info: *const ffi::sqlite3_index_info) -> Vec<OrderBy> {
    unsafe {
        let info = &*info;
        if info.nOrderBy <= 0 || info.aOrderBy.is_null() {
            return Vec::new();
        }
        std::slice::from_raw_parts(info.aOrderBy, info.nOrderBy as usize)
            .iter()
            .map(|o| OrderBy {
                column: o.iColumn,
                desc: o.desc != 0,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_codes() {
        assert_eq!(ConstraintOp::from_code(2), ConstraintOp::Eq);
        assert_eq!(ConstraintOp::from_code(4), ConstraintOp::Gt);
        assert_eq!(ConstraintOp::from_code(8), ConstraintOp::Le);
        assert_eq!(ConstraintOp::from_code(16), ConstraintOp::Lt);
        assert_eq!(ConstraintOp::from_code(32), ConstraintOp::Ge);
        assert_eq!(ConstraintOp::from_code(72), ConstraintOp::Is);
        assert_eq!(ConstraintOp::from_code(150), ConstraintOp::Function(150));
        assert_eq!(ConstraintOp::from_code(255), ConstraintOp::Function(255));
        assert_eq!(ConstraintOp::from_code(99), ConstraintOp::Other(99));
        for code in [2u8, 4, 8, 16, 32, 64, 65, 66, 67, 68, 69, 70, 71, 72, 73, 74, 151] {
            assert_eq!(ConstraintOp::from_code(code).code(), code);
        }
    }
}
