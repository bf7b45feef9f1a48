//!
//! # Shared fixtures for the bridge integration tests
//!
//! `MemFactory` builds `MemTable`s: (a, b) tables over an in-memory row
//! store. Every hook the bridge calls is recorded in an `Events` log so tests
//! can check which callbacks ran and in what order.
//!
//! Behaviour switches come from the `USING mem(...)` arguments:
//! - `fail`: Create/Connect fails
//! - `badschema`: the declared schema does not parse
//! - `sticky`: Destroy fails
//! - `reject`: object-form BestIndex rejects every plan
//! - `failplan`: object-form BestIndex fails
//! - `badslot`: object-form BestIndex assigns an out-of-range argument slot
//!
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use rusqlite::types::Value as SqlValue;
use vtbridge::{
    ColumnValue, ConstraintOp, ConstraintUsage, CreateArgs, FilterArg, FunctionOverload, HostError,
    HostResult, IndexInfo, IndexPlan, SCAN_UNIQUE, ScalarFunction, TableCapabilities, TableFactory,
    UpdateContext, Value, VirtualCursor, VirtualTable,
};

#[derive(Clone, Default)]
pub struct Events(Arc<Mutex<Vec<String>>>);

impl Events {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    /// Number of events whose first word is `name`.
    pub fn count(&self, name: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.split_whitespace().next() == Some(name))
            .count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

pub type Rows = Arc<Mutex<BTreeMap<i64, Vec<Value>>>>;

/// Slot where object-form BestIndex leaves the handle it was given.
pub type InfoSlot = Arc<Mutex<Option<IndexInfo>>>;

pub struct MemFactory {
    pub events: Events,
    pub rows: Rows,
    pub capabilities: TableCapabilities,
    pub info_slot: InfoSlot,
}

impl MemFactory {
    pub fn new(events: &Events) -> Self {
        Self {
            events: events.clone(),
            rows: Rows::default(),
            capabilities: TableCapabilities::all(),
            info_slot: InfoSlot::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: TableCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_rows(self, rows: &Rows) -> Self {
        Self {
            rows: rows.clone(),
            ..self
        }
    }

    fn build(
        &self,
        method: &str,
        args: &CreateArgs<'_>,
    ) -> HostResult<(String, Box<dyn VirtualTable>)> {
        self.events.push(format!("{} {}", method, args.table));
        let flag = |name: &str| args.args.iter().any(|a| a.trim() == name);
        if flag("fail") {
            return Err(HostError::error(format!("cannot build {}", args.table)));
        }
        let schema = if flag("badschema") {
            "CREATE TABLE x(".to_string()
        } else {
            "CREATE TABLE x(a, b)".to_string()
        };
        let flags = Flags {
            sticky: flag("sticky"),
            reject: flag("reject"),
            failplan: flag("failplan"),
            badslot: flag("badslot"),
        };
        Ok((
            schema,
            Box::new(MemTable::new(
                &self.events,
                &self.rows,
                self.capabilities,
                &self.info_slot,
                flags,
            )),
        ))
    }
}

impl TableFactory for MemFactory {
    fn create(&self, args: &CreateArgs<'_>) -> HostResult<(String, Box<dyn VirtualTable>)> {
        self.build("create", args)
    }

    fn connect(&self, args: &CreateArgs<'_>) -> HostResult<(String, Box<dyn VirtualTable>)> {
        self.build("connect", args)
    }

    fn shadow_name(&self, suffix: &str) -> HostResult<bool> {
        self.events.push(format!("shadow_name {}", suffix));
        match suffix {
            "boom" => Err(HostError::error("shadow lookup failed")),
            s => Ok(s == "data"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    sticky: bool,
    reject: bool,
    failplan: bool,
    badslot: bool,
}

pub struct MemTable {
    events: Events,
    rows: Rows,
    capabilities: TableCapabilities,
    info_slot: InfoSlot,
    flags: Flags,
    upper: Arc<dyn ScalarFunction>,
    instr: Arc<dyn ScalarFunction>,
}

impl MemTable {
    fn new(
        events: &Events,
        rows: &Rows,
        capabilities: TableCapabilities,
        info_slot: &InfoSlot,
        flags: Flags,
    ) -> Self {
        let upper_events = events.clone();
        let upper = move |args: &[Value]| -> HostResult<Value> {
            upper_events.push("call upper");
            Ok(match args.first() {
                Some(Value::Text(s)) => Value::Text(format!("<{}>", s.to_uppercase())),
                _ => Value::Null,
            })
        };
        let instr_events = events.clone();
        let instr = move |args: &[Value]| -> HostResult<Value> {
            instr_events.push("call instr");
            match (args.first(), args.get(1)) {
                (Some(Value::Text(hay)), Some(Value::Text(needle))) => {
                    Ok(Value::from(hay.contains(needle.as_str())))
                }
                _ => Ok(Value::Integer(0)),
            }
        };
        Self {
            events: events.clone(),
            rows: rows.clone(),
            capabilities,
            info_slot: info_slot.clone(),
            flags,
            upper: Arc::new(upper),
            instr: Arc::new(instr),
        }
    }

    fn resolve(values: &[ColumnValue], old: Option<&Vec<Value>>) -> Vec<Value> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| match v {
                ColumnValue::Value(v) => v.clone(),
                ColumnValue::Unchanged => old.and_then(|o| o.get(i).cloned()).unwrap_or_default(),
            })
            .collect()
    }
}

impl Drop for MemTable {
    fn drop(&mut self) {
        self.events.push("drop");
    }
}

impl VirtualTable for MemTable {
    fn capabilities(&self) -> TableCapabilities {
        self.capabilities
    }

    fn best_index(
        &mut self,
        constraints: &[vtbridge::Constraint],
        _order_bys: &[vtbridge::OrderBy],
    ) -> HostResult<Option<IndexPlan>> {
        let ops: Vec<_> = constraints.iter().map(|c| (c.column, c.op)).collect();
        self.events.push(format!("best_index {:?}", ops));
        let Some(chosen) = constraints
            .iter()
            .position(|c| c.column == -1 && c.op == ConstraintOp::Eq)
        else {
            return Ok(None);
        };
        let usage = (0..constraints.len()).map(|i| {
            if i == chosen {
                ConstraintUsage::ArgumentOmit(0, true)
            } else {
                ConstraintUsage::Unused
            }
        });
        Ok(Some(IndexPlan::new().usage(usage).index_number(1).estimated_cost(1.0)))
    }

    fn best_index_object(&mut self, info: &IndexInfo) -> HostResult<bool> {
        self.events.push("best_index_object");
        *self.info_slot.lock().unwrap() = Some(info.clone());
        if self.flags.reject {
            return Ok(false);
        }
        if self.flags.failplan {
            return Err(HostError::error("planner refused"));
        }
        for (i, c) in info.constraints()?.iter().enumerate() {
            if !(c.usable && c.column == -1 && c.op == ConstraintOp::Eq) {
                continue;
            }
            let in_list = info.is_in_constraint(i)? && info.set_in_constraint(i, true)?;
            info.set_argv_index(i, Some(if self.flags.badslot { 5 } else { 0 }))?;
            info.set_omit(i, true)?;
            info.set_index_number(if in_list { 2 } else { 1 })?;
            info.set_index_string(Some("by-rowid"))?;
            info.set_estimated_cost(1.0)?;
            info.set_estimated_rows(1)?;
            if !in_list {
                info.set_scan_flags(SCAN_UNIQUE)?;
            }
            self.events.push(format!(
                "rhs {:?} collation {:?}",
                info.rhs_value(i)?,
                info.collation(i)?
            ));
            return Ok(true);
        }
        info.set_estimated_cost(1000.0)?;
        Ok(true)
    }

    fn open(&mut self) -> HostResult<Box<dyn VirtualCursor>> {
        self.events.push("open");
        Ok(Box::new(MemCursor {
            events: self.events.clone(),
            rows: self.rows.clone(),
            snapshot: Vec::new(),
            pos: 0,
        }))
    }

    fn destroy(&mut self) -> HostResult<()> {
        self.events.push("destroy");
        if self.flags.sticky {
            return Err(HostError::error("table is sticky"));
        }
        Ok(())
    }

    fn disconnect(&mut self) -> HostResult<()> {
        self.events.push("disconnect");
        Ok(())
    }

    fn update_delete_row(&mut self, _ctx: &UpdateContext<'_>, rowid: i64) -> HostResult<()> {
        self.events.push(format!("delete {}", rowid));
        self.rows.lock().unwrap().remove(&rowid);
        Ok(())
    }

    fn update_insert_row(
        &mut self,
        ctx: &UpdateContext<'_>,
        rowid: Option<i64>,
        values: &[ColumnValue],
    ) -> HostResult<i64> {
        self.events.push(format!("insert {:?} {:?}", rowid, ctx.on_conflict()));
        let mut rows = self.rows.lock().unwrap();
        let rowid = rowid.unwrap_or_else(|| rows.keys().next_back().map_or(42, |last| last + 1));
        if rows.contains_key(&rowid) {
            return Err(HostError::constraint(format!("rowid {} already exists", rowid)));
        }
        rows.insert(rowid, Self::resolve(values, None));
        Ok(rowid)
    }

    fn update_change_row(
        &mut self,
        _ctx: &UpdateContext<'_>,
        old_rowid: i64,
        new_rowid: i64,
        values: &[ColumnValue],
    ) -> HostResult<()> {
        self.events.push(format!(
            "change {} {} {}",
            old_rowid,
            new_rowid,
            values.iter().filter(|v| v.is_unchanged()).count()
        ));
        let mut rows = self.rows.lock().unwrap();
        let old = rows.remove(&old_rowid);
        let merged = Self::resolve(values, old.as_ref());
        rows.insert(new_rowid, merged);
        Ok(())
    }

    fn begin(&mut self) -> HostResult<()> {
        self.events.push("begin");
        Ok(())
    }

    fn sync(&mut self) -> HostResult<()> {
        self.events.push("sync");
        Ok(())
    }

    fn commit(&mut self) -> HostResult<()> {
        self.events.push("commit");
        Ok(())
    }

    fn rollback(&mut self) -> HostResult<()> {
        self.events.push("rollback");
        Ok(())
    }

    fn savepoint(&mut self, level: i32) -> HostResult<()> {
        self.events.push(format!("savepoint {}", level));
        Ok(())
    }

    fn release(&mut self, level: i32) -> HostResult<()> {
        self.events.push(format!("release {}", level));
        Ok(())
    }

    fn rollback_to(&mut self, level: i32) -> HostResult<()> {
        self.events.push(format!("rollback_to {}", level));
        Ok(())
    }

    fn rename(&mut self, new_name: &str) -> HostResult<()> {
        self.events.push(format!("rename {}", new_name));
        if new_name == "forbidden" {
            return Err(HostError::error("that name is taken"));
        }
        Ok(())
    }

    fn integrity(
        &mut self,
        schema: &str,
        table: &str,
        is_quick: bool,
    ) -> HostResult<Option<String>> {
        self.events.push(format!("integrity {} {} {}", schema, table, is_quick));
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .iter()
            .find(|(_, values)| values.get(1) == Some(&Value::Text("corrupt".into())))
            .map(|(rowid, _)| format!("row {} is corrupt", rowid)))
    }

    fn find_function(&mut self, name: &str, nargs: i32) -> HostResult<Option<FunctionOverload>> {
        self.events.push(format!("find_function {} {}", name, nargs));
        Ok(match (name, nargs) {
            ("upper", 1) => Some(FunctionOverload::from_arc(self.upper.clone())),
            ("instr", 2) => {
                Some(FunctionOverload::from_arc(self.instr.clone()).with_constraint_op(150))
            }
            ("lower", 1) => {
                Some(FunctionOverload::from_arc(self.upper.clone()).with_constraint_op(10))
            }
            _ => None,
        })
    }
}

pub struct MemCursor {
    events: Events,
    rows: Rows,
    snapshot: Vec<(i64, Vec<Value>)>,
    pos: usize,
}

impl MemCursor {
    fn current(&self) -> HostResult<&(i64, Vec<Value>)> {
        self.snapshot
            .get(self.pos)
            .ok_or_else(|| HostError::misuse("cursor is past the last row"))
    }
}

impl VirtualCursor for MemCursor {
    fn filter(
        &mut self,
        index_number: i32,
        index_string: Option<&str>,
        args: &[FilterArg],
    ) -> HostResult<()> {
        self.events.push(format!("filter {} {:?} {}", index_number, index_string, args.len()));
        let rows = self.rows.lock().unwrap();
        self.snapshot = rows.iter().map(|(k, v)| (*k, v.clone())).collect();
        if index_number > 0 {
            let wanted: Vec<i64> = match args.first() {
                Some(FilterArg::Value(v)) => v.as_i64().into_iter().collect(),
                Some(FilterArg::Set(values)) => values.iter().filter_map(Value::as_i64).collect(),
                None => Vec::new(),
            };
            self.snapshot.retain(|(rowid, _)| wanted.contains(rowid));
        }
        self.pos = 0;
        Ok(())
    }

    fn eof(&self) -> HostResult<bool> {
        Ok(self.pos >= self.snapshot.len())
    }

    fn column(&self, index: i32) -> HostResult<Value> {
        let (rowid, values) = self.current()?;
        if index < 0 {
            return Ok(Value::Integer(*rowid));
        }
        let value = values.get(index as usize).cloned().unwrap_or_default();
        if value.as_str() == Some("explode") {
            return Err(HostError::error("column exploded"));
        }
        if value.as_str() == Some("panic") {
            panic!("column panicked");
        }
        Ok(value)
    }

    fn column_no_change(&self, index: i32) -> HostResult<ColumnValue> {
        self.events.push(format!("column_no_change {}", index));
        Ok(ColumnValue::Unchanged)
    }

    fn next(&mut self) -> HostResult<()> {
        self.pos += 1;
        Ok(())
    }

    fn rowid(&self) -> HostResult<i64> {
        Ok(self.current()?.0)
    }

    fn close(&mut self) -> HostResult<()> {
        self.events.push("close");
        Ok(())
    }
}

/// Route bridge logs to the test output. Filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Run `sql` and collect every row.
pub fn query(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<Vec<SqlValue>>> {
    let mut stmt = conn.prepare(sql)?;
    let n = stmt.column_count();
    let rows = stmt.query_map([], |row| {
        (0..n)
            .map(|i| row.get::<_, SqlValue>(i))
            .collect::<rusqlite::Result<Vec<_>>>()
    })?;
    rows.collect()
}

/// Error message of a failed rusqlite call.
pub fn message(err: &rusqlite::Error) -> String {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.clone(),
        other => other.to_string(),
    }
}

pub fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

pub fn int(i: i64) -> SqlValue {
    SqlValue::Integer(i)
}
