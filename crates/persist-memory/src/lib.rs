//! In-memory storage engine for persist.
//!
//! `MemoryStorage` implements the `Storage` trait over plain vectors of rows.
//! It exists so that every behavior of the persistence context can be
//! exercised without a database:
//!
//! - **Units of work**: each unit stages its writes in a journal. Reads see
//!   committed rows with the unit's own journal replayed on top; other units
//!   see the writes only after commit. Discard drops the journal.
//! - **Row locks**: `PESSIMISTIC_WRITE` locks block the calling thread until
//!   the holder commits or discards, or the timeout elapses.
//! - **Counters**: [`StorageStats`] records every storage call so tests can
//!   assert how many fetches and writes an operation cost.

mod locks;
mod table;

use asupersync::{Cx, Outcome};
use locks::{Grant, LockTable};
use persist_core::{
    Error, QueryError, QueryErrorKind, Result, Row, TransactionError, TransactionErrorKind, Value,
};
use persist_query::{
    Assignment, Expr, FetchRequest, JoinSpec, LockMode, Storage, UnitId, WriteOp, WriteResult,
    compare_rows,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use table::{Staged, Table};

/// Counts of storage calls since creation or the last [`MemoryStorage::reset_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub loads: u64,
    pub queries: u64,
    pub counts: u64,
    pub writes: u64,
    pub bulk_mutations: u64,
    pub lock_requests: u64,
    /// Lock requests that had to wait for another unit
    pub lock_waits: u64,
    pub commits: u64,
    pub discards: u64,
}

impl StorageStats {
    /// Row fetches: `load` plus `query` calls.
    pub fn fetches(&self) -> u64 {
        self.loads + self.queries
    }
}

#[derive(Default)]
struct StoreState {
    tables: HashMap<&'static str, Table>,
    units: HashMap<UnitId, Vec<Staged>>,
    next_unit: u64,
}

/// In-memory [`Storage`] engine.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<StoreState>,
    locks: LockTable,
    stats: Mutex<StorageStats>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table. Re-creating an existing table empties it.
    pub fn create_table(&self, table: &'static str, primary_key: &[&str], auto_increment: bool) {
        self.state()
            .tables
            .insert(table, Table::new(table, primary_key, auto_increment));
    }

    /// Insert committed rows directly, outside any unit of work.
    #[allow(clippy::result_large_err)]
    pub fn seed<I>(&self, table: &'static str, rows: I) -> Result<()>
    where
        I: IntoIterator<Item = Row>,
    {
        let mut state = self.state();
        let target = state.tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
        for row in rows {
            target.insert(row)?;
        }
        Ok(())
    }

    /// Rows visible outside any unit of work.
    pub fn committed_rows(&self, table: &str) -> Vec<Row> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> StorageStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reset_stats(&self) {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = StorageStats::default();
    }

    /// The unit currently holding the write lock on a row.
    pub fn lock_holder(&self, table: &'static str, key: &[Value]) -> Option<UnitId> {
        self.locks.holder(table, key)
    }

    /// Number of units begun but not yet committed or discarded.
    pub fn open_units(&self) -> usize {
        self.state().units.len()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self, f: impl FnOnce(&mut StorageStats)) {
        f(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }

    fn begin(&self) -> UnitId {
        let mut state = self.state();
        state.next_unit += 1;
        let unit = UnitId(state.next_unit);
        state.units.insert(unit, Vec::new());
        tracing::trace!(%unit, "unit begun");
        unit
    }

    #[allow(clippy::result_large_err)]
    fn commit_unit(&self, unit: UnitId) -> Result<()> {
        let result = {
            let mut state = self.state();
            let journal = state.units.remove(&unit).ok_or_else(|| unknown_unit(unit))?;
            let mut tables = state.tables.clone();
            let applied = journal.iter().try_for_each(|staged| {
                let table = tables
                    .get_mut(staged.table())
                    .ok_or_else(|| unknown_table(staged.table()))?;
                staged.apply(table, true)
            });
            match applied {
                Ok(()) => {
                    state.tables = tables;
                    tracing::debug!(%unit, writes = journal.len(), "unit committed");
                    Ok(())
                }
                Err(e) => Err(Error::Transaction(TransactionError {
                    kind: TransactionErrorKind::CommitFailed,
                    message: format!("{unit} could not be committed: {e}"),
                })),
            }
        };
        self.locks.release_unit(unit);
        result
    }

    #[allow(clippy::result_large_err)]
    fn discard_unit(&self, unit: UnitId) -> Result<()> {
        let journal = self.state().units.remove(&unit);
        let released = self.locks.release_unit(unit);
        match journal {
            Some(journal) => {
                tracing::debug!(%unit, dropped = journal.len(), released, "unit discarded");
                Ok(())
            }
            None => Err(unknown_unit(unit)),
        }
    }

    /// The unit's view of one table: committed rows plus its staged writes.
    #[allow(clippy::result_large_err)]
    fn view(state: &StoreState, unit: UnitId, table: &'static str) -> Result<Table> {
        let journal = state.units.get(&unit).ok_or_else(|| unknown_unit(unit))?;
        let mut view = state
            .tables
            .get(table)
            .cloned()
            .ok_or_else(|| unknown_table(table))?;
        for staged in journal.iter().filter(|s| s.table() == table) {
            staged.apply(&mut view, false)?;
        }
        Ok(view)
    }

    #[allow(clippy::result_large_err)]
    fn load_row(&self, unit: UnitId, table: &'static str, key: &[Value]) -> Result<Option<Row>> {
        let state = self.state();
        Ok(Self::view(&state, unit, table)?.get(key).cloned())
    }

    #[allow(clippy::result_large_err)]
    fn query_rows(&self, unit: UnitId, request: &FetchRequest) -> Result<Vec<Row>> {
        let state = self.state();
        let base = Self::view(&state, unit, request.table)?;
        let mut rows = matching(&base, request.filter.as_ref())?;
        rows.sort_by(|a, b| compare_rows(a, b, &request.order));
        if let Some(window) = request.window {
            rows = window.apply(rows);
        }
        if request.joins.is_empty() {
            return Ok(rows);
        }

        let related = request
            .joins
            .iter()
            .map(|join| Self::view(&state, unit, join.table))
            .collect::<Result<Vec<_>>>()?;
        Ok(rows
            .iter()
            .flat_map(|parent| join_rows(parent, request.table, &request.joins, &related))
            .collect())
    }

    #[allow(clippy::result_large_err)]
    fn count_rows(&self, unit: UnitId, table: &'static str, filter: Option<&Expr>) -> Result<u64> {
        let state = self.state();
        let view = Self::view(&state, unit, table)?;
        Ok(matching(&view, filter)?.len() as u64)
    }

    #[allow(clippy::result_large_err)]
    fn apply_write(&self, unit: UnitId, op: WriteOp) -> Result<WriteResult> {
        let mut state = self.state();
        let table = op.table();
        let view = Self::view(&state, unit, table)?;

        let (staged, result) = match op {
            WriteOp::Insert { values, .. } => {
                let mut row: Vec<(String, Value)> =
                    values.into_iter().map(|(c, v)| (c.to_string(), v)).collect();
                let mut generated_key = None;
                let committed = state.tables.get_mut(table).ok_or_else(|| unknown_table(table))?;
                let pk_columns = committed.primary_key.clone();
                if let [pk] = pk_columns.as_slice() {
                    let missing = row
                        .iter()
                        .find(|(c, _)| c == pk)
                        .is_none_or(|(_, v)| v.is_null());
                    if missing && committed.auto_increment {
                        let key = Value::BigInt(committed.take_generated_key());
                        row.retain(|(c, _)| c != pk);
                        row.insert(0, (pk.clone(), key.clone()));
                        generated_key = Some(key);
                    }
                }
                let row = Row::from_pairs(row);
                let key = view.key_of(&row);
                if key.iter().any(Value::is_null) {
                    return Err(Error::Query(QueryError {
                        kind: QueryErrorKind::Constraint,
                        table: Some(table),
                        message: "primary key must not be NULL".to_string(),
                    }));
                }
                committed.observe_key(&key);
                // conflicts with rows this unit can see are reported now
                view.clone().insert(row.clone())?;
                (
                    Some(Staged::Insert { table, row }),
                    WriteResult {
                        affected: 1,
                        generated_key,
                    },
                )
            }
            WriteOp::Update { key, values, .. } => {
                if view.get(&key).is_some() {
                    let values = values.into_iter().map(|(c, v)| (c.to_string(), v)).collect();
                    (Some(Staged::Update { table, key, values }), affected(1))
                } else {
                    (None, affected(0))
                }
            }
            WriteOp::Delete { key, .. } => {
                if view.get(&key).is_some() {
                    (Some(Staged::Remove { table, key }), affected(1))
                } else {
                    (None, affected(0))
                }
            }
        };

        if let Some(staged) = staged {
            state
                .units
                .get_mut(&unit)
                .ok_or_else(|| unknown_unit(unit))?
                .push(staged);
        }
        Ok(result)
    }

    #[allow(clippy::result_large_err)]
    fn mutate_rows(
        &self,
        unit: UnitId,
        table: &'static str,
        filter: Option<&Expr>,
        assignments: &[Assignment],
    ) -> Result<u64> {
        let mut state = self.state();
        let view = Self::view(&state, unit, table)?;
        let mut staged = Vec::new();
        for row in matching(&view, filter)? {
            let values = assignments
                .iter()
                .map(|a| Ok((a.column.to_string(), a.value.evaluate(&row)?)))
                .collect::<Result<Vec<_>>>()?;
            staged.push(Staged::Update {
                table,
                key: view.key_of(&row),
                values,
            });
        }
        let changed = staged.len() as u64;
        state
            .units
            .get_mut(&unit)
            .ok_or_else(|| unknown_unit(unit))?
            .extend(staged);
        Ok(changed)
    }

    #[allow(clippy::result_large_err)]
    fn delete_rows(&self, unit: UnitId, table: &'static str, filter: Option<&Expr>) -> Result<u64> {
        let mut state = self.state();
        let view = Self::view(&state, unit, table)?;
        let staged: Vec<Staged> = matching(&view, filter)?
            .iter()
            .map(|row| Staged::Remove {
                table,
                key: view.key_of(row),
            })
            .collect();
        let removed = staged.len() as u64;
        state
            .units
            .get_mut(&unit)
            .ok_or_else(|| unknown_unit(unit))?
            .extend(staged);
        Ok(removed)
    }

    #[allow(clippy::result_large_err)]
    fn lock_row(
        &self,
        unit: UnitId,
        table: &'static str,
        key: &[Value],
        mode: LockMode,
        timeout: Duration,
    ) -> Result<()> {
        if !self.state().units.contains_key(&unit) {
            return Err(unknown_unit(unit));
        }
        if mode != LockMode::PessimisticWrite {
            return Ok(());
        }
        self.bump(|s| s.lock_requests += 1);
        let grant = self.locks.acquire(unit, table, key, timeout)?;
        if grant == Grant::AfterWait {
            self.bump(|s| s.lock_waits += 1);
        }
        Ok(())
    }
}

fn affected(n: u64) -> WriteResult {
    WriteResult {
        affected: n,
        generated_key: None,
    }
}

#[allow(clippy::result_large_err)]
fn matching(table: &Table, filter: Option<&Expr>) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for row in &table.rows {
        let keep = match filter {
            Some(expr) => expr.matches(row)?,
            None => true,
        };
        if keep {
            rows.push(row.clone());
        }
    }
    Ok(rows)
}

/// Left-join one parent row against each related table.
fn join_rows(parent: &Row, table: &'static str, joins: &[JoinSpec], related: &[Table]) -> Vec<Row> {
    let mut combined = vec![parent.prefixed(table)];
    for (join, target) in joins.iter().zip(related) {
        let local = parent.get_by_name(join.local_key).cloned().unwrap_or(Value::Null);
        if local.is_null() {
            continue;
        }
        let matched: Vec<Row> = target
            .rows
            .iter()
            .filter(|r| r.get_by_name(join.remote_key).is_some_and(|v| v.same_as(&local)))
            .map(|r| r.prefixed(join.alias))
            .collect();
        if matched.is_empty() {
            continue;
        }
        combined = combined
            .iter()
            .flat_map(|base| matched.iter().map(move |m| concat(base, m)))
            .collect();
    }
    combined
}

fn concat(left: &Row, right: &Row) -> Row {
    Row::from_pairs(
        left.iter()
            .chain(right.iter())
            .map(|(name, value)| (name.to_string(), value.clone())),
    )
}

fn unknown_unit(unit: UnitId) -> Error {
    Error::Transaction(TransactionError {
        kind: TransactionErrorKind::UnknownUnit,
        message: format!("{unit} is not open"),
    })
}

fn unknown_table(table: &'static str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        table: Some(table),
        message: format!("table '{table}' does not exist"),
    })
}

fn outcome<T>(result: Result<T>) -> Outcome<T, Error> {
    match result {
        Ok(value) => Outcome::Ok(value),
        Err(e) => Outcome::Err(e),
    }
}

impl Storage for MemoryStorage {
    fn begin_unit(&self, cx: &Cx) -> impl Future<Output = Outcome<UnitId, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            Outcome::Ok(self.begin())
        }
    }

    fn commit(&self, cx: &Cx, unit: UnitId) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.bump(|s| s.commits += 1);
            outcome(self.commit_unit(unit))
        }
    }

    fn discard(&self, _cx: &Cx, unit: UnitId) -> impl Future<Output = Outcome<(), Error>> + Send {
        // not cancellable: a discarded unit must always release its locks
        async move {
            self.bump(|s| s.discards += 1);
            outcome(self.discard_unit(unit))
        }
    }

    fn abandon_unit(&self, unit: UnitId) {
        if self.discard_unit(unit).is_ok() {
            self.bump(|s| s.discards += 1);
        }
    }

    fn load(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        key: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.bump(|s| s.loads += 1);
            outcome(self.load_row(unit, table, key))
        }
    }

    fn query(
        &self,
        cx: &Cx,
        unit: UnitId,
        request: &FetchRequest,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.bump(|s| s.queries += 1);
            outcome(self.query_rows(unit, request))
        }
    }

    fn count(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        filter: Option<&Expr>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.bump(|s| s.counts += 1);
            outcome(self.count_rows(unit, table, filter))
        }
    }

    fn write(
        &self,
        cx: &Cx,
        unit: UnitId,
        op: WriteOp,
    ) -> impl Future<Output = Outcome<WriteResult, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.bump(|s| s.writes += 1);
            outcome(self.apply_write(unit, op))
        }
    }

    fn bulk_mutate(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        filter: Option<&Expr>,
        assignments: &[Assignment],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.bump(|s| s.bulk_mutations += 1);
            outcome(self.mutate_rows(unit, table, filter, assignments))
        }
    }

    fn bulk_delete(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        filter: Option<&Expr>,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            self.bump(|s| s.bulk_mutations += 1);
            outcome(self.delete_rows(unit, table, filter))
        }
    }

    fn acquire_lock(
        &self,
        cx: &Cx,
        unit: UnitId,
        table: &'static str,
        key: &[Value],
        mode: LockMode,
        timeout: Duration,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        async move {
            if let Some(reason) = cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            outcome(self.lock_row(unit, table, key, mode, timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use persist_query::{OrderBy, Window};
    use std::sync::Arc;
    use std::thread;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn storage() -> MemoryStorage {
        let storage = MemoryStorage::new();
        storage.create_table("team", &["team_id"], true);
        storage.create_table("member", &["member_id"], true);
        storage
    }

    fn insert_member(username: &str, age: i32, team: Option<i64>) -> WriteOp {
        WriteOp::Insert {
            table: "member",
            primary_key: &["member_id"],
            values: vec![
                ("member_id", Value::Null),
                ("username", Value::from(username)),
                ("age", Value::Int(age)),
                ("team_id", Value::from(team)),
            ],
        }
    }

    fn insert_team(name: &str) -> WriteOp {
        WriteOp::Insert {
            table: "team",
            primary_key: &["team_id"],
            values: vec![("team_id", Value::Null), ("name", Value::from(name))],
        }
    }

    #[test]
    fn staged_writes_are_private_until_commit() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();

        rt.block_on(async {
            let a = unwrap_outcome(storage.begin_unit(&cx).await);
            let b = unwrap_outcome(storage.begin_unit(&cx).await);

            let written = unwrap_outcome(storage.write(&cx, a, insert_member("AAA", 10, None)).await);
            assert_eq!(written.generated_key, Some(Value::BigInt(1)));

            let key = [Value::BigInt(1)];
            assert!(unwrap_outcome(storage.load(&cx, a, "member", &key).await).is_some());
            assert!(unwrap_outcome(storage.load(&cx, b, "member", &key).await).is_none());

            unwrap_outcome(storage.commit(&cx, a).await);
            assert!(unwrap_outcome(storage.load(&cx, b, "member", &key).await).is_some());
            unwrap_outcome(storage.discard(&cx, b).await);
        });

        assert_eq!(storage.committed_rows("member").len(), 1);
        assert_eq!(storage.open_units(), 0);
        assert_eq!(storage.stats().commits, 1);
    }

    #[test]
    fn discard_drops_the_journal() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();

        rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            unwrap_outcome(storage.write(&cx, unit, insert_member("AAA", 10, None)).await);
            unwrap_outcome(storage.discard(&cx, unit).await);
            assert!(matches!(
                storage.commit(&cx, unit).await,
                Outcome::Err(Error::Transaction(_))
            ));
        });

        assert!(storage.committed_rows("member").is_empty());
    }

    #[test]
    fn query_filters_orders_and_windows() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();

        rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            let members = [
                ("member1", 10),
                ("member2", 10),
                ("member3", 10),
                ("member4", 10),
                ("member5", 10),
                ("other", 20),
            ];
            for (name, age) in members {
                unwrap_outcome(storage.write(&cx, unit, insert_member(name, age, None)).await);
            }

            let mut request = FetchRequest::new("member")
                .filter(Expr::col("age").eq(10))
                .window(Window::new(0, 3));
            request.order.push(OrderBy::desc("username"));
            let rows = unwrap_outcome(storage.query(&cx, unit, &request).await);
            let names: Vec<String> = rows
                .iter()
                .map(|r| r.get_named("username").unwrap())
                .collect();
            assert_eq!(names, ["member5", "member4", "member3"]);

            let total = unwrap_outcome(
                storage
                    .count(&cx, unit, "member", Some(&Expr::col("age").eq(10)))
                    .await,
            );
            assert_eq!(total, 5);
        });
    }

    #[test]
    fn left_join_prefixes_and_keeps_unmatched_parents() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();

        rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            unwrap_outcome(storage.write(&cx, unit, insert_team("teamA")).await);
            unwrap_outcome(storage.write(&cx, unit, insert_member("m1", 10, Some(1))).await);
            unwrap_outcome(storage.write(&cx, unit, insert_member("m2", 20, None)).await);

            let mut request = FetchRequest::new("member");
            request.joins.push(JoinSpec {
                alias: "team",
                table: "team",
                local_key: "team_id",
                remote_key: "team_id",
            });
            let rows = unwrap_outcome(storage.query(&cx, unit, &request).await);
            assert_eq!(rows.len(), 2);
            assert_eq!(
                rows[0].get_named::<String>("team__name").unwrap(),
                "teamA"
            );
            assert_eq!(rows[0].get_named::<String>("member__username").unwrap(), "m1");
            assert!(!rows[1].contains_column("team__name"));
        });
    }

    #[test]
    fn bulk_mutation_evaluates_against_old_row() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();

        rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            for age in [10, 19, 20, 21, 40] {
                unwrap_outcome(storage.write(&cx, unit, insert_member("m", age, None)).await);
            }
            let changed = unwrap_outcome(
                storage
                    .bulk_mutate(
                        &cx,
                        unit,
                        "member",
                        Some(&Expr::col("age").ge(20)),
                        &[Assignment::set("age", Expr::col("age").add(1))],
                    )
                    .await,
            );
            assert_eq!(changed, 3);
            let row = unwrap_outcome(storage.load(&cx, unit, "member", &[Value::BigInt(5)]).await)
                .unwrap();
            assert_eq!(row.get_named::<i32>("age").unwrap(), 41);

            let removed = unwrap_outcome(
                storage
                    .bulk_delete(&cx, unit, "member", Some(&Expr::col("age").lt(20)))
                    .await,
            );
            assert_eq!(removed, 2);
            assert_eq!(unwrap_outcome(storage.count(&cx, unit, "member", None).await), 3);
        });
    }

    #[test]
    fn duplicate_key_is_rejected_at_write() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();

        rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            let explicit = || WriteOp::Insert {
                table: "team",
                primary_key: &["team_id"],
                values: vec![("team_id", Value::BigInt(9)), ("name", Value::from("x"))],
            };
            unwrap_outcome(storage.write(&cx, unit, explicit()).await);
            assert!(matches!(
                storage.write(&cx, unit, explicit()).await,
                Outcome::Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    ..
                }))
            ));
            // generated keys continue past explicit ones
            let next = unwrap_outcome(storage.write(&cx, unit, insert_team("y")).await);
            assert_eq!(next.generated_key, Some(Value::BigInt(10)));
        });
    }

    #[test]
    fn unknown_table_is_not_found() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();

        rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            let outcome = storage.load(&cx, unit, "ghost", &[Value::BigInt(1)]).await;
            assert!(matches!(
                outcome,
                Outcome::Err(Error::Query(QueryError {
                    kind: QueryErrorKind::NotFound,
                    ..
                }))
            ));
        });
    }

    #[test]
    fn write_lock_blocks_until_release() {
        let storage = Arc::new(storage());
        let key = [Value::BigInt(1)];

        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let holder = rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            unwrap_outcome(
                storage
                    .acquire_lock(&cx, unit, "member", &key, LockMode::PessimisticWrite, Duration::ZERO)
                    .await,
            );
            unit
        });
        assert_eq!(storage.lock_holder("member", &key), Some(holder));

        let timed_out = rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            let outcome = storage
                .acquire_lock(
                    &cx,
                    unit,
                    "member",
                    &key,
                    LockMode::PessimisticWrite,
                    Duration::from_millis(20),
                )
                .await;
            storage.abandon_unit(unit);
            outcome
        });
        assert!(matches!(timed_out, Outcome::Err(ref e) if e.is_lock_timeout()));

        let waiter = {
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                let rt = RuntimeBuilder::current_thread()
                    .build()
                    .expect("create asupersync runtime");
                let cx = Cx::for_testing();
                rt.block_on(async {
                    let unit = unwrap_outcome(storage.begin_unit(&cx).await);
                    unwrap_outcome(
                        storage
                            .acquire_lock(
                                &cx,
                                unit,
                                "member",
                                &[Value::BigInt(1)],
                                LockMode::PessimisticWrite,
                                Duration::from_secs(5),
                            )
                            .await,
                    );
                    unit
                })
            })
        };
        thread::sleep(Duration::from_millis(30));
        storage.abandon_unit(holder);

        let next = waiter.join().expect("waiter thread");
        assert_eq!(storage.lock_holder("member", &key), Some(next));
        assert_eq!(storage.stats().lock_requests, 3);
    }

    #[test]
    fn read_only_mode_takes_no_lock() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let storage = storage();
        rt.block_on(async {
            let unit = unwrap_outcome(storage.begin_unit(&cx).await);
            unwrap_outcome(
                storage
                    .acquire_lock(&cx, unit, "member", &[Value::BigInt(1)], LockMode::ReadOnly, Duration::ZERO)
                    .await,
            );
        });
        assert_eq!(storage.lock_holder("member", &[Value::BigInt(1)]), None);
        assert_eq!(storage.stats().lock_requests, 0);
    }
}
