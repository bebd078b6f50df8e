//! Row storage for one table plus the staged-write journal.

use persist_core::{Error, QueryError, QueryErrorKind, Result, Row, Value, same_key};

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub(crate) name: &'static str,
    pub(crate) primary_key: Vec<String>,
    pub(crate) auto_increment: bool,
    /// Next generated key; advanced past explicit keys too
    pub(crate) next_key: i64,
    /// Rows in insertion order
    pub(crate) rows: Vec<Row>,
}

impl Table {
    pub(crate) fn new(name: &'static str, primary_key: &[&str], auto_increment: bool) -> Self {
        Self {
            name,
            primary_key: primary_key.iter().map(|c| (*c).to_string()).collect(),
            auto_increment,
            next_key: 1,
            rows: Vec::new(),
        }
    }

    pub(crate) fn key_of(&self, row: &Row) -> Vec<Value> {
        self.primary_key
            .iter()
            .map(|column| row.get_by_name(column).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn position(&self, key: &[Value]) -> Option<usize> {
        self.rows.iter().position(|row| same_key(&self.key_of(row), key))
    }

    pub(crate) fn get(&self, key: &[Value]) -> Option<&Row> {
        self.position(key).map(|i| &self.rows[i])
    }

    /// Record an explicit key so later generated keys do not collide.
    pub(crate) fn observe_key(&mut self, key: &[Value]) {
        if let [single] = key {
            if let Some(n) = single.as_i64() {
                self.next_key = self.next_key.max(n.saturating_add(1));
            }
        }
    }

    pub(crate) fn take_generated_key(&mut self) -> i64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn insert(&mut self, row: Row) -> Result<()> {
        let key = self.key_of(&row);
        if self.position(&key).is_some() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Constraint,
                table: Some(self.name),
                message: format!("duplicate primary key {key:?}"),
            }));
        }
        self.observe_key(&key);
        self.rows.push(row);
        Ok(())
    }

    /// Overwrite columns of one row in place. Returns false when the row is gone.
    pub(crate) fn update(&mut self, key: &[Value], values: &[(String, Value)]) -> bool {
        match self.position(key) {
            Some(i) => {
                self.rows[i] = merge_row(&self.rows[i], values);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove(&mut self, key: &[Value]) -> bool {
        match self.position(key) {
            Some(i) => {
                self.rows.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Copy of `row` with `values` written over matching columns and any new
/// columns appended.
pub(crate) fn merge_row(row: &Row, values: &[(String, Value)]) -> Row {
    let mut pairs: Vec<(String, Value)> = row
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect();
    for (column, value) in values {
        match pairs.iter_mut().find(|(name, _)| name == column) {
            Some(slot) => slot.1 = value.clone(),
            None => pairs.push((column.clone(), value.clone())),
        }
    }
    Row::from_pairs(pairs)
}

/// A write staged by a unit, replayed over committed rows on read and at commit.
#[derive(Debug, Clone)]
pub(crate) enum Staged {
    Insert {
        table: &'static str,
        row: Row,
    },
    Update {
        table: &'static str,
        key: Vec<Value>,
        values: Vec<(String, Value)>,
    },
    Remove {
        table: &'static str,
        key: Vec<Value>,
    },
}

impl Staged {
    pub(crate) fn table(&self) -> &'static str {
        match self {
            Staged::Insert { table, .. }
            | Staged::Update { table, .. }
            | Staged::Remove { table, .. } => table,
        }
    }

    /// Apply to `table`. Under `strict` a conflicting insert is an error;
    /// otherwise the staged row wins.
    #[allow(clippy::result_large_err)]
    pub(crate) fn apply(&self, table: &mut Table, strict: bool) -> Result<()> {
        match self {
            Staged::Insert { row, .. } => {
                if strict {
                    table.insert(row.clone())?;
                } else {
                    let key = table.key_of(row);
                    table.remove(&key);
                    table.rows.push(row.clone());
                }
            }
            Staged::Update { key, values, .. } => {
                table.update(key, values);
            }
            Staged::Remove { key, .. } => {
                table.remove(key);
            }
        }
        Ok(())
    }
}
