//! Row-level change records and the SQL they generate.
//!
//! A [`Dml`] is one captured row change. It carries the post-image values
//! (and the pre-image for updates) together with a shared handle to the
//! table's column and key layout, which is the canonical order used by every
//! generated statement.

use std::collections::HashMap;
use std::sync::Arc;

use mysql_async::Value;

use crate::error::LoaderError;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DmlKind {
    Insert,
    Update,
    Delete,
}

/// Column and key layout of one downstream table.
///
/// `columns` is the canonical order used in generated `REPLACE INTO` and
/// `INSERT INTO` column lists. A refreshed copy replaces the old one
/// wholesale; rows never mutate a shared `TableInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub columns: Vec<String>,
    pub primary_keys: Vec<String>,
    pub unique_keys: Vec<Vec<String>>,
}

impl TableInfo {
    pub fn new(columns: Vec<String>, primary_keys: Vec<String>) -> Self {
        Self {
            columns,
            primary_keys,
            unique_keys: Vec::new(),
        }
    }

    /// Columns used to address a single row: the primary key when one
    /// exists, otherwise every column.
    fn where_columns(&self) -> &[String] {
        if self.primary_keys.is_empty() {
            &self.columns
        } else {
            &self.primary_keys
        }
    }
}

/// One row-level change addressed to `schema`.`table`.
#[derive(Debug, Clone)]
pub struct Dml {
    pub kind: DmlKind,
    pub schema: String,
    pub table: String,
    /// Post-image for inserts and updates, row image for deletes.
    pub values: HashMap<String, Value>,
    /// Pre-image, present for updates only.
    pub old_values: Option<HashMap<String, Value>>,
    pub info: Arc<TableInfo>,
}

impl Dml {
    pub fn new(
        kind: DmlKind,
        schema: impl Into<String>,
        table: impl Into<String>,
        values: HashMap<String, Value>,
        info: Arc<TableInfo>,
    ) -> Self {
        Self {
            kind,
            schema: schema.into(),
            table: table.into(),
            values,
            old_values: None,
            info,
        }
    }

    pub fn with_old_values(mut self, old_values: HashMap<String, Value>) -> Self {
        self.old_values = Some(old_values);
        self
    }

    /// Backquoted table reference. The schema part is omitted when empty,
    /// which happens after the loopback filter clears it for cross-cluster
    /// apply against the connection's default database.
    pub fn table_name(&self) -> String {
        if self.schema.is_empty() {
            quote_name(&self.table)
        } else {
            format!("{}.{}", quote_name(&self.schema), quote_name(&self.table))
        }
    }

    /// Unquoted `schema.table` used as a map key.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Values used to locate the existing row: the pre-image for updates,
    /// the row image otherwise.
    fn where_values(&self) -> &HashMap<String, Value> {
        match (&self.kind, &self.old_values) {
            (DmlKind::Update, Some(old)) => old,
            _ => &self.values,
        }
    }

    /// Composite merge key `(schema, table, pk tuple)` rendered as a string.
    ///
    /// Fails when a primary-key column is absent or NULL, which violates the
    /// record invariant and cannot address a row downstream.
    pub fn merge_key(&self) -> Result<String, LoaderError> {
        let mut key = self.qualified_name();
        key.push('[');
        for (i, col) in self.info.where_columns().iter().enumerate() {
            let value = self.where_values().get(col);
            match value {
                None | Some(Value::NULL) if !self.info.primary_keys.is_empty() => {
                    return Err(LoaderError::MissingPrimaryKey {
                        column: col.clone(),
                        table: self.qualified_name(),
                    });
                }
                _ => {}
            }
            if i > 0 {
                key.push(',');
            }
            key.push_str(&value.cloned().unwrap_or(Value::NULL).as_sql(true));
        }
        key.push(']');
        Ok(key)
    }

    /// The DML's natural statement: `INSERT`, `UPDATE` or `DELETE`.
    pub fn sql(&self) -> (String, Vec<Value>) {
        match self.kind {
            DmlKind::Insert => self.insert_sql(),
            DmlKind::Update => self.update_sql(),
            DmlKind::Delete => self.delete_sql(),
        }
    }

    /// `DELETE FROM t WHERE … LIMIT 1` addressed by the where columns.
    pub fn delete_sql(&self) -> (String, Vec<Value>) {
        let (where_sql, args) = self.build_where();
        (
            format!("DELETE FROM {} WHERE {} LIMIT 1", self.table_name(), where_sql),
            args,
        )
    }

    /// `REPLACE INTO t (cols…) VALUES (…)` over the canonical column order.
    pub fn replace_sql(&self) -> (String, Vec<Value>) {
        self.row_image_sql("REPLACE")
    }

    /// `INSERT INTO t (cols…) VALUES (…)` over the canonical column order.
    pub fn insert_sql(&self) -> (String, Vec<Value>) {
        self.row_image_sql("INSERT")
    }

    /// `UPDATE t SET … WHERE … LIMIT 1` using the pre-image for addressing.
    pub fn update_sql(&self) -> (String, Vec<Value>) {
        let mut sets = Vec::with_capacity(self.info.columns.len());
        let mut args = Vec::with_capacity(self.info.columns.len());
        for col in &self.info.columns {
            if let Some(value) = self.values.get(col) {
                sets.push(format!("{} = ?", quote_name(col)));
                args.push(value.clone());
            }
        }
        let (where_sql, mut where_args) = self.build_where();
        args.append(&mut where_args);
        (
            format!(
                "UPDATE {} SET {} WHERE {} LIMIT 1",
                self.table_name(),
                sets.join(", "),
                where_sql
            ),
            args,
        )
    }

    fn row_image_sql(&self, verb: &str) -> (String, Vec<Value>) {
        let columns = &self.info.columns;
        let mut args = Vec::with_capacity(columns.len());
        for col in columns {
            args.push(self.values.get(col).cloned().unwrap_or(Value::NULL));
        }
        (
            format!(
                "{} INTO {} ({}) VALUES ({})",
                verb,
                self.table_name(),
                build_column_list(columns),
                placeholders(columns.len())
            ),
            args,
        )
    }

    fn build_where(&self) -> (String, Vec<Value>) {
        let values = self.where_values();
        let mut parts = Vec::new();
        let mut args = Vec::new();
        for col in self.info.where_columns() {
            match values.get(col) {
                Some(Value::NULL) | None => parts.push(format!("{} IS NULL", quote_name(col))),
                Some(value) => {
                    parts.push(format!("{} = ?", quote_name(col)));
                    args.push(value.clone());
                }
            }
        }
        (parts.join(" AND "), args)
    }

    /// Drop value entries for columns the refreshed layout no longer has,
    /// so regenerated statements match the downstream schema.
    pub fn remove_orphan_columns(&mut self, fresh: &TableInfo) {
        self.values.retain(|col, _| fresh.columns.contains(col));
        if let Some(old) = &mut self.old_values {
            old.retain(|col, _| fresh.columns.contains(col));
        }
    }
}

/// Backquote an identifier, escaping embedded backquotes.
pub fn quote_name(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Comma-joined backquoted column list.
pub fn build_column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_name(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `?,?,…` with `n` placeholders.
pub fn placeholders(n: usize) -> String {
    let mut out = String::with_capacity(n.saturating_mul(2));
    for i in 0..n {
        if i > 0 {
            out.push(',');
        }
        out.push('?');
    }
    out
}
