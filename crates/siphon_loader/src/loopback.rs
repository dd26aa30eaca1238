//! Loopback-sync state shared between the executor and its plugins.
//!
//! In a bidirectional topology each cluster stamps a small mark table inside
//! every outbound transaction. The peer recognizes incoming transactions
//! that touch the mark table as its own echoes and drops them.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::dml::quote_name;
use crate::hooks::HookRegistry;

/// Name of the mark table's key column.
pub const MARK_ID_COLUMN: &str = "id";
/// Name of the mark table's counter column.
pub const MARK_VAL_COLUMN: &str = "val";
/// Default mark table name when the deployment does not configure one.
pub const DEFAULT_MARK_TABLE_NAME: &str = "siphon_mark";
/// Default number of pre-seeded mark rows.
pub const DEFAULT_MARK_ROW_COUNT: i64 = 16;

/// Process-wide loopback state. Constructed at startup and shared via `Arc`;
/// only `index` is mutated on the hot path.
pub struct LoopbackInfo {
    /// Identity of this cluster in the replication topology.
    pub channel_id: u64,
    /// Monotone counter used to spread mark updates across mark rows, which
    /// keeps concurrent workers off the same row lock.
    index: AtomicI64,
    /// Whether outbound transactions stamp the mark table at begin.
    pub loopback_control: bool,
    /// Whether registered plugin hooks run at transaction boundaries.
    pub support_plugin: bool,
    /// Registered plugin hooks.
    pub hooks: HookRegistry,
    /// Mark table name, unqualified or `schema.table`.
    pub mark_table_name: String,
    /// Number of pre-seeded mark rows.
    pub mark_row_count: i64,
    /// Peer addresses whose transactions must never come back to us. An
    /// origin match means replicated writes are travelling in a cycle.
    pub migration_ips: Vec<String>,
}

impl LoopbackInfo {
    pub fn new(channel_id: u64) -> Self {
        Self {
            channel_id,
            index: AtomicI64::new(0),
            loopback_control: false,
            support_plugin: false,
            hooks: HookRegistry::default(),
            mark_table_name: DEFAULT_MARK_TABLE_NAME.to_string(),
            mark_row_count: DEFAULT_MARK_ROW_COUNT,
            migration_ips: Vec::new(),
        }
    }

    pub fn with_loopback_control(mut self, on: bool) -> Self {
        self.loopback_control = on;
        self
    }

    pub fn with_support_plugin(mut self, on: bool) -> Self {
        self.support_plugin = on;
        self
    }

    pub fn with_mark_table_name(mut self, name: impl Into<String>) -> Self {
        self.mark_table_name = name.into();
        self
    }

    pub fn with_mark_row_count(mut self, rows: i64) -> Self {
        self.mark_row_count = rows;
        self
    }

    pub fn with_migration_ips(mut self, ips: Vec<String>) -> Self {
        self.migration_ips = ips;
        self
    }

    /// Advance the counter and pick the mark row for the next transaction,
    /// `index mod spread`. `spread` is clamped to at least 1.
    pub fn next_mark_row(&self, spread: i64) -> i64 {
        let index = self.index.fetch_add(1, Ordering::SeqCst);
        index.rem_euclid(spread.max(1))
    }

    /// The stamp statement appended at transaction begin. The single bound
    /// parameter is the mark row id.
    pub fn mark_update_sql(&self) -> String {
        format!(
            "UPDATE {} SET {val} = {val} + 1 WHERE {id} = ? LIMIT 1",
            quote_mark_table(&self.mark_table_name),
            val = quote_name(MARK_VAL_COLUMN),
            id = quote_name(MARK_ID_COLUMN),
        )
    }

    /// Case-insensitive check whether `table` is the mark table. Incoming
    /// transactions that touch it are this cluster's own echoes.
    pub fn is_mark_table(&self, table: &str) -> bool {
        let bare = self
            .mark_table_name
            .rsplit('.')
            .next()
            .unwrap_or(&self.mark_table_name);
        table.eq_ignore_ascii_case(bare) || table.eq_ignore_ascii_case(&self.mark_table_name)
    }
}

/// Backquote a possibly schema-qualified table name.
pub fn quote_mark_table(name: &str) -> String {
    name.split('.')
        .map(quote_name)
        .collect::<Vec<_>>()
        .join(".")
}
