//! Downstream-apply core of a change-data-capture pipeline.
//!
//! The loader replays committed row-level changes against a
//! MySQL-compatible downstream. Its heart is the [`Executor`]: it merges
//! changes by primary key, applies deletes before replaces, fans sub-batches
//! out across tasks, retries with backoff, recovers from schema drift, and
//! stamps a loopback mark so a peer cluster can drop echoed writes.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use siphon_loader::{
//!     shutdown_pair, DbConfig, Executor, MysqlDownstream, SyncMode,
//! };
//!
//! # async fn run(dmls: Vec<siphon_loader::Dml>) -> Result<(), siphon_loader::LoaderError> {
//! let cfg = DbConfig {
//!     host: "127.0.0.1".into(),
//!     port: 3306,
//!     user: "repl".into(),
//!     password: "secret".into(),
//!     db_name: None,
//!     sync_mode: SyncMode::FullColumn,
//! };
//! let executor = Executor::new(Arc::new(MysqlDownstream::connect(&cfg)))
//!     .with_batch_size(128)
//!     .with_worker_count(16);
//! let (_handle, signal) = shutdown_pair();
//! executor
//!     .exec_table_batch_retry(&signal, dmls, 3, Duration::from_millis(100))
//!     .await
//! # }
//! ```

mod cancel;
mod config;
mod dml;
mod downstream;
mod error;
mod executor;
mod hooks;
mod loopback;
mod merge;
mod metrics;
mod retry;
mod tx;
mod txn;

pub use cancel::{shutdown_pair, ShutdownHandle, ShutdownSignal};
pub use config::{DbConfig, SyncMode, DEFAULT_BATCH_SIZE, DEFAULT_WORKER_COUNT};
pub use dml::{build_column_list, placeholders, quote_name, Dml, DmlKind, TableInfo};
pub use downstream::{Downstream, DownstreamTx, MysqlDownstream};
pub use error::{
    LoaderError, ER_BAD_FIELD_ERROR, ER_LOCK_DEADLOCK, ER_LOCK_WAIT_TIMEOUT,
};
pub use executor::{Executor, SchemaRefresher};
pub use hooks::{
    ExecutorExtend, HookPolicy, HookRegistry, LoaderExtend, PluginDestroy, PluginInit,
};
pub use loopback::{
    quote_mark_table, LoopbackInfo, DEFAULT_MARK_ROW_COUNT, DEFAULT_MARK_TABLE_NAME,
    MARK_ID_COLUMN, MARK_VAL_COLUMN,
};
pub use merge::{merge_by_primary_key, split_dmls, MergedDmls};
pub use metrics::{LabelSnapshot, QueryLabel, QueryMetrics, QueryMetricsSnapshot};
pub use retry::retry_context;
pub use tx::Tx;
pub use txn::{filter_txn, DdlEvent, Txn};
