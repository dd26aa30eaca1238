//! The concurrent batch applier.
//!
//! Two apply modes share one transaction discipline. The table-batched mode
//! merges by primary key, deletes first, then replaces, fanning sub-batches
//! out across tasks. The single-row mode applies DMLs one by one and, in
//! safe mode, rewrites them so re-application is idempotent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::cancel::ShutdownSignal;
use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_WORKER_COUNT};
use crate::dml::{build_column_list, placeholders, Dml, DmlKind, TableInfo};
use crate::downstream::Downstream;
use crate::error::LoaderError;
use crate::hooks::HookPolicy;
use crate::loopback::LoopbackInfo;
use crate::merge::{merge_by_primary_key, split_dmls};
use crate::metrics::{QueryLabel, QueryMetrics};
use crate::retry::retry_context;
use crate::tx::Tx;

/// Source of fresh table layouts, consulted when the downstream reports a
/// column the cached layout still carries.
#[async_trait]
pub trait SchemaRefresher: Send + Sync {
    async fn refresh_table_info(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<TableInfo, LoaderError>;
}

/// Which bulk statement a sub-batch issues.
#[derive(Clone, Copy)]
enum BulkOp {
    Delete,
    Replace,
}

/// Concurrent batch applier over one downstream handle.
#[derive(Clone)]
pub struct Executor {
    downstream: Arc<dyn Downstream>,
    batch_size: usize,
    worker_count: usize,
    info: Option<Arc<LoopbackInfo>>,
    metrics: Option<Arc<QueryMetrics>>,
    refresher: Option<Arc<dyn SchemaRefresher>>,
    hook_policy: HookPolicy,
}

impl Executor {
    pub fn new(downstream: Arc<dyn Downstream>) -> Self {
        Self {
            downstream,
            batch_size: DEFAULT_BATCH_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            info: None,
            metrics: None,
            refresher: None,
            hook_policy: HookPolicy::default(),
        }
    }

    /// Cap on DMLs per sub-batch transaction.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Cap on concurrently running sub-batch tasks, also the spread of mark
    /// rows touched by loopback stamping.
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    /// Attach loopback state; enables mark stamping and plugin hooks.
    pub fn with_sync_info(mut self, info: Arc<LoopbackInfo>) -> Self {
        self.info = Some(info);
        self
    }

    /// Attach query metrics.
    pub fn with_metrics(mut self, metrics: Arc<QueryMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attach the schema refresh callback used for drift recovery.
    pub fn with_schema_refresher(mut self, refresher: Arc<dyn SchemaRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// What to do when an executor-extend hook fails.
    pub fn with_hook_policy(mut self, policy: HookPolicy) -> Self {
        self.hook_policy = policy;
        self
    }

    /// Open a transaction. With loopback control on, the mark update is the
    /// transaction's first statement; a failed or empty update rolls the
    /// transaction back, so this returns either a live `Tx` or a clean
    /// error with rollback already performed.
    pub async fn begin(&self) -> Result<Tx, LoaderError> {
        let inner = self.downstream.begin().await?;
        let mut tx = Tx::new(inner, self.metrics.clone());

        if let Some(info) = &self.info {
            if info.loopback_control {
                let row = info.next_mark_row(self.worker_count as i64);
                let result = tx
                    .exec_labeled(
                        QueryLabel::UpdateMarkTable,
                        &info.mark_update_sql(),
                        &[mysql_async::Value::from(row)],
                    )
                    .await;
                match result {
                    Ok(0) => {
                        tx.rollback_logged().await;
                        return Err(LoaderError::MarkUpdateFailed {
                            reason: "affected rows is zero".into(),
                        });
                    }
                    Ok(_) => tx.set_mark_stamped(true),
                    Err(err) => {
                        tx.rollback_logged().await;
                        return Err(LoaderError::MarkUpdateFailed {
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        Ok(tx)
    }

    /// Run the executor-extend chain. The chain stops at the first failure;
    /// what happens next is the hook policy's call.
    async fn run_executor_hooks(&self, tx: &mut Tx) -> Result<(), LoaderError> {
        let Some(info) = &self.info else {
            return Ok(());
        };
        if !info.support_plugin {
            return Ok(());
        }
        for (name, hook) in info.hooks.executor_extends() {
            if let Err(err) = hook.extend_txn(tx, info).await {
                error!(hook = %name, error = %err, "executor extension failed");
                match self.hook_policy {
                    HookPolicy::Strict => {
                        return Err(LoaderError::HookFailed {
                            hook: name,
                            reason: err.to_string(),
                        });
                    }
                    HookPolicy::Lenient => break,
                    HookPolicy::LogOnly => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_hook_failure();
                        }
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Delete every row in `deletes` inside one transaction, one prepared
    /// statement per row. Empty input is a no-op without a transaction.
    pub async fn bulk_delete(&self, deletes: Vec<Dml>) -> Result<(), LoaderError> {
        if deletes.is_empty() {
            return Ok(());
        }

        let mut tx = self.begin().await?;
        if let Err(err) = self.run_executor_hooks(&mut tx).await {
            tx.rollback_logged().await;
            return Err(err);
        }

        for dml in &deletes {
            let (query, params) = dml.delete_sql();
            if let Err(err) = tx.exec(&query, &params).await {
                tx.rollback_logged().await;
                return Err(err);
            }
        }

        tx.commit().await
    }

    /// Write every row image in `rows` with one multi-row `REPLACE INTO`.
    /// All rows must share a table, which the merge and split guarantee for
    /// executor-driven calls. Empty input is a no-op without a transaction.
    pub async fn bulk_replace(&self, rows: Vec<Dml>) -> Result<(), LoaderError> {
        if rows.is_empty() {
            return Ok(());
        }

        let info = rows[0].info.clone();
        let columns = &info.columns;
        let mut query = format!(
            "REPLACE INTO {} ({}) VALUES ",
            rows[0].table_name(),
            build_column_list(columns)
        );
        let tuple = format!("({})", placeholders(columns.len()));
        let mut params = Vec::with_capacity(rows.len() * columns.len());
        for (i, row) in rows.iter().enumerate() {
            if i > 0 {
                query.push(',');
            }
            query.push_str(&tuple);
            for col in columns {
                params.push(row.values.get(col).cloned().unwrap_or(mysql_async::Value::NULL));
            }
        }

        let mut tx = self.begin().await?;
        if let Err(err) = self.run_executor_hooks(&mut tx).await {
            tx.rollback_logged().await;
            return Err(err);
        }

        if let Err(err) = tx.exec(&query, &params).await {
            tx.rollback_logged().await;
            return Err(err);
        }

        tx.commit().await
    }

    /// Apply a mixed-op DML list: merge by primary key, then apply the
    /// delete bucket before the replace buckets. Each bucket fans out in
    /// sub-batches of `batch_size`; buckets are barriers, so every delete
    /// commits before the first replace begins.
    pub async fn exec_table_batch(
        &self,
        signal: &ShutdownSignal,
        dmls: Vec<Dml>,
    ) -> Result<(), LoaderError> {
        if dmls.is_empty() {
            return Ok(());
        }

        let merged = merge_by_primary_key(dmls)?;
        debug!(
            deletes = merged.deletes.len(),
            inserts = merged.inserts.len(),
            updates = merged.updates.len(),
            "merged dml batch"
        );

        self.split_exec(signal, merged.deletes, BulkOp::Delete).await?;
        self.split_exec(signal, merged.inserts, BulkOp::Replace).await?;
        self.split_exec(signal, merged.updates, BulkOp::Replace).await?;
        Ok(())
    }

    /// Fan one bucket out in `batch_size` chunks, at most `worker_count`
    /// running at once. Waits for every started chunk to reach a terminal
    /// state even on failure or shutdown; the first error wins and later
    /// ones are logged. Chunks not yet started when shutdown arrives are
    /// never started.
    async fn split_exec(
        &self,
        signal: &ShutdownSignal,
        dmls: Vec<Dml>,
        op: BulkOp,
    ) -> Result<(), LoaderError> {
        if dmls.is_empty() {
            return Ok(());
        }

        // Chunks touch disjoint primary keys after the merge, so grouping by
        // table keeps each replace statement single-table without changing
        // semantics.
        let mut join: JoinSet<Result<(), LoaderError>> = JoinSet::new();
        let limiter = Arc::new(Semaphore::new(self.worker_count.max(1)));
        let mut skipped = false;

        for chunk in split_by_table(dmls, self.batch_size) {
            if signal.is_shutdown() {
                skipped = true;
                break;
            }
            let permit = match Arc::clone(&limiter).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    skipped = true;
                    break;
                }
            };
            let exec = self.clone();
            join.spawn(async move {
                let _permit = permit;
                match op {
                    BulkOp::Delete => exec.bulk_delete(chunk).await,
                    BulkOp::Replace => exec.bulk_replace(chunk).await,
                }
            });
        }

        let mut first_err: Option<LoaderError> = None;
        while let Some(joined) = join.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => Err(LoaderError::TaskFailed(join_err.to_string())),
            };
            if let Err(err) = result {
                if first_err.is_none() {
                    first_err = Some(err);
                } else {
                    warn!(error = %err, "discarding secondary batch error");
                }
            }
        }

        if skipped {
            return Err(LoaderError::Cancelled);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Table-batched apply wrapped in the retry driver. The whole pipeline
    /// re-runs on failure, which the merged-replace semantics make safe.
    pub async fn exec_table_batch_retry(
        &self,
        signal: &ShutdownSignal,
        dmls: Vec<Dml>,
        max_attempts: usize,
        backoff: Duration,
    ) -> Result<(), LoaderError> {
        retry_context(signal, max_attempts, backoff, 1, || {
            let exec = self.clone();
            let signal = signal.clone();
            let dmls = dmls.clone();
            async move { exec.exec_table_batch(&signal, dmls).await }
        })
        .await
    }

    /// Apply DMLs one by one inside a single transaction.
    ///
    /// Safe mode rewrites each operation into an idempotent form: updates
    /// become a pre-image delete plus a post-image replace, inserts become
    /// replaces. Used when replaying from an uncertain position.
    ///
    /// Outside safe mode, an update that matches no existing row fails the
    /// batch with [`LoaderError::NoRows`]: the pre-image names a row the
    /// downstream does not have. Deletes are not held to that (a replayed
    /// delete legitimately finds nothing).
    pub async fn single_exec(&self, dmls: &[Dml], safe_mode: bool) -> Result<(), LoaderError> {
        let mut tx = self.begin().await?;
        if let Err(err) = self.run_executor_hooks(&mut tx).await {
            tx.rollback_logged().await;
            return Err(err);
        }

        for dml in dmls {
            let statements: Vec<(String, Vec<mysql_async::Value>)> = match (safe_mode, dml.kind) {
                (true, DmlKind::Update) => vec![dml.delete_sql(), dml.replace_sql()],
                (true, DmlKind::Insert) => vec![dml.replace_sql()],
                _ => vec![dml.sql()],
            };
            for (query, params) in statements {
                match tx.exec(&query, &params).await {
                    Ok(0) if !safe_mode && dml.kind == DmlKind::Update => {
                        error!(
                            table = %dml.qualified_name(),
                            "update matched no rows, downstream row is missing"
                        );
                        tx.rollback_logged().await;
                        return Err(LoaderError::NoRows {
                            table: dml.qualified_name(),
                        });
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tx.rollback_logged().await;
                        return Err(err);
                    }
                }
            }
        }

        tx.commit().await
    }

    /// Single-row apply with per-batch retry and schema-drift recovery.
    ///
    /// Each `batch_size` chunk retries independently. When an attempt fails
    /// with the unknown-column code, the refresher is consulted once per
    /// distinct table, orphan columns are dropped from the affected DMLs
    /// and their layout handles are rebound before the next attempt.
    pub async fn single_exec_retry(
        &self,
        signal: &ShutdownSignal,
        dmls: Vec<Dml>,
        safe_mode: bool,
        max_attempts: usize,
        backoff: Duration,
    ) -> Result<(), LoaderError> {
        let max_attempts = max_attempts.max(1);
        for mut batch in split_dmls(dmls, self.batch_size) {
            for attempt in 1..=max_attempts {
                if signal.is_shutdown() {
                    return Err(LoaderError::Cancelled);
                }
                let err = match self.single_exec(&batch, safe_mode).await {
                    Ok(()) => break,
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(err) => err,
                };
                if err.is_schema_drift() {
                    self.refresh_batch_info(&mut batch).await;
                }
                if attempt == max_attempts {
                    return Err(err);
                }
                warn!(attempt, error = %err, "single exec failed, backing off");
                // Constant interval between attempts.
                tokio::select! {
                    _ = signal.cancelled() => return Err(LoaderError::Cancelled),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }
        }
        Ok(())
    }

    /// Rebind each DML's table layout from the refresher, dropping value
    /// entries for columns that no longer exist. Refresh failures keep the
    /// stale layout; the retry budget decides when to give up.
    async fn refresh_batch_info(&self, batch: &mut [Dml]) {
        let Some(refresher) = &self.refresher else {
            return;
        };
        info!("try refresh table info");
        let mut cache: HashMap<String, Arc<TableInfo>> = HashMap::new();
        for dml in batch.iter_mut() {
            let name = dml.qualified_name();
            let fresh = match cache.get(&name) {
                Some(info) => info.clone(),
                None => match refresher.refresh_table_info(&dml.schema, &dml.table).await {
                    Ok(info) => {
                        let info = Arc::new(info);
                        cache.insert(name.clone(), info.clone());
                        info
                    }
                    Err(err) => {
                        error!(table = %name, error = %err, "fail to refresh table info");
                        continue;
                    }
                },
            };
            if fresh.columns.len() != dml.info.columns.len() {
                info!(
                    table = %name,
                    old = ?dml.info.columns,
                    new = ?fresh.columns,
                    "columns change"
                );
                dml.remove_orphan_columns(&fresh);
            }
            dml.info = fresh;
        }
    }
}

/// Split one merged bucket into per-table chunks of at most `n` rows. The
/// bucket may span tables; each chunk must not, because a multi-row replace
/// targets a single table.
fn split_by_table(dmls: Vec<Dml>, n: usize) -> Vec<Vec<Dml>> {
    let mut by_table: Vec<(String, Vec<Dml>)> = Vec::new();
    for dml in dmls {
        let name = dml.qualified_name();
        match by_table.iter_mut().find(|(table, _)| *table == name) {
            Some((_, list)) => list.push(dml),
            None => by_table.push((name, vec![dml])),
        }
    }
    let mut out = Vec::new();
    for (_, list) in by_table {
        out.extend(split_dmls(list, n));
    }
    out
}
