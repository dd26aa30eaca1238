//! Thin wrapper around a downstream transaction.
//!
//! Every statement is timed into the query metrics and failures are logged
//! with the offending query before the error propagates. The wrapper is
//! consumed by `commit` or `rollback`, so a transaction cannot leak past its
//! terminal state.

use std::sync::Arc;
use std::time::Instant;

use mysql_async::Value;
use tracing::error;

use crate::downstream::DownstreamTx;
use crate::error::LoaderError;
use crate::metrics::{QueryLabel, QueryMetrics};

/// One open downstream transaction with metrics attached.
pub struct Tx {
    inner: Box<dyn DownstreamTx>,
    metrics: Option<Arc<QueryMetrics>>,
    mark_stamped: bool,
}

impl Tx {
    pub(crate) fn new(inner: Box<dyn DownstreamTx>, metrics: Option<Arc<QueryMetrics>>) -> Self {
        Self {
            inner,
            metrics,
            mark_stamped: false,
        }
    }

    /// Execute one statement under the `exec` label, returning the
    /// affected-row count.
    pub async fn exec(&mut self, query: &str, params: &[Value]) -> Result<u64, LoaderError> {
        self.exec_labeled(QueryLabel::Exec, query, params).await
    }

    pub(crate) async fn exec_labeled(
        &mut self,
        label: QueryLabel,
        query: &str,
        params: &[Value],
    ) -> Result<u64, LoaderError> {
        let start = Instant::now();
        let result = self.inner.exec(query, params).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe(label, start.elapsed());
        }
        if let Err(err) = &result {
            error!(query, args = ?params, error = %err, "exec fail");
        }
        result
    }

    /// Commit the transaction, timed under the `commit` label.
    pub async fn commit(self) -> Result<(), LoaderError> {
        let start = Instant::now();
        let result = self.inner.commit().await;
        if let Some(metrics) = &self.metrics {
            metrics.observe(QueryLabel::Commit, start.elapsed());
        }
        result
    }

    /// Roll the transaction back.
    pub async fn rollback(self) -> Result<(), LoaderError> {
        self.inner.rollback().await
    }

    /// Roll back and log instead of propagating the rollback error, for
    /// paths that are already failing with a more interesting error.
    pub(crate) async fn rollback_logged(self) {
        if let Err(err) = self.inner.rollback().await {
            error!(error = %err, "fail to rollback");
        }
    }

    /// True once the loopback mark update was appended to this transaction.
    pub fn mark_stamped(&self) -> bool {
        self.mark_stamped
    }

    /// Record whether the mark update is part of this transaction.
    pub fn set_mark_stamped(&mut self, stamped: bool) {
        self.mark_stamped = stamped;
    }
}
