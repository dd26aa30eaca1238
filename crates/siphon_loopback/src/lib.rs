//! Loopback-sync plugin for bidirectional replication.
//!
//! Outbound side: stamp the mark table inside every applied transaction.
//! Inbound side: drop transactions that carry a mark-table write, because
//! they are this cluster's own changes echoed back by the peer, and trip a
//! fatal error when a transaction's origin address is a configured
//! migration peer, which means writes are travelling in a cycle.

use std::sync::Arc;

use async_trait::async_trait;
use mysql_async::Value;
use tracing::{error, info};

use siphon_loader::{
    quote_mark_table, quote_name, Downstream, ExecutorExtend, LoaderError, LoaderExtend,
    LoopbackInfo, PluginDestroy, PluginInit, Tx, Txn, MARK_ID_COLUMN, MARK_VAL_COLUMN,
};

/// Registration name shared by all four hook kinds.
pub const PLUGIN_NAME: &str = "loopback-sync";

/// The loopback-sync plugin. Stateless; all state lives in
/// [`LoopbackInfo`].
pub struct LoopbackPlugin;

impl LoopbackPlugin {
    /// Register the plugin under every hook kind it implements.
    pub fn register(info: &LoopbackInfo) {
        let plugin = Arc::new(LoopbackPlugin);
        info.hooks
            .register_executor_extend(PLUGIN_NAME, plugin.clone());
        info.hooks.register_loader_extend(PLUGIN_NAME, plugin.clone());
        info.hooks.register_init(PLUGIN_NAME, plugin.clone());
        info.hooks.register_destroy(PLUGIN_NAME, plugin);
    }
}

/// DDL for the mark table: two bigint columns, `id` primary key.
pub fn create_mark_table_sql(name: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({} bigint NOT NULL, {} bigint NOT NULL DEFAULT 0, PRIMARY KEY ({}))",
        quote_mark_table(name),
        quote_name(MARK_ID_COLUMN),
        quote_name(MARK_VAL_COLUMN),
        quote_name(MARK_ID_COLUMN),
    )
}

/// Seed statement for `rows` mark rows, ids `0..rows`.
pub fn seed_mark_rows_sql(name: &str, rows: i64) -> (String, Vec<Value>) {
    let rows = rows.max(1);
    let mut sql = format!(
        "REPLACE INTO {} ({}, {}) VALUES ",
        quote_mark_table(name),
        quote_name(MARK_ID_COLUMN),
        quote_name(MARK_VAL_COLUMN),
    );
    let mut args = Vec::with_capacity((rows as usize) * 2);
    for id in 0..rows {
        if id > 0 {
            sql.push(',');
        }
        sql.push_str("(?,?)");
        args.push(Value::from(id));
        args.push(Value::from(1i64));
    }
    (sql, args)
}

#[async_trait]
impl PluginInit for LoopbackPlugin {
    /// Create the mark table and pre-seed its rows.
    async fn loader_init(
        &self,
        db: &dyn Downstream,
        info: &LoopbackInfo,
    ) -> Result<(), LoaderError> {
        db.exec(&create_mark_table_sql(&info.mark_table_name), &[])
            .await?;
        let (sql, args) = seed_mark_rows_sql(&info.mark_table_name, info.mark_row_count);
        db.exec(&sql, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl PluginDestroy for LoopbackPlugin {
    /// Clear the mark rows on shutdown.
    async fn loader_destroy(
        &self,
        db: &dyn Downstream,
        info: &LoopbackInfo,
    ) -> Result<(), LoaderError> {
        let sql = format!("DELETE FROM {}", quote_mark_table(&info.mark_table_name));
        db.exec(&sql, &[]).await?;
        Ok(())
    }
}

#[async_trait]
impl ExecutorExtend for LoopbackPlugin {
    /// Append the mark update to the open transaction. The row is picked by
    /// the shared counter modulo the seeded row count, which spreads
    /// concurrent workers across rows.
    async fn extend_txn(&self, tx: &mut Tx, info: &LoopbackInfo) -> Result<(), LoaderError> {
        let row = info.next_mark_row(info.mark_row_count);
        tx.set_mark_stamped(true);
        match tx.exec(&info.mark_update_sql(), &[Value::from(row)]).await {
            Ok(0) => {
                tx.set_mark_stamped(false);
                error!(row, "mark update affected zero rows");
                Err(LoaderError::MarkUpdateFailed {
                    reason: "affected rows is zero".into(),
                })
            }
            Ok(_) => Ok(()),
            Err(err) => {
                tx.set_mark_stamped(false);
                error!(row, error = %err, "fail to update mark");
                Err(LoaderError::MarkUpdateFailed {
                    reason: err.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl LoaderExtend for LoopbackPlugin {
    /// Drop echoes and DDL, trip on cyclic origins, and clear the schema of
    /// surviving DMLs so they apply against the connection's default
    /// database on the peer.
    async fn filter_txn(
        &self,
        mut txn: Txn,
        info: &LoopbackInfo,
    ) -> Result<Option<Txn>, LoaderError> {
        if let Some(ddl) = &txn.ddl {
            info!(sql = %ddl.sql, "skip DDL transaction in loopback filter");
            return Ok(None);
        }

        if txn.dmls.iter().any(|dml| info.is_mark_table(&dml.table)) {
            info!(
                events = txn.dmls.len(),
                commit_ts = txn.commit_ts,
                "found loopback mark, dropping echoed transaction"
            );
            return Ok(None);
        }

        if let Some(ip) = &txn.origin_ip {
            for peer in &info.migration_ips {
                if ip.eq_ignore_ascii_case(peer) {
                    error!(
                        commit_ts = txn.commit_ts,
                        txn_ip = %ip,
                        migration_ips = ?info.migration_ips,
                        "Cyclic replication may occur"
                    );
                    return Err(LoaderError::CyclicReplication { ip: ip.clone() });
                }
            }
        }

        for dml in &mut txn.dmls {
            dml.schema.clear();
        }
        Ok(Some(txn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_table_ddl_shape() {
        assert_eq!(
            create_mark_table_sql("repl.mark"),
            "CREATE TABLE IF NOT EXISTS `repl`.`mark` (`id` bigint NOT NULL, \
             `val` bigint NOT NULL DEFAULT 0, PRIMARY KEY (`id`))"
        );
    }

    #[test]
    fn seed_statement_covers_every_row() {
        let (sql, args) = seed_mark_rows_sql("m", 3);
        assert_eq!(sql, "REPLACE INTO `m` (`id`, `val`) VALUES (?,?),(?,?),(?,?)");
        assert_eq!(args.len(), 6);
        assert_eq!(args[0], Value::from(0i64));
        assert_eq!(args[4], Value::from(2i64));
    }

    #[test]
    fn seed_clamps_to_one_row() {
        let (sql, args) = seed_mark_rows_sql("m", 0);
        assert_eq!(sql, "REPLACE INTO `m` (`id`, `val`) VALUES (?,?)");
        assert_eq!(args.len(), 2);
    }
}
