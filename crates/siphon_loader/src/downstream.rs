//! Seam between the executor and the downstream SQL server.
//!
//! The executor talks to [`Downstream`] and [`DownstreamTx`] only, never to
//! the driver directly. [`MysqlDownstream`] is the production implementation
//! over a `mysql_async` connection pool; tests substitute an in-memory fake.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{Params, Pool, TxOpts, Value};

use crate::config::DbConfig;
use crate::error::LoaderError;

/// One open downstream transaction.
#[async_trait]
pub trait DownstreamTx: Send {
    /// Execute one statement, returning the affected-row count.
    async fn exec(&mut self, query: &str, params: &[Value]) -> Result<u64, LoaderError>;

    /// Commit and release the connection.
    async fn commit(self: Box<Self>) -> Result<(), LoaderError>;

    /// Roll back and release the connection.
    async fn rollback(self: Box<Self>) -> Result<(), LoaderError>;
}

/// Handle to the downstream server.
#[async_trait]
pub trait Downstream: Send + Sync {
    /// Open a new transaction on a pooled connection.
    async fn begin(&self) -> Result<Box<dyn DownstreamTx>, LoaderError>;

    /// Execute one autocommit statement, for provisioning paths that do not
    /// need transactional grouping.
    async fn exec(&self, query: &str, params: &[Value]) -> Result<u64, LoaderError>;
}

/// `mysql_async`-backed downstream.
#[derive(Clone)]
pub struct MysqlDownstream {
    pool: Pool,
}

impl MysqlDownstream {
    /// Wrap an existing pool.
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from the connection config.
    pub fn connect(cfg: &DbConfig) -> Self {
        Self {
            pool: Pool::new(cfg.to_opts()),
        }
    }

    /// Disconnect the pool, waiting for pooled connections to close.
    pub async fn disconnect(self) -> Result<(), LoaderError> {
        self.pool.disconnect().await.map_err(map_mysql_err)
    }
}

#[async_trait]
impl Downstream for MysqlDownstream {
    async fn begin(&self) -> Result<Box<dyn DownstreamTx>, LoaderError> {
        let tx = self
            .pool
            .start_transaction(TxOpts::default())
            .await
            .map_err(map_mysql_err)?;
        Ok(Box::new(MysqlTx { tx }))
    }

    async fn exec(&self, query: &str, params: &[Value]) -> Result<u64, LoaderError> {
        let mut conn = self.pool.get_conn().await.map_err(map_mysql_err)?;
        if params.is_empty() {
            conn.query_drop(query).await.map_err(map_mysql_err)?;
        } else {
            conn.exec_drop(query, Params::Positional(params.to_vec()))
                .await
                .map_err(map_mysql_err)?;
        }
        Ok(conn.affected_rows())
    }
}

struct MysqlTx {
    tx: mysql_async::Transaction<'static>,
}

#[async_trait]
impl DownstreamTx for MysqlTx {
    async fn exec(&mut self, query: &str, params: &[Value]) -> Result<u64, LoaderError> {
        if params.is_empty() {
            self.tx.query_drop(query).await.map_err(map_mysql_err)?;
        } else {
            self.tx
                .exec_drop(query, Params::Positional(params.to_vec()))
                .await
                .map_err(map_mysql_err)?;
        }
        Ok(self.tx.affected_rows())
    }

    async fn commit(self: Box<Self>) -> Result<(), LoaderError> {
        self.tx.commit().await.map_err(map_mysql_err)
    }

    async fn rollback(self: Box<Self>) -> Result<(), LoaderError> {
        self.tx.rollback().await.map_err(map_mysql_err)
    }
}

/// Lift driver errors into [`LoaderError`], keeping the numeric server code
/// visible for classification.
fn map_mysql_err(err: mysql_async::Error) -> LoaderError {
    match err {
        mysql_async::Error::Server(server) => LoaderError::Server {
            code: server.code,
            message: server.message,
        },
        other => LoaderError::Downstream(other),
    }
}
