//! Plugin extension points.
//!
//! Each hook kind is a dedicated capability trait with a fixed signature, so
//! registrations never need downcasting. Registries are read-mostly: hooks
//! are registered at startup and iterated per transaction.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::downstream::Downstream;
use crate::error::LoaderError;
use crate::loopback::LoopbackInfo;
use crate::tx::Tx;
use crate::txn::Txn;

/// Invoked after a transaction begins and before its business statements.
#[async_trait]
pub trait ExecutorExtend: Send + Sync {
    async fn extend_txn(&self, tx: &mut Tx, info: &LoopbackInfo) -> Result<(), LoaderError>;
}

/// Invoked by the loader layer on each upstream transaction before it
/// reaches the executor. Returning `None` drops the transaction.
#[async_trait]
pub trait LoaderExtend: Send + Sync {
    async fn filter_txn(&self, txn: Txn, info: &LoopbackInfo) -> Result<Option<Txn>, LoaderError>;
}

/// Invoked once when the loader starts, before any transaction is applied.
#[async_trait]
pub trait PluginInit: Send + Sync {
    async fn loader_init(
        &self,
        db: &dyn Downstream,
        info: &LoopbackInfo,
    ) -> Result<(), LoaderError>;
}

/// Invoked once when the loader shuts down.
#[async_trait]
pub trait PluginDestroy: Send + Sync {
    async fn loader_destroy(
        &self,
        db: &dyn Downstream,
        info: &LoopbackInfo,
    ) -> Result<(), LoaderError>;
}

/// What to do when an [`ExecutorExtend`] hook fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookPolicy {
    /// Roll the transaction back and surface the hook error.
    Strict,
    /// Log the failure and continue with the transaction.
    #[default]
    Lenient,
    /// Log the failure, count it in metrics, and continue.
    LogOnly,
}

/// Named hook registrations, one list per kind.
#[derive(Default)]
pub struct HookRegistry {
    executor_extend: RwLock<Vec<(String, Arc<dyn ExecutorExtend>)>>,
    loader_extend: RwLock<Vec<(String, Arc<dyn LoaderExtend>)>>,
    init: RwLock<Vec<(String, Arc<dyn PluginInit>)>>,
    destroy: RwLock<Vec<(String, Arc<dyn PluginDestroy>)>>,
}

impl HookRegistry {
    pub fn register_executor_extend(&self, name: impl Into<String>, hook: Arc<dyn ExecutorExtend>) {
        lock_write(&self.executor_extend).push((name.into(), hook));
    }

    pub fn register_loader_extend(&self, name: impl Into<String>, hook: Arc<dyn LoaderExtend>) {
        lock_write(&self.loader_extend).push((name.into(), hook));
    }

    pub fn register_init(&self, name: impl Into<String>, hook: Arc<dyn PluginInit>) {
        lock_write(&self.init).push((name.into(), hook));
    }

    pub fn register_destroy(&self, name: impl Into<String>, hook: Arc<dyn PluginDestroy>) {
        lock_write(&self.destroy).push((name.into(), hook));
    }

    /// Snapshot of the executor-extend chain in registration order.
    pub fn executor_extends(&self) -> Vec<(String, Arc<dyn ExecutorExtend>)> {
        lock_read(&self.executor_extend).clone()
    }

    /// Snapshot of the loader-extend chain in registration order.
    pub fn loader_extends(&self) -> Vec<(String, Arc<dyn LoaderExtend>)> {
        lock_read(&self.loader_extend).clone()
    }

    /// Snapshot of the init chain in registration order.
    pub fn inits(&self) -> Vec<(String, Arc<dyn PluginInit>)> {
        lock_read(&self.init).clone()
    }

    /// Snapshot of the destroy chain in registration order.
    pub fn destroys(&self) -> Vec<(String, Arc<dyn PluginDestroy>)> {
        lock_read(&self.destroy).clone()
    }
}

fn lock_read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn lock_write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
