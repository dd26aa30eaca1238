//! Upstream transaction envelope and the loader-side filter chain.

use tracing::debug;

use crate::dml::Dml;
use crate::error::LoaderError;
use crate::loopback::LoopbackInfo;

/// A schema change carried by an upstream transaction. The executor never
/// applies these; the caller serializes DDL through its own path.
#[derive(Debug, Clone)]
pub struct DdlEvent {
    pub schema: String,
    pub table: String,
    pub sql: String,
}

/// One upstream transaction as delivered by the translator.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub dmls: Vec<Dml>,
    pub ddl: Option<DdlEvent>,
    /// Address of the cluster the transaction originated from.
    pub origin_ip: Option<String>,
    /// Upstream commit timestamp, for logging and checkpoint callbacks.
    pub commit_ts: u64,
}

impl Txn {
    pub fn with_dmls(dmls: Vec<Dml>) -> Self {
        Self {
            dmls,
            ..Self::default()
        }
    }
}

/// Run the registered loader-extend chain over `txn`.
///
/// Hooks run in registration order; the first hook that returns `None`
/// drops the transaction. Hook errors abort the chain and propagate, since
/// applying an unfiltered transaction could replay an echo.
pub async fn filter_txn(txn: Txn, info: &LoopbackInfo) -> Result<Option<Txn>, LoaderError> {
    let mut current = txn;
    for (name, hook) in info.hooks.loader_extends() {
        match hook.filter_txn(current, info).await? {
            Some(txn) => current = txn,
            None => {
                debug!(hook = %name, "transaction dropped by filter");
                return Ok(None);
            }
        }
    }
    Ok(Some(current))
}
