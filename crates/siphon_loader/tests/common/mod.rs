//! Shared helpers for integration tests: an in-memory downstream that
//! records every transaction event and can script failures.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use mysql_async::Value;
use siphon_loader::{Downstream, DownstreamTx, LoaderError, ShutdownHandle};

/// One observed downstream event, in global order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Begin(usize),
    Stmt {
        tx: usize,
        query: String,
        params: Vec<Value>,
    },
    Commit(usize),
    Rollback(usize),
    Autocommit {
        query: String,
        params: Vec<Value>,
    },
}

/// A failure to inject into the next statement whose query contains
/// `substring`.
struct ScriptedFailure {
    substring: String,
    code: u16,
}

#[derive(Default)]
struct FakeState {
    next_tx: usize,
    begin_count: usize,
    events: Vec<Event>,
    failures: VecDeque<ScriptedFailure>,
    /// Statements matching this substring report zero affected rows.
    zero_rows_matching: Option<String>,
    /// Fire this shutdown handle when the nth begin happens.
    shutdown_on_begin: Option<(usize, ShutdownHandle)>,
}

impl FakeState {
    fn exec(&mut self, tx: Option<usize>, query: &str, params: &[Value]) -> Result<u64, LoaderError> {
        if let Some(pos) = self
            .failures
            .iter()
            .position(|f| query.contains(&f.substring))
        {
            let failure = self.failures.remove(pos).expect("position just found");
            return Err(LoaderError::Server {
                code: failure.code,
                message: format!("scripted failure for `{}`", failure.substring),
            });
        }

        let affected = match &self.zero_rows_matching {
            Some(sub) if query.contains(sub) => 0,
            _ => 1,
        };

        match tx {
            Some(tx) => self.events.push(Event::Stmt {
                tx,
                query: query.to_string(),
                params: params.to_vec(),
            }),
            None => self.events.push(Event::Autocommit {
                query: query.to_string(),
                params: params.to_vec(),
            }),
        }
        Ok(affected)
    }
}

/// In-memory stand-in for the downstream server.
#[derive(Clone, Default)]
pub struct FakeDownstream {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDownstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inject a one-shot server error for the next statement containing
    /// `substring`.
    pub fn fail_next(&self, substring: &str, code: u16) {
        self.lock().failures.push_back(ScriptedFailure {
            substring: substring.to_string(),
            code,
        });
    }

    /// Make statements containing `substring` report zero affected rows.
    pub fn zero_rows_for(&self, substring: &str) {
        self.lock().zero_rows_matching = Some(substring.to_string());
    }

    /// Signal `handle` when the nth transaction begins (1-based).
    pub fn shutdown_on_begin(&self, nth: usize, handle: ShutdownHandle) {
        self.lock().shutdown_on_begin = Some((nth, handle));
    }

    pub fn events(&self) -> Vec<Event> {
        self.lock().events.clone()
    }

    pub fn begin_count(&self) -> usize {
        self.lock().begin_count
    }

    /// Every begun transaction reached commit or rollback.
    pub fn all_txs_terminal(&self) -> bool {
        let events = self.events();
        let begun: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                Event::Begin(id) => Some(*id),
                _ => None,
            })
            .collect();
        begun.iter().all(|id| {
            events
                .iter()
                .any(|e| matches!(e, Event::Commit(i) | Event::Rollback(i) if i == id))
        })
    }

    /// Queries of statements that ran inside transactions which committed,
    /// in event order.
    pub fn committed_queries(&self) -> Vec<String> {
        let events = self.events();
        let committed: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                Event::Commit(id) => Some(*id),
                _ => None,
            })
            .collect();
        events
            .iter()
            .filter_map(|e| match e {
                Event::Stmt { tx, query, .. } if committed.contains(tx) => Some(query.clone()),
                _ => None,
            })
            .collect()
    }

    /// Index of the first event matching `pred`, if any.
    pub fn find_event(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.events().iter().position(pred)
    }
}

#[async_trait]
impl Downstream for FakeDownstream {
    async fn begin(&self) -> Result<Box<dyn DownstreamTx>, LoaderError> {
        let id = {
            let mut state = self.lock();
            let id = state.next_tx;
            state.next_tx += 1;
            state.begin_count += 1;
            state.events.push(Event::Begin(id));
            let fire = matches!(
                &state.shutdown_on_begin,
                Some((nth, _)) if state.begin_count >= *nth
            );
            if fire {
                if let Some((_, handle)) = state.shutdown_on_begin.take() {
                    handle.shutdown();
                }
            }
            id
        };
        Ok(Box::new(FakeTx {
            id,
            state: self.state.clone(),
        }))
    }

    async fn exec(&self, query: &str, params: &[Value]) -> Result<u64, LoaderError> {
        self.lock().exec(None, query, params)
    }
}

struct FakeTx {
    id: usize,
    state: Arc<Mutex<FakeState>>,
}

impl FakeTx {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DownstreamTx for FakeTx {
    async fn exec(&mut self, query: &str, params: &[Value]) -> Result<u64, LoaderError> {
        let id = self.id;
        self.lock().exec(Some(id), query, params)
    }

    async fn commit(self: Box<Self>) -> Result<(), LoaderError> {
        let id = self.id;
        self.lock().events.push(Event::Commit(id));
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), LoaderError> {
        let id = self.id;
        self.lock().events.push(Event::Rollback(id));
        Ok(())
    }
}
