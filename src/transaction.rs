//! In-flight request/response bookkeeping.
//!
//! One table per connection, shared by the connection and all of its
//! sessions and handles. Every entry records the owner that registered it;
//! closes with a mismatched owner are silently ignored so a misrouted
//! response can never settle another level's transaction. Removal from the
//! table is the settle point, which makes every close idempotent.

use crate::errors::Error;
use crate::telemetry;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub(crate) type TxResult = Result<Value, Error>;

/// Identity of a transaction owner (connection, session or handle). Each
/// object draws a fresh id at construction, so equality here is reference
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct OwnerId(u64);

impl OwnerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

struct Pending {
    owner: OwnerId,
    request: String,
    done: oneshot::Sender<TxResult>,
    timeout: Option<JoinHandle<()>>,
}

type Table = Arc<Mutex<HashMap<String, Pending>>>;

pub(crate) struct TransactionManager {
    table: Table,
    debug_task: Option<JoinHandle<()>>,
}

impl TransactionManager {
    pub(crate) fn new() -> Self {
        let table: Table = Arc::new(Mutex::new(HashMap::new()));
        let debug_task = if telemetry::debug_tx_enabled()
            && tokio::runtime::Handle::try_current().is_ok()
        {
            let weak = Arc::downgrade(&table);
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    ticker.tick().await;
                    let Some(table) = weak.upgrade() else { break };
                    let size = table.lock().unwrap().len();
                    debug!(target = "transaction", size, "pending transactions");
                }
            }))
        } else {
            None
        };
        Self { table, debug_task }
    }

    /// Register a transaction. Returns `None` when the id is already taken,
    /// in which case the caller sends without re-registering and the
    /// original registrant keeps ownership of the response.
    pub(crate) fn create(
        &self,
        id: &str,
        owner: OwnerId,
        request: &str,
        timeout_ms: u64,
    ) -> Option<oneshot::Receiver<TxResult>> {
        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.table.lock().unwrap();
            if table.contains_key(id) {
                return None;
            }
            table.insert(
                id.to_string(),
                Pending {
                    owner,
                    request: request.to_string(),
                    done: tx,
                    timeout: None,
                },
            );
        }
        trace!(target = "transaction", id, request, "transaction created");

        if timeout_ms > 0 {
            let table = Arc::clone(&self.table);
            let tid = id.to_string();
            let timer = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                let expired = table.lock().unwrap().remove(&tid);
                if let Some(pending) = expired {
                    debug!(target = "transaction", id = %tid, "transaction timed out");
                    let _ = pending.done.send(Err(Error::TransactionTimeout));
                }
            });
            let mut table = self.table.lock().unwrap();
            match table.get_mut(id) {
                Some(pending) => pending.timeout = Some(timer),
                // Settled between insert and re-lock.
                None => timer.abort(),
            }
        }
        Some(rx)
    }

    pub(crate) fn owner_of(&self, id: &str) -> Option<OwnerId> {
        self.table.lock().unwrap().get(id).map(|p| p.owner)
    }

    pub(crate) fn request_of(&self, id: &str) -> Option<String> {
        self.table.lock().unwrap().get(id).map(|p| p.request.clone())
    }

    pub(crate) fn close_with_success(&self, id: &str, owner: OwnerId, data: Value) {
        if let Some(pending) = self.take(id, owner) {
            if let Some(timer) = pending.timeout {
                timer.abort();
            }
            let _ = pending.done.send(Ok(data));
        }
    }

    pub(crate) fn close_with_error(&self, id: &str, owner: OwnerId, err: Error) {
        if let Some(pending) = self.take(id, owner) {
            if let Some(timer) = pending.timeout {
                timer.abort();
            }
            let _ = pending.done.send(Err(err));
        }
    }

    /// Close every transaction of `owner` (or all of them) with a freshly
    /// built error.
    pub(crate) fn close_all_with_error<F>(&self, owner: Option<OwnerId>, make_err: F)
    where
        F: Fn() -> Error,
    {
        let drained: Vec<Pending> = {
            let mut table = self.table.lock().unwrap();
            match owner {
                Some(owner) => {
                    let ids: Vec<String> = table
                        .iter()
                        .filter(|(_, p)| p.owner == owner)
                        .map(|(id, _)| id.clone())
                        .collect();
                    ids.into_iter().filter_map(|id| table.remove(&id)).collect()
                }
                None => table.drain().map(|(_, p)| p).collect(),
            }
        };
        for pending in drained {
            if let Some(timer) = pending.timeout {
                timer.abort();
            }
            let _ = pending.done.send(Err(make_err()));
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// Drop everything, disarming timers and the debug task. Outstanding
    /// receivers observe the dropped sender.
    pub(crate) fn clear(&self) {
        if let Some(task) = &self.debug_task {
            task.abort();
        }
        let drained: Vec<Pending> = self.table.lock().unwrap().drain().map(|(_, p)| p).collect();
        for pending in drained {
            if let Some(timer) = pending.timeout {
                timer.abort();
            }
        }
    }

    fn take(&self, id: &str, owner: OwnerId) -> Option<Pending> {
        let mut table = self.table.lock().unwrap();
        match table.get(id) {
            Some(pending) if pending.owner == owner => table.remove(id),
            Some(_) => {
                trace!(target = "transaction", id, "close with mismatched owner ignored");
                None
            }
            None => None,
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn close_with_success_settles_once() {
        let tm = TransactionManager::new();
        let owner = OwnerId::next();
        let rx = tm.create("1", owner, "create", 0).unwrap();

        tm.close_with_success("1", owner, json!({ "ok": true }));
        // Second close of the same id is a no-op.
        tm.close_with_error("1", owner, Error::ConnectionClosed);

        let result = rx.await.unwrap();
        assert_eq!(result.unwrap()["ok"], true);
        assert_eq!(tm.len(), 0);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let tm = TransactionManager::new();
        let owner = OwnerId::next();
        let _rx = tm.create("1", owner, "create", 0).unwrap();
        assert!(tm.create("1", OwnerId::next(), "create", 0).is_none());
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn mismatched_owner_is_a_noop() {
        let tm = TransactionManager::new();
        let owner = OwnerId::next();
        let intruder = OwnerId::next();
        let mut rx = tm.create("1", owner, "keepalive", 0).unwrap();

        tm.close_with_success("1", intruder, json!({}));
        tm.close_with_error("1", intruder, Error::ConnectionClosed);
        assert!(rx.try_recv().is_err());
        assert_eq!(tm.owner_of("1"), Some(owner));
        assert_eq!(tm.request_of("1").as_deref(), Some("keepalive"));
    }

    #[tokio::test]
    async fn timeout_fails_the_transaction() {
        let tm = TransactionManager::new();
        let owner = OwnerId::next();
        let rx = tm.create("1", owner, "keepalive", 20).unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::TransactionTimeout)));
        assert_eq!(tm.len(), 0);
    }

    #[tokio::test]
    async fn close_disarms_the_timeout() {
        let tm = TransactionManager::new();
        let owner = OwnerId::next();
        let rx = tm.create("1", owner, "message", 50).unwrap();

        tm.close_with_success("1", owner, json!({}));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_all_filters_by_owner() {
        let tm = TransactionManager::new();
        let mine = OwnerId::next();
        let other = OwnerId::next();
        let rx_mine = tm.create("1", mine, "message", 0).unwrap();
        let mut rx_other = tm.create("2", other, "message", 0).unwrap();

        tm.close_all_with_error(Some(mine), || Error::SessionDestroyed);
        assert!(matches!(rx_mine.await.unwrap(), Err(Error::SessionDestroyed)));
        assert!(rx_other.try_recv().is_err());
        assert_eq!(tm.len(), 1);

        tm.close_all_with_error(None, || Error::ConnectionClosed);
        assert!(matches!(rx_other.await.unwrap(), Err(Error::ConnectionClosed)));
        assert_eq!(tm.len(), 0);
    }
}
