use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::transaction::lock_manager::LockManager;
use crate::transaction::transaction::{
    IsolationLevel, Transaction, TransactionId, TransactionState,
};

/// Hands out transaction ids and drives the lifecycle: GROWING at begin,
/// terminal at commit/abort. Ending a transaction releases every lock it
/// still holds (rows before their tables) and wakes the waiters.
#[derive(Debug)]
pub struct TransactionManager {
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicU64,
    active: Mutex<HashMap<TransactionId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            lock_manager,
            next_txn_id: AtomicU64::new(1),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.lock_manager.clone()
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.active.lock().insert(id, txn.clone());
        debug!("txn {} started at {:?}", id, isolation_level);
        txn
    }

    pub fn get_transaction(&self, txn_id: TransactionId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }

    pub fn commit(&self, txn: &Transaction) {
        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.active.lock().remove(&txn.id());
        debug!("txn {} committed", txn.id());
    }

    pub fn abort(&self, txn: &Transaction) {
        // Mark aborted and wake any of the transaction's blocked requests
        // before tearing its held locks down.
        self.lock_manager.abort_victim(txn);
        self.lock_manager.release_all_locks(txn);
        self.active.lock().remove(&txn.id());
        debug!("txn {} aborted", txn.id());
    }
}
