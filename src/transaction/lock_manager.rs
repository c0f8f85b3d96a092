use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::trace;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::{ChalkDBError, ChalkDBResult};
use crate::storage::page::RecordId;
use crate::transaction::transaction::{
    AbortReason, IsolationLevel, TableOid, Transaction, TransactionId, TransactionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentionShared,
    IntentionExclusive,
    SharedIntentionExclusive,
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TransactionId,
    lock_mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TransactionId, lock_mode: LockMode) -> Self {
        Self {
            txn_id,
            lock_mode,
            granted: false,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// At most one in-flight upgrade per queue.
    upgrading: Option<TransactionId>,
}

#[derive(Debug, Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// Strict two-phase locking with hierarchical intention locks.
///
/// Each locked object (table oid or row id) owns a FIFO queue of requests.
/// A request is granted once it is compatible with every granted request
/// and is the first ungranted entry; an upgrade is spliced in front of the
/// ungranted portion instead. Waiters block on the queue's condition
/// variable and re-check their transaction state on every wakeup, so an
/// externally aborted transaction withdraws instead of sleeping forever.
#[derive(Debug, Default)]
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<RecordId, Arc<LockRequestQueue>>>,
}

fn modes_compatible(requested: LockMode, held: LockMode) -> bool {
    match requested {
        LockMode::IntentionShared => !matches!(held, LockMode::Exclusive),
        LockMode::IntentionExclusive => matches!(
            held,
            LockMode::IntentionShared | LockMode::IntentionExclusive
        ),
        LockMode::Shared => matches!(held, LockMode::IntentionShared | LockMode::Shared),
        LockMode::SharedIntentionExclusive => matches!(held, LockMode::IntentionShared),
        LockMode::Exclusive => false,
    }
}

fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
    matches!(
        (held, requested),
        (
            LockMode::IntentionShared,
            LockMode::Shared
                | LockMode::Exclusive
                | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive,
        ) | (
            LockMode::Shared,
            LockMode::Exclusive | LockMode::SharedIntentionExclusive
        ) | (
            LockMode::IntentionExclusive,
            LockMode::Exclusive | LockMode::SharedIntentionExclusive
        ) | (LockMode::SharedIntentionExclusive, LockMode::Exclusive)
    )
}

/// Grant rule: compatible with every other granted request, and first in
/// line among the ungranted.
fn can_grant(requests: &VecDeque<LockRequest>, txn_id: TransactionId) -> bool {
    let me = requests
        .iter()
        .find(|r| r.txn_id == txn_id)
        .expect("waiting request must be queued");
    for request in requests {
        if request.granted {
            if request.txn_id != txn_id && !modes_compatible(me.lock_mode, request.lock_mode) {
                return false;
            }
        } else {
            return request.txn_id == txn_id;
        }
    }
    false
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a table lock. Blocks until granted; returns false if the
    /// transaction was aborted while waiting.
    pub fn lock_table(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
    ) -> ChalkDBResult<bool> {
        self.check_admissible(txn, mode)?;

        let queue = self.table_queue(oid);
        let state = queue.state.lock();
        let (granted, upgraded_from) = self.acquire(&queue, state, txn, mode)?;
        // The old mode was relinquished when the upgrade entered the queue,
        // whether or not the new one was ultimately granted.
        if let Some(old_mode) = upgraded_from {
            txn.remove_table_lock(old_mode, oid);
            trace!(
                "txn {} upgraded table {} lock {:?} -> {:?}",
                txn.id(),
                oid,
                old_mode,
                mode
            );
        }
        if granted {
            txn.add_table_lock(mode, oid);
        }
        Ok(granted)
    }

    /// Release a table lock, enforcing that row locks go first.
    pub fn unlock_table(&self, txn: &Transaction, oid: TableOid) -> ChalkDBResult<bool> {
        let queue = self.table_lock_map.lock().get(&oid).cloned();
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.holds_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mut state = queue.state.lock();
        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mode = state.requests[pos].lock_mode;
        state.requests.remove(pos);
        queue.cv.notify_all();
        drop(state);

        if unlock_triggers_shrinking(txn.isolation_level(), mode) {
            txn.begin_shrinking();
        }
        txn.remove_table_lock(mode, oid);
        Ok(true)
    }

    /// Acquire a row lock (S or X only). The transaction must already hold
    /// an appropriate lock on the owning table.
    pub fn lock_row(
        &self,
        txn: &Transaction,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> ChalkDBResult<bool> {
        if matches!(
            mode,
            LockMode::IntentionShared | LockMode::IntentionExclusive | LockMode::SharedIntentionExclusive
        ) {
            return Err(self.abort(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_admissible(txn, mode)?;

        match mode {
            LockMode::Exclusive => {
                if !txn.holds_table_lock(LockMode::Exclusive, oid)
                    && !txn.holds_table_lock(LockMode::IntentionExclusive, oid)
                    && !txn.holds_table_lock(LockMode::SharedIntentionExclusive, oid)
                {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            LockMode::Shared => {
                if !txn.holds_any_table_lock(oid) {
                    return Err(self.abort(txn, AbortReason::TableLockNotPresent));
                }
            }
            _ => unreachable!(),
        }

        let queue = self.row_queue(rid);
        let state = queue.state.lock();
        let (granted, upgraded_from) = self.acquire(&queue, state, txn, mode)?;
        if let Some(old_mode) = upgraded_from {
            txn.remove_row_lock(old_mode, oid, rid);
        }
        if granted {
            txn.add_row_lock(mode, oid, rid);
        }
        Ok(granted)
    }

    /// Release a row lock.
    pub fn unlock_row(
        &self,
        txn: &Transaction,
        oid: TableOid,
        rid: RecordId,
    ) -> ChalkDBResult<bool> {
        let queue = self.row_lock_map.lock().get(&rid).cloned();
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut state = queue.state.lock();
        let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn_id == txn.id() && r.granted)
        else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let mode = state.requests[pos].lock_mode;
        state.requests.remove(pos);
        queue.cv.notify_all();
        drop(state);

        if unlock_triggers_shrinking(txn.isolation_level(), mode) {
            txn.begin_shrinking();
        }
        txn.remove_row_lock(mode, oid, rid);
        Ok(true)
    }

    /// Abort hook: mark the transaction aborted and wake every waiter so
    /// its blocked requests withdraw. Victim selection policy lives with
    /// the caller.
    pub fn abort_victim(&self, txn: &Transaction) {
        txn.set_state(TransactionState::Aborted);
        for queue in self.table_lock_map.lock().values() {
            let _state = queue.state.lock();
            queue.cv.notify_all();
        }
        for queue in self.row_lock_map.lock().values() {
            let _state = queue.state.lock();
            queue.cv.notify_all();
        }
    }

    /// Drop every lock the transaction still holds (rows before tables),
    /// bypassing 2PL transitions. Used at commit/abort.
    pub fn release_all_locks(&self, txn: &Transaction) {
        for (mode, oid, rid) in txn.row_locks_snapshot() {
            if let Some(queue) = self.row_lock_map.lock().get(&rid).cloned() {
                let mut state = queue.state.lock();
                state
                    .requests
                    .retain(|r| !(r.txn_id == txn.id() && r.granted));
                queue.cv.notify_all();
            }
            txn.remove_row_lock(mode, oid, rid);
        }
        for (mode, oid) in txn.table_locks_snapshot() {
            if let Some(queue) = self.table_lock_map.lock().get(&oid).cloned() {
                let mut state = queue.state.lock();
                state
                    .requests
                    .retain(|r| !(r.txn_id == txn.id() && r.granted));
                queue.cv.notify_all();
            }
            txn.remove_table_lock(mode, oid);
        }
    }

    /// Queue a request (or an upgrade of the transaction's existing one)
    /// and block until the grant rule admits it. Returns whether the lock
    /// was granted and, for upgrades, the mode that was given up.
    fn acquire<'a>(
        &self,
        queue: &'a LockRequestQueue,
        mut state: MutexGuard<'a, QueueState>,
        txn: &Transaction,
        mode: LockMode,
    ) -> ChalkDBResult<(bool, Option<LockMode>)> {
        let mut upgraded_from = None;

        if let Some(pos) = state.requests.iter().position(|r| r.txn_id == txn.id()) {
            let held_mode = state.requests[pos].lock_mode;
            if held_mode == mode {
                return Ok((true, None));
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(held_mode, mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            // Drop the old request and splice the upgrade in front of the
            // first ungranted entry.
            state.requests.remove(pos);
            let insert_at = state
                .requests
                .iter()
                .position(|r| !r.granted)
                .unwrap_or(state.requests.len());
            state
                .requests
                .insert(insert_at, LockRequest::new(txn.id(), mode));
            state.upgrading = Some(txn.id());
            upgraded_from = Some(held_mode);
        } else {
            state.requests.push_back(LockRequest::new(txn.id(), mode));
        }

        loop {
            if can_grant(&state.requests, txn.id()) {
                break;
            }
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                state.requests.retain(|r| r.txn_id != txn.id());
                if state.upgrading == Some(txn.id()) {
                    state.upgrading = None;
                }
                queue.cv.notify_all();
                return Ok((false, upgraded_from));
            }
        }

        if let Some(request) = state.requests.iter_mut().find(|r| r.txn_id == txn.id()) {
            request.granted = true;
        }
        if state.upgrading == Some(txn.id()) {
            state.upgrading = None;
        }
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok((true, upgraded_from))
    }

    /// Isolation-level admission checks of the 2PL protocol.
    fn check_admissible(&self, txn: &Transaction, mode: LockMode) -> ChalkDBResult<()> {
        let shrinking = txn.state() == TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(
                    mode,
                    LockMode::Shared
                        | LockMode::IntentionShared
                        | LockMode::SharedIntentionExclusive
                ) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking && !matches!(mode, LockMode::IntentionShared | LockMode::Shared) {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    fn abort(&self, txn: &Transaction, reason: AbortReason) -> ChalkDBError {
        txn.set_state(TransactionState::Aborted);
        ChalkDBError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        self.table_lock_map
            .lock()
            .entry(oid)
            .or_default()
            .clone()
    }

    fn row_queue(&self, rid: RecordId) -> Arc<LockRequestQueue> {
        self.row_lock_map.lock().entry(rid).or_default().clone()
    }

    /// True when two granted requests on `oid`'s queue would conflict;
    /// exposed for invariant checks in tests.
    #[cfg(test)]
    fn table_queue_grants(&self, oid: TableOid) -> Vec<(TransactionId, LockMode)> {
        let queue = self.table_queue(oid);
        let state = queue.state.lock();
        state
            .requests
            .iter()
            .filter(|r| r.granted)
            .map(|r| (r.txn_id, r.lock_mode))
            .collect()
    }
}

fn unlock_triggers_shrinking(level: IsolationLevel, mode: LockMode) -> bool {
    match level {
        IsolationLevel::RepeatableRead => {
            matches!(mode, LockMode::Shared | LockMode::Exclusive)
        }
        IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
            mode == LockMode::Exclusive
        }
    }
}
