use std::collections::{HashMap, HashSet};
use std::fmt;

use parking_lot::Mutex;

use crate::storage::page::RecordId;
use crate::transaction::lock_manager::LockMode;

pub type TransactionId = u64;
pub type TableOid = u64;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager aborted a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    LockSharedOnReadUncommitted,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeUnlockingRows,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under READ UNCOMMITTED"
            }
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "lock upgrade is incompatible",
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock without a held lock",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked before its row locks"
            }
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock without the required table lock",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

#[derive(Debug)]
struct TransactionInner {
    state: TransactionState,
    locks: LockSets,
}

/// A transaction as the lock manager sees it: identity, isolation level,
/// 2PL state, and the bags of locks it currently holds. The bags live
/// behind one mutex and are only reachable through the `add`/`remove`/
/// `holds` surface below.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    inner: Mutex<TransactionInner>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Growing,
                locks: LockSets::default(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: TransactionState) {
        self.inner.lock().state = state;
    }

    /// Move to SHRINKING unless the transaction already reached a terminal
    /// state.
    pub(crate) fn begin_shrinking(&self) {
        let mut inner = self.inner.lock();
        if matches!(
            inner.state,
            TransactionState::Growing | TransactionState::Shrinking
        ) {
            inner.state = TransactionState::Shrinking;
        }
    }

    pub fn add_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.inner.lock().locks.table_set(mode).insert(oid);
    }

    pub fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.inner.lock().locks.table_set(mode).remove(&oid);
    }

    pub fn holds_table_lock(&self, mode: LockMode, oid: TableOid) -> bool {
        self.inner.lock().locks.table_set(mode).contains(&oid)
    }

    pub fn holds_any_table_lock(&self, oid: TableOid) -> bool {
        let mut inner = self.inner.lock();
        [
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::Shared,
            LockMode::SharedIntentionExclusive,
            LockMode::Exclusive,
        ]
        .into_iter()
        .any(|mode| inner.locks.table_set(mode).contains(&oid))
    }

    pub fn add_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut inner = self.inner.lock();
        let rows = match mode {
            LockMode::Shared => &mut inner.locks.shared_rows,
            LockMode::Exclusive => &mut inner.locks.exclusive_rows,
            _ => panic!("row locks only come in S and X"),
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut inner = self.inner.lock();
        let rows = match mode {
            LockMode::Shared => &mut inner.locks.shared_rows,
            LockMode::Exclusive => &mut inner.locks.exclusive_rows,
            _ => panic!("row locks only come in S and X"),
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&oid);
            }
        }
    }

    pub fn holds_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) -> bool {
        let inner = self.inner.lock();
        let rows = match mode {
            LockMode::Shared => &inner.locks.shared_rows,
            LockMode::Exclusive => &inner.locks.exclusive_rows,
            _ => return false,
        };
        rows.get(&oid).is_some_and(|set| set.contains(&rid))
    }

    /// Does the transaction still hold any row lock on this table?
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let inner = self.inner.lock();
        inner
            .locks
            .shared_rows
            .get(&oid)
            .is_some_and(|set| !set.is_empty())
            || inner
                .locks
                .exclusive_rows
                .get(&oid)
                .is_some_and(|set| !set.is_empty())
    }

    /// Snapshot of every held table lock, for release on commit/abort.
    pub fn table_locks_snapshot(&self) -> Vec<(LockMode, TableOid)> {
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        for mode in [
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::Shared,
            LockMode::SharedIntentionExclusive,
            LockMode::Exclusive,
        ] {
            out.extend(inner.locks.table_set(mode).iter().map(|oid| (mode, *oid)));
        }
        out
    }

    /// Snapshot of every held row lock, for release on commit/abort.
    pub fn row_locks_snapshot(&self) -> Vec<(LockMode, TableOid, RecordId)> {
        let inner = self.inner.lock();
        let mut out = Vec::new();
        for (oid, rows) in inner.locks.shared_rows.iter() {
            out.extend(rows.iter().map(|rid| (LockMode::Shared, *oid, *rid)));
        }
        for (oid, rows) in inner.locks.exclusive_rows.iter() {
            out.extend(rows.iter().map(|rid| (LockMode::Exclusive, *oid, *rid)));
        }
        out
    }
}
