//! Persistence seam for the lending core.
//!
//! Every operation runs inside one [`StoreTx`]: the components issue their
//! reads and writes against the transaction and then hand it to [`finish`],
//! which commits on success and rolls back on any error. A transaction is
//! opened with a [`LockScope`] that serializes competing writers for the same
//! cart or holding.

mod memory;
mod postgres;

pub use memory::{MemoryStore, MemoryTx};
pub use postgres::{run_migrations, DbPool, PgStore, PgTx, MIGRATIONS};

use async_trait::async_trait;
use shared::*;
use tracing::warn;

/// What a transaction must exclude concurrent writers from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LockScope {
    /// Projections; no lock beyond the store's isolation.
    Read,
    /// A user's pending selections (add/decrease/remove/checkout).
    Cart(UserId),
    /// A user's ledger history for one item (returns).
    Holding(UserId, ItemId),
}

impl LockScope {
    /// Key for a transaction-scoped advisory lock, if the scope needs one.
    /// Collisions only over-serialize.
    pub fn advisory_key(&self) -> Option<i64> {
        match self {
            LockScope::Read => None,
            LockScope::Cart(user) => Some(fold_uuid(&user.0)),
            LockScope::Holding(user, item) => {
                Some(fold_uuid(&user.0) ^ fold_uuid(&item.0).rotate_left(17))
            }
        }
    }
}

fn fold_uuid(id: &uuid::Uuid) -> i64 {
    let bits = id.as_u128();
    ((bits >> 64) as u64 ^ bits as u64) as i64
}

#[async_trait]
pub trait LendingStore: Send + Sync + 'static {
    type Tx: StoreTx;

    async fn begin(&self, scope: LockScope) -> LendingResult<Self::Tx>;

    /// Insert or replace a catalog row.
    async fn put_item(&self, item: Item) -> LendingResult<()>;
}

/// One atomic unit of work. Dropping a transaction without calling
/// [`StoreTx::commit`] discards its writes.
#[async_trait]
pub trait StoreTx: Send + Sized {
    async fn item(&mut self, item: ItemId) -> LendingResult<Option<Item>>;

    /// Conditionally take `quantity` units out of stock. Returns `false`
    /// without mutating anything when fewer units are available or the item
    /// does not exist.
    async fn try_reserve(&mut self, item: ItemId, quantity: i32) -> LendingResult<bool>;

    async fn release(&mut self, item: ItemId, quantity: i32) -> LendingResult<()>;

    async fn selection(&mut self, user: UserId, item: ItemId) -> LendingResult<Option<PendingSelection>>;

    /// Add one unit to the (user, item) selection, creating it at 1.
    async fn increment_selection(&mut self, user: UserId, item: ItemId) -> LendingResult<PendingSelection>;

    async fn set_selection_quantity(&mut self, user: UserId, item: ItemId, quantity: i32) -> LendingResult<()>;

    async fn delete_selection(&mut self, user: UserId, item: ItemId) -> LendingResult<()>;

    /// The user's selections with their item snapshot, ordered by title.
    async fn selections(&mut self, user: UserId) -> LendingResult<Vec<SelectionWithItem>>;

    async fn clear_selections(&mut self, user: UserId) -> LendingResult<usize>;

    async fn append_entry(&mut self, entry: NewLedgerEntry) -> LendingResult<LedgerEntry>;

    async fn totals(&mut self, user: UserId, item: ItemId) -> LendingResult<LedgerTotals>;

    /// Ledger sums per item for one user, with the item's catalog row.
    async fn item_totals(&mut self, user: UserId) -> LendingResult<Vec<(Item, LedgerTotals)>>;

    /// Whole-ledger counters, see [`OutstandingTotals`].
    async fn outstanding(&mut self) -> LendingResult<OutstandingTotals>;

    /// Every entry for the user, newest first.
    async fn history(&mut self, user: UserId) -> LendingResult<Vec<LedgerEntry>>;

    /// Every entry in the ledger, newest first.
    async fn all_history(&mut self) -> LendingResult<Vec<LedgerEntry>>;

    async fn commit(self) -> LendingResult<()>;

    async fn rollback(self) -> LendingResult<()>;
}

/// Commit `tx` if `result` is a success, otherwise roll it back and return
/// the original error.
pub async fn finish<T: StoreTx, R>(tx: T, result: LendingResult<R>) -> LendingResult<R> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!("Rollback failed after {}: {}", err.kind(), rollback_err);
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_scope_takes_no_lock() {
        assert_eq!(LockScope::Read.advisory_key(), None);
    }

    #[test]
    fn lock_keys_are_stable_per_scope() {
        let user = UserId::new();
        let item = ItemId::new();
        assert_eq!(
            LockScope::Cart(user).advisory_key(),
            LockScope::Cart(user).advisory_key()
        );
        assert_eq!(
            LockScope::Holding(user, item).advisory_key(),
            LockScope::Holding(user, item).advisory_key()
        );
        assert_ne!(
            LockScope::Holding(user, item).advisory_key(),
            LockScope::Holding(user, ItemId::new()).advisory_key()
        );
    }
}
