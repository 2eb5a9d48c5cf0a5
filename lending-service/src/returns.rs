//! Return validator.
//!
//! The amount a user holds is never stored; it is recomputed from the ledger
//! inside the same transaction that records the return, under a lock keyed
//! by (user, item).

use std::sync::Arc;

use shared::*;
use tracing::info;

use crate::stock;
use crate::store::{finish, LendingStore, LockScope, StoreTx};

pub struct ReturnValidator<S> {
    store: Arc<S>,
}

/// Requested return quantity; absent or non-positive means one unit.
pub fn effective_quantity(requested: Option<i32>) -> i32 {
    match requested {
        Some(quantity) if quantity > 0 => quantity,
        _ => 1,
    }
}

impl<S: LendingStore> ReturnValidator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn return_item(&self, user: UserId, item: ItemId, quantity: Option<i32>) -> LendingResult<ReturnReceipt> {
        let quantity = effective_quantity(quantity);
        let mut tx = self.store.begin(LockScope::Holding(user, item)).await?;
        let result = return_in(&mut tx, user, item, quantity).await;
        let receipt = finish(tx, result).await?;
        info!(
            "User {} returned {} unit(s) of item {} ({} still held)",
            user, quantity, item, receipt.still_held
        );
        Ok(receipt)
    }

    pub async fn held(&self, user: UserId, item: ItemId) -> LendingResult<i64> {
        let mut tx = self.store.begin(LockScope::Read).await?;
        let result = tx.totals(user, item).await.map(|t| t.held());
        finish(tx, result).await
    }
}

async fn return_in<T: StoreTx>(tx: &mut T, user: UserId, item: ItemId, quantity: i32) -> LendingResult<ReturnReceipt> {
    let held = tx.totals(user, item).await?.held();
    if held <= 0 {
        return Err(LendingError::NothingToReturn(item));
    }
    if i64::from(quantity) > held {
        return Err(LendingError::ExcessReturn {
            held,
            requested: quantity,
        });
    }

    stock::release(tx, item, quantity).await?;
    let entry = tx
        .append_entry(NewLedgerEntry::returned(user, item, quantity))
        .await?;

    Ok(ReturnReceipt {
        entry,
        still_held: held - i64::from(quantity),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkout::CheckoutEngine;
    use crate::reservations::ReservationManager;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::time::timeout;

    struct Fixture {
        store: Arc<MemoryStore>,
        reservations: ReservationManager<MemoryStore>,
        checkout: CheckoutEngine<MemoryStore>,
        returns: ReturnValidator<MemoryStore>,
        book: Item,
    }

    fn fixture(quantity: i32) -> Fixture {
        let book = Item {
            id: ItemId::new(),
            title: "The Dispossessed".to_string(),
            author: "Ursula K. Le Guin".to_string(),
            category: "sf".to_string(),
            available_quantity: quantity,
        };
        let store = Arc::new(MemoryStore::with_items([book.clone()]));
        Fixture {
            reservations: ReservationManager::new(store.clone()),
            checkout: CheckoutEngine::new(store.clone()),
            returns: ReturnValidator::new(store.clone()),
            store,
            book,
        }
    }

    async fn borrow(f: &Fixture, user: UserId, units: usize) {
        for _ in 0..units {
            f.reservations.add_selection(user, f.book.id).await.unwrap();
        }
        f.checkout.checkout(user).await.unwrap();
    }

    #[test]
    fn missing_or_non_positive_quantity_means_one() {
        assert_eq!(effective_quantity(None), 1);
        assert_eq!(effective_quantity(Some(0)), 1);
        assert_eq!(effective_quantity(Some(-4)), 1);
        assert_eq!(effective_quantity(Some(3)), 3);
    }

    #[tokio::test]
    async fn partial_return_then_excess_is_rejected() {
        let f = fixture(3);
        let user = UserId::new();
        borrow(&f, user, 2).await;
        assert_eq!(f.store.item_snapshot(f.book.id).await.unwrap().available_quantity, 1);

        let receipt = f.returns.return_item(user, f.book.id, Some(1)).await.unwrap();
        assert_eq!(receipt.still_held, 1);
        assert_eq!(receipt.entry.kind, EntryKind::Return);
        assert_eq!(f.store.item_snapshot(f.book.id).await.unwrap().available_quantity, 2);
        assert_eq!(f.returns.held(user, f.book.id).await, Ok(1));

        let ledger_before = f.store.ledger_len().await;
        assert_eq!(
            f.returns.return_item(user, f.book.id, Some(2)).await,
            Err(LendingError::ExcessReturn {
                held: 1,
                requested: 2
            })
        );
        assert_eq!(f.store.ledger_len().await, ledger_before);
        assert_eq!(f.store.item_snapshot(f.book.id).await.unwrap().available_quantity, 2);
    }

    #[tokio::test]
    async fn nothing_held_means_nothing_to_return() {
        let f = fixture(3);
        assert_eq!(
            f.returns.return_item(UserId::new(), f.book.id, None).await,
            Err(LendingError::NothingToReturn(f.book.id))
        );
    }

    #[tokio::test]
    async fn fully_returned_holding_cannot_be_returned_again() {
        let f = fixture(2);
        let user = UserId::new();
        borrow(&f, user, 2).await;

        let receipt = f.returns.return_item(user, f.book.id, Some(2)).await.unwrap();
        assert_eq!(receipt.still_held, 0);
        assert_eq!(
            f.returns.return_item(user, f.book.id, Some(1)).await,
            Err(LendingError::NothingToReturn(f.book.id))
        );
        assert_eq!(f.store.item_snapshot(f.book.id).await.unwrap().available_quantity, 2);
    }

    #[tokio::test]
    async fn failed_append_does_not_release_stock() {
        let f = fixture(1);
        let user = UserId::new();
        borrow(&f, user, 1).await;

        f.store.fail_appends(true);
        assert!(f.returns.return_item(user, f.book.id, None).await.is_err());
        assert_eq!(f.store.item_snapshot(f.book.id).await.unwrap().available_quantity, 0);
        assert_eq!(f.returns.held(user, f.book.id).await, Ok(1));
    }

    #[tokio::test]
    async fn return_waits_for_an_open_return_of_the_same_holding() {
        let f = fixture(1);
        let user = UserId::new();
        borrow(&f, user, 1).await;

        let mut tx = f.store.begin(LockScope::Holding(user, f.book.id)).await.unwrap();
        return_in(&mut tx, user, f.book.id, 1).await.unwrap();
        assert!(timeout(Duration::from_millis(50), f.returns.return_item(user, f.book.id, None))
            .await
            .is_err());
        tx.commit().await.unwrap();

        assert_eq!(
            f.returns.return_item(user, f.book.id, None).await,
            Err(LendingError::NothingToReturn(f.book.id))
        );
        assert_eq!(f.store.item_snapshot(f.book.id).await.unwrap().available_quantity, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_returns_cannot_overdraw_a_holding() {
        let f = Arc::new(fixture(1));
        let user = UserId::new();
        borrow(&f, user, 1).await;

        let attempts = (0..6).map(|_| {
            let f = f.clone();
            tokio::spawn(async move { f.returns.return_item(user, f.book.id, None).await })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(f.returns.held(user, f.book.id).await, Ok(0));
        assert_eq!(f.store.item_snapshot(f.book.id).await.unwrap().available_quantity, 1);
    }
}
