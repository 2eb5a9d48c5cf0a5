//! Reservation manager: a user's pending selections.
//!
//! A selection is the reservation itself. Each unit in `quantity` was taken
//! out of stock when it was added, and goes back when it is removed.

use std::sync::Arc;

use shared::*;
use tracing::info;

use crate::stock;
use crate::store::{finish, LendingStore, LockScope, StoreTx};

pub struct ReservationManager<S> {
    store: Arc<S>,
}

impl<S: LendingStore> ReservationManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Reserve one unit of `item` and add it to the user's selection.
    pub async fn add_selection(&self, user: UserId, item: ItemId) -> LendingResult<PendingSelection> {
        let mut tx = self.store.begin(LockScope::Cart(user)).await?;
        let result = add_in(&mut tx, user, item).await;
        let selection = finish(tx, result).await?;
        info!(
            "User {} reserved item {} (selection now {})",
            user, item, selection.quantity
        );
        Ok(selection)
    }

    /// Give back one unit. Returns the remaining selection, or `None` when the
    /// last unit was removed.
    pub async fn decrease_selection(&self, user: UserId, item: ItemId) -> LendingResult<Option<PendingSelection>> {
        let mut tx = self.store.begin(LockScope::Cart(user)).await?;
        let result = decrease_in(&mut tx, user, item).await;
        finish(tx, result).await
    }

    /// Drop the whole selection and release every unit it held. Returns the
    /// number of units released; 0 when there was nothing to remove.
    pub async fn remove_selection(&self, user: UserId, item: ItemId) -> LendingResult<i32> {
        let mut tx = self.store.begin(LockScope::Cart(user)).await?;
        let result = remove_in(&mut tx, user, item).await;
        let released = finish(tx, result).await?;
        if released > 0 {
            info!("User {} removed item {} from cart ({} released)", user, item, released);
        }
        Ok(released)
    }

    pub async fn list_selections(&self, user: UserId) -> LendingResult<Vec<SelectionWithItem>> {
        let mut tx = self.store.begin(LockScope::Read).await?;
        let result = tx.selections(user).await;
        finish(tx, result).await
    }
}

async fn add_in<T: StoreTx>(tx: &mut T, user: UserId, item: ItemId) -> LendingResult<PendingSelection> {
    let snapshot = tx.item(item).await?.ok_or(LendingError::ItemNotFound(item))?;
    if snapshot.available_quantity <= 0 {
        return Err(LendingError::ItemUnavailable(item));
    }
    stock::reserve(tx, item, 1).await?;
    tx.increment_selection(user, item).await
}

async fn decrease_in<T: StoreTx>(tx: &mut T, user: UserId, item: ItemId) -> LendingResult<Option<PendingSelection>> {
    let mut selection = tx
        .selection(user, item)
        .await?
        .ok_or(LendingError::SelectionNotFound(item))?;

    let remaining = if selection.quantity > 1 {
        selection.quantity -= 1;
        tx.set_selection_quantity(user, item, selection.quantity).await?;
        Some(selection)
    } else {
        tx.delete_selection(user, item).await?;
        None
    };
    stock::release(tx, item, 1).await?;
    Ok(remaining)
}

async fn remove_in<T: StoreTx>(tx: &mut T, user: UserId, item: ItemId) -> LendingResult<i32> {
    let Some(selection) = tx.selection(user, item).await? else {
        return Ok(0);
    };
    stock::release(tx, item, selection.quantity).await?;
    tx.delete_selection(user, item).await?;
    Ok(selection.quantity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn item(quantity: i32) -> Item {
        Item {
            id: ItemId::new(),
            title: "Piranesi".to_string(),
            author: "Susanna Clarke".to_string(),
            category: "fantasy".to_string(),
            available_quantity: quantity,
        }
    }

    fn setup(items: Vec<Item>) -> (Arc<MemoryStore>, ReservationManager<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_items(items));
        (store.clone(), ReservationManager::new(store))
    }

    async fn available(store: &MemoryStore, item: ItemId) -> i32 {
        store.item_snapshot(item).await.unwrap().available_quantity
    }

    #[tokio::test]
    async fn add_increments_one_row_per_item() {
        let book = item(3);
        let user = UserId::new();
        let (store, manager) = setup(vec![book.clone()]);

        manager.add_selection(user, book.id).await.unwrap();
        let selection = manager.add_selection(user, book.id).await.unwrap();

        assert_eq!(selection.quantity, 2);
        assert_eq!(available(&store, book.id).await, 1);
        let cart = manager.list_selections(user).await.unwrap();
        assert_eq!(cart.len(), 1);
        assert_eq!(cart[0].selection.quantity, 2);
        assert_eq!(cart[0].item.available_quantity, 1);
    }

    #[tokio::test]
    async fn add_out_of_stock_item_is_unavailable() {
        let book = item(0);
        let user = UserId::new();
        let (store, manager) = setup(vec![book.clone()]);

        assert_eq!(
            manager.add_selection(user, book.id).await,
            Err(LendingError::ItemUnavailable(book.id))
        );
        assert_eq!(available(&store, book.id).await, 0);
        assert_eq!(store.selection_snapshot(user, book.id).await, None);
    }

    #[tokio::test]
    async fn add_unknown_item_is_not_found() {
        let (_, manager) = setup(vec![]);
        let missing = ItemId::new();
        assert_eq!(
            manager.add_selection(UserId::new(), missing).await,
            Err(LendingError::ItemNotFound(missing))
        );
    }

    #[tokio::test]
    async fn add_then_remove_restores_stock() {
        let book = item(2);
        let user = UserId::new();
        let (store, manager) = setup(vec![book.clone()]);

        manager.add_selection(user, book.id).await.unwrap();
        assert_eq!(manager.remove_selection(user, book.id).await, Ok(1));

        assert_eq!(available(&store, book.id).await, 2);
        assert_eq!(store.selection_snapshot(user, book.id).await, None);
    }

    #[tokio::test]
    async fn remove_without_selection_is_a_no_op() {
        let book = item(2);
        let user = UserId::new();
        let (store, manager) = setup(vec![book.clone()]);

        assert_eq!(manager.remove_selection(user, book.id).await, Ok(0));
        assert_eq!(available(&store, book.id).await, 2);
        assert!(manager.list_selections(user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn decrease_steps_down_then_deletes() {
        let book = item(3);
        let user = UserId::new();
        let (store, manager) = setup(vec![book.clone()]);

        manager.add_selection(user, book.id).await.unwrap();
        manager.add_selection(user, book.id).await.unwrap();

        let remaining = manager.decrease_selection(user, book.id).await.unwrap();
        assert_eq!(remaining.map(|s| s.quantity), Some(1));
        assert_eq!(available(&store, book.id).await, 2);

        assert_eq!(manager.decrease_selection(user, book.id).await, Ok(None));
        assert_eq!(available(&store, book.id).await, 3);
        assert_eq!(store.selection_snapshot(user, book.id).await, None);
    }

    #[tokio::test]
    async fn decrease_without_selection_fails() {
        let book = item(3);
        let (_, manager) = setup(vec![book.clone()]);
        assert_eq!(
            manager.decrease_selection(UserId::new(), book.id).await,
            Err(LendingError::SelectionNotFound(book.id))
        );
    }

    #[tokio::test]
    async fn selections_are_per_user_and_sorted_by_title() {
        let mut zebra = item(5);
        zebra.title = "Zebra Tales".to_string();
        let mut apple = item(5);
        apple.title = "Apple Orchard".to_string();
        let user = UserId::new();
        let other = UserId::new();
        let (_, manager) = setup(vec![zebra.clone(), apple.clone()]);

        manager.add_selection(user, zebra.id).await.unwrap();
        manager.add_selection(user, apple.id).await.unwrap();
        manager.add_selection(other, apple.id).await.unwrap();

        let titles: Vec<String> = manager
            .list_selections(user)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.item.title)
            .collect();
        assert_eq!(titles, vec!["Apple Orchard", "Zebra Tales"]);
        assert_eq!(manager.list_selections(other).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_flight_reservation_is_seen_by_other_carts() {
        let book = item(1);
        let alice = UserId::new();
        let (store, manager) = setup(vec![book.clone()]);

        let mut tx = store.begin(LockScope::Cart(alice)).await.unwrap();
        add_in(&mut tx, alice, book.id).await.unwrap();

        // Another cart is a different lock scope, so it runs while alice's
        // transaction is still open and must not get the same unit.
        let bob = manager.add_selection(UserId::new(), book.id).await;
        assert!(matches!(
            bob,
            Err(LendingError::ItemUnavailable(_)) | Err(LendingError::InsufficientStock { .. })
        ));

        tx.commit().await.unwrap();
        assert_eq!(available(&store, book.id).await, 0);
        assert_eq!(store.selection_snapshot(alice, book.id).await, Some(1));
    }

    #[tokio::test]
    async fn abandoned_reservation_frees_the_unit() {
        let book = item(1);
        let alice = UserId::new();
        let bob = UserId::new();
        let (store, manager) = setup(vec![book.clone()]);

        let mut tx = store.begin(LockScope::Cart(alice)).await.unwrap();
        add_in(&mut tx, alice, book.id).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(manager.add_selection(bob, book.id).await.map(|s| s.quantity), Ok(1));
        assert_eq!(store.selection_snapshot(alice, book.id).await, None);
        assert_eq!(available(&store, book.id).await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn last_unit_goes_to_exactly_one_user() {
        let book = item(1);
        let (store, manager) = setup(vec![book.clone()]);
        let manager = Arc::new(manager);

        let attempts = (0..8).map(|_| {
            let manager = manager.clone();
            let book_id = book.id;
            tokio::spawn(async move { manager.add_selection(UserId::new(), book_id).await })
        });
        let results: Vec<_> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|joined| joined.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        for failure in results.iter().filter_map(|r| r.as_ref().err()) {
            assert!(matches!(
                failure,
                LendingError::ItemUnavailable(_) | LendingError::InsufficientStock { .. }
            ));
        }
        assert_eq!(available(&store, book.id).await, 0);
    }
}
