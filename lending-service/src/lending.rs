use std::sync::Arc;

use shared::*;

use crate::checkout::CheckoutEngine;
use crate::holdings::HoldingsAggregator;
use crate::reservations::ReservationManager;
use crate::returns::ReturnValidator;
use crate::store::LendingStore;

/// Every lending operation, built over one shared store handle.
pub struct Lending<S> {
    store: Arc<S>,
    pub reservations: ReservationManager<S>,
    pub checkout: CheckoutEngine<S>,
    pub returns: ReturnValidator<S>,
    pub holdings: HoldingsAggregator<S>,
}

impl<S: LendingStore> Lending<S> {
    pub fn new(store: S) -> Self {
        Self::from_shared(Arc::new(store))
    }

    pub fn from_shared(store: Arc<S>) -> Self {
        Self {
            reservations: ReservationManager::new(store.clone()),
            checkout: CheckoutEngine::new(store.clone()),
            returns: ReturnValidator::new(store.clone()),
            holdings: HoldingsAggregator::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub async fn add_selection(&self, user: UserId, item: ItemId) -> LendingResult<PendingSelection> {
        self.reservations.add_selection(user, item).await
    }

    pub async fn decrease_selection(&self, user: UserId, item: ItemId) -> LendingResult<Option<PendingSelection>> {
        self.reservations.decrease_selection(user, item).await
    }

    pub async fn remove_selection(&self, user: UserId, item: ItemId) -> LendingResult<i32> {
        self.reservations.remove_selection(user, item).await
    }

    pub async fn list_selections(&self, user: UserId) -> LendingResult<Vec<SelectionWithItem>> {
        self.reservations.list_selections(user).await
    }

    pub async fn checkout(&self, user: UserId) -> LendingResult<CheckoutReceipt> {
        self.checkout.checkout(user).await
    }

    pub async fn return_item(&self, user: UserId, item: ItemId, quantity: Option<i32>) -> LendingResult<ReturnReceipt> {
        self.returns.return_item(user, item, quantity).await
    }

    pub async fn held_by_user(&self, user: UserId) -> LendingResult<Vec<HeldItem>> {
        self.holdings.held_by_user(user).await
    }

    pub async fn held_system_wide(&self) -> LendingResult<OutstandingTotals> {
        self.holdings.held_system_wide().await
    }

    pub async fn history(&self, user: UserId) -> LendingResult<Vec<LedgerEntry>> {
        self.holdings.history(user).await
    }

    pub async fn history_all(&self) -> LendingResult<Vec<LedgerEntry>> {
        self.holdings.history_all().await
    }

    pub async fn borrowing_stats(&self, user: UserId) -> LendingResult<BorrowingStats> {
        self.holdings.borrowing_stats(user).await
    }
}
