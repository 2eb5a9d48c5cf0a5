//! Read-only projections over the ledger.

use std::sync::Arc;

use shared::*;

use crate::store::{finish, LendingStore, LockScope, StoreTx};

pub struct HoldingsAggregator<S> {
    store: Arc<S>,
}

impl<S: LendingStore> HoldingsAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Items the user currently holds, ordered by title.
    pub async fn held_by_user(&self, user: UserId) -> LendingResult<Vec<HeldItem>> {
        let mut tx = self.store.begin(LockScope::Read).await?;
        let result = tx.item_totals(user).await.map(held_items);
        finish(tx, result).await
    }

    /// Entry counts and units currently out on loan across every user and item.
    pub async fn held_system_wide(&self) -> LendingResult<OutstandingTotals> {
        let mut tx = self.store.begin(LockScope::Read).await?;
        let result = tx.outstanding().await;
        finish(tx, result).await
    }

    pub async fn history(&self, user: UserId) -> LendingResult<Vec<LedgerEntry>> {
        let mut tx = self.store.begin(LockScope::Read).await?;
        let result = tx.history(user).await;
        finish(tx, result).await
    }

    /// The whole ledger, newest first.
    pub async fn history_all(&self) -> LendingResult<Vec<LedgerEntry>> {
        let mut tx = self.store.begin(LockScope::Read).await?;
        let result = tx.all_history().await;
        finish(tx, result).await
    }

    pub async fn borrowing_stats(&self, user: UserId) -> LendingResult<BorrowingStats> {
        let mut tx = self.store.begin(LockScope::Read).await?;
        let result = tx.item_totals(user).await.map(|rows| stats(&rows));
        finish(tx, result).await
    }
}

pub fn held_items(rows: Vec<(Item, LedgerTotals)>) -> Vec<HeldItem> {
    let mut held: Vec<HeldItem> = rows
        .into_iter()
        .filter(|(_, totals)| totals.held() > 0)
        .map(|(item, totals)| HeldItem {
            item_id: item.id,
            title: item.title,
            author: item.author,
            category: item.category,
            held: totals.held(),
        })
        .collect();
    held.sort_by(|a, b| a.title.cmp(&b.title).then(a.item_id.cmp(&b.item_id)));
    held
}

pub fn stats(rows: &[(Item, LedgerTotals)]) -> BorrowingStats {
    rows.iter().fold(BorrowingStats::default(), |mut acc, (_, totals)| {
        acc.checkouts += totals.checked_out;
        acc.returns += totals.returned;
        acc.held += totals.held().max(0);
        acc
    })
}
