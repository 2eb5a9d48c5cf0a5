use std::sync::Arc;

use shared::*;
use tracing::info;

use crate::store::{finish, LendingStore, LockScope, StoreTx};

/// Commits a user's pending selections into the ledger.
///
/// Stock was already taken when each unit was added, so checkout only appends
/// checkout entries and clears the cart, in one transaction.
pub struct CheckoutEngine<S> {
    store: Arc<S>,
}

impl<S: LendingStore> CheckoutEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub async fn checkout(&self, user: UserId) -> LendingResult<CheckoutReceipt> {
        let mut tx = self.store.begin(LockScope::Cart(user)).await?;
        let result = checkout_in(&mut tx, user).await;
        let receipt = finish(tx, result).await?;
        info!(
            "User {} checked out {} item(s), {} unit(s)",
            user,
            receipt.entries.len(),
            receipt.units()
        );
        Ok(receipt)
    }
}

async fn checkout_in<T: StoreTx>(tx: &mut T, user: UserId) -> LendingResult<CheckoutReceipt> {
    let cart = tx.selections(user).await?;
    if cart.is_empty() {
        return Err(LendingError::EmptyCart);
    }

    let mut entries = Vec::with_capacity(cart.len());
    for line in cart {
        let selection = line.selection;
        if selection.quantity <= 0 {
            continue;
        }
        let entry = tx
            .append_entry(NewLedgerEntry::checkout(
                user,
                selection.item_id,
                selection.quantity,
            ))
            .await?;
        entries.push(entry);
    }
    tx.clear_selections(user).await?;

    Ok(CheckoutReceipt { entries })
}
