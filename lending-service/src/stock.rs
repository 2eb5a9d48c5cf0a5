//! Stock store: the only code that changes an item's available quantity.
//!
//! Both operations run inside the caller's transaction so they commit or roll
//! back together with the selection or ledger write they belong to.

use shared::*;
use tracing::debug;

use crate::store::StoreTx;

/// Take `quantity` units out of stock with a single conditional decrement.
pub async fn reserve<T: StoreTx>(tx: &mut T, item: ItemId, quantity: i32) -> LendingResult<()> {
    if quantity < 1 {
        return Err(LendingError::InvalidQuantity(quantity));
    }
    if !tx.try_reserve(item, quantity).await? {
        return Err(LendingError::InsufficientStock {
            item,
            requested: quantity,
        });
    }
    debug!("Reserved {} unit(s) of item {}", quantity, item);
    Ok(())
}

/// Put `quantity` units back into stock.
pub async fn release<T: StoreTx>(tx: &mut T, item: ItemId, quantity: i32) -> LendingResult<()> {
    if quantity < 1 {
        return Err(LendingError::InvalidQuantity(quantity));
    }
    tx.release(item, quantity).await?;
    debug!("Released {} unit(s) of item {}", quantity, item);
    Ok(())
}
