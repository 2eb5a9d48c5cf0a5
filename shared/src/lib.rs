use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl ItemId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Catalog item as seen by the lending core. The catalog owns the row; only
/// the stock store changes `available_quantity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    pub author: String,
    pub category: String,
    pub available_quantity: i32,
}

/// A user's not-yet-committed selection of one item. Every unit of
/// `quantity` has already been taken out of the item's available stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSelection {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionWithItem {
    #[serde(flatten)]
    pub selection: PendingSelection,
    pub item: Item,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Checkout,
    Return,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Checkout => "checkout",
            EntryKind::Return => "return",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkout" => Ok(EntryKind::Checkout),
            "return" => Ok(EntryKind::Return),
            other => Err(format!("unknown ledger entry kind: {other}")),
        }
    }
}

/// Immutable ledger record. `id` is assigned by the store and grows with
/// every append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: UserId,
    pub item_id: ItemId,
    pub quantity: i32,
    pub kind: EntryKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub item_id: ItemId,
    pub quantity: i32,
    pub kind: EntryKind,
}

impl NewLedgerEntry {
    pub fn checkout(user_id: UserId, item_id: ItemId, quantity: i32) -> Self {
        Self {
            user_id,
            item_id,
            quantity,
            kind: EntryKind::Checkout,
        }
    }

    pub fn returned(user_id: UserId, item_id: ItemId, quantity: i32) -> Self {
        Self {
            user_id,
            item_id,
            quantity,
            kind: EntryKind::Return,
        }
    }
}

/// Checkout and return sums for one slice of the ledger.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTotals {
    pub checked_out: i64,
    pub returned: i64,
}

impl LedgerTotals {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        entries.into_iter().fold(Self::default(), |mut acc, entry| {
            acc.record(entry.kind, entry.quantity);
            acc
        })
    }

    pub fn record(&mut self, kind: EntryKind, quantity: i32) {
        match kind {
            EntryKind::Checkout => self.checked_out += i64::from(quantity),
            EntryKind::Return => self.returned += i64::from(quantity),
        }
    }

    pub fn held(&self) -> i64 {
        self.checked_out - self.returned
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeldItem {
    pub item_id: ItemId,
    pub title: String,
    pub author: String,
    pub category: String,
    pub held: i64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowingStats {
    pub checkouts: i64,
    pub returns: i64,
    pub held: i64,
}

/// Whole-ledger counters. `checkouts` and `returns` count entries, not units;
/// `currently_held` sums the units still out over every (user, item) pair
/// that holds a positive amount.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutstandingTotals {
    pub checkouts: i64,
    pub returns: i64,
    pub currently_held: i64,
}

impl OutstandingTotals {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut out = Self::default();
        let mut pairs: HashMap<(UserId, ItemId), LedgerTotals> = HashMap::new();
        for entry in entries {
            match entry.kind {
                EntryKind::Checkout => out.checkouts += 1,
                EntryKind::Return => out.returns += 1,
            }
            pairs
                .entry((entry.user_id, entry.item_id))
                .or_default()
                .record(entry.kind, entry.quantity);
        }
        out.currently_held = pairs.values().map(|t| t.held().max(0)).sum();
        out
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReturnRequest {
    pub quantity: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnReceipt {
    pub entry: LedgerEntry,
    pub still_held: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    pub entries: Vec<LedgerEntry>,
}

impl CheckoutReceipt {
    pub fn units(&self) -> i64 {
        self.entries.iter().map(|e| i64::from(e.quantity)).sum()
    }
}

pub type LendingResult<T> = Result<T, LendingError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LendingError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),

    #[error("item {0} is not available")]
    ItemUnavailable(ItemId),

    #[error("insufficient stock for item {item}: requested {requested}")]
    InsufficientStock { item: ItemId, requested: i32 },

    #[error("quantity must be at least 1, got {0}")]
    InvalidQuantity(i32),

    #[error("item {0} is not in the cart")]
    SelectionNotFound(ItemId),

    #[error("cart is empty")]
    EmptyCart,

    #[error("no active borrow of item {0} to return")]
    NothingToReturn(ItemId),

    #[error("you only have {held} item(s) to return")]
    ExcessReturn { held: i64, requested: i32 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl LendingError {
    pub fn store_unavailable(msg: impl Into<String>) -> Self {
        Self::StoreUnavailable(msg.into())
    }

    /// Stable snake_case name of the error kind, for transports.
    pub fn kind(&self) -> &'static str {
        match self {
            LendingError::ItemNotFound(_) => "item_not_found",
            LendingError::ItemUnavailable(_) => "item_unavailable",
            LendingError::InsufficientStock { .. } => "insufficient_stock",
            LendingError::InvalidQuantity(_) => "invalid_quantity",
            LendingError::SelectionNotFound(_) => "selection_not_found",
            LendingError::EmptyCart => "empty_cart",
            LendingError::NothingToReturn(_) => "nothing_to_return",
            LendingError::ExcessReturn { .. } => "excess_return",
            LendingError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// Only transient store failures may be retried by a caller.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LendingError::StoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(kind: EntryKind, quantity: i32) -> LedgerEntry {
        LedgerEntry {
            id: 0,
            user_id: UserId(Uuid::nil()),
            item_id: ItemId(Uuid::nil()),
            quantity,
            kind,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn held_is_checkouts_minus_returns() {
        let entries = vec![
            entry(EntryKind::Checkout, 2),
            entry(EntryKind::Return, 1),
            entry(EntryKind::Checkout, 3),
        ];
        let totals = LedgerTotals::from_entries(&entries);
        assert_eq!(totals.checked_out, 5);
        assert_eq!(totals.returned, 1);
        assert_eq!(totals.held(), 4);
    }

    #[test]
    fn empty_ledger_holds_nothing() {
        let none: Vec<LedgerEntry> = Vec::new();
        assert_eq!(LedgerTotals::from_entries(&none).held(), 0);
    }

    #[test]
    fn outstanding_counts_entries_and_sums_positive_holdings() {
        let alice = UserId::new();
        let bob = UserId::new();
        let book = ItemId::new();
        let at = |user, kind, quantity| LedgerEntry {
            user_id: user,
            item_id: book,
            ..entry(kind, quantity)
        };
        let ledger = vec![
            at(alice, EntryKind::Checkout, 3),
            at(alice, EntryKind::Return, 1),
            at(bob, EntryKind::Checkout, 2),
            at(bob, EntryKind::Return, 2),
            // Malformed history must not cancel out other holdings.
            at(UserId::new(), EntryKind::Return, 4),
        ];
        assert_eq!(
            OutstandingTotals::from_entries(&ledger),
            OutstandingTotals {
                checkouts: 2,
                returns: 3,
                currently_held: 2,
            }
        );
        let none: Vec<LedgerEntry> = Vec::new();
        assert_eq!(OutstandingTotals::from_entries(&none), OutstandingTotals::default());
    }

    #[test]
    fn entry_kind_uses_lowercase_names() {
        assert_eq!(EntryKind::Checkout.as_str(), "checkout");
        assert_eq!("return".parse::<EntryKind>(), Ok(EntryKind::Return));
        assert!("loan".parse::<EntryKind>().is_err());
        assert_eq!(
            serde_json::to_value(EntryKind::Return).unwrap(),
            serde_json::json!("return")
        );
    }

    #[test]
    fn excess_return_message_names_held_count() {
        let err = LendingError::ExcessReturn { held: 2, requested: 5 };
        assert_eq!(err.to_string(), "you only have 2 item(s) to return");
        assert_eq!(err.kind(), "excess_return");
        assert!(!err.is_retryable());
        assert!(LendingError::store_unavailable("down").is_retryable());
    }

    #[test]
    fn selection_with_item_flattens_selection_fields() {
        let item_id = ItemId::new();
        let view = SelectionWithItem {
            selection: PendingSelection {
                user_id: UserId::new(),
                item_id,
                quantity: 2,
            },
            item: Item {
                id: item_id,
                title: "Dune".to_string(),
                author: "Frank Herbert".to_string(),
                category: "sf".to_string(),
                available_quantity: 1,
            },
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["quantity"], 2);
        assert_eq!(json["item"]["title"], "Dune");
    }
}
