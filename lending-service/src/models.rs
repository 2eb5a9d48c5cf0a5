use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Int4, Uuid as SqlUuid, Varchar};
use shared::*;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = crate::schema::items)]
pub struct ItemRow {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub category: String,
    pub available_quantity: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable, AsChangeset)]
#[diesel(table_name = crate::schema::items)]
pub struct NewItemRow {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub category: String,
    pub available_quantity: i32,
}

impl From<Item> for NewItemRow {
    fn from(item: Item) -> Self {
        Self {
            id: item.id.0,
            title: item.title,
            author: item.author,
            category: item.category,
            available_quantity: item.available_quantity,
        }
    }
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::pending_selections)]
pub struct SelectionRow {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::pending_selections)]
pub struct NewSelectionRow {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub quantity: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::ledger_entries)]
pub struct LedgerRow {
    pub id: i64,
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub quantity: i32,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::ledger_entries)]
pub struct NewLedgerRow {
    pub user_id: Uuid,
    pub item_id: Uuid,
    pub quantity: i32,
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// Checkout/return sums for one (user, item) pair.
#[derive(Debug, Clone, QueryableByName)]
pub struct TotalsRow {
    #[diesel(sql_type = BigInt)]
    pub checked_out: i64,
    #[diesel(sql_type = BigInt)]
    pub returned: i64,
}

/// Per-item sums for one user, joined with the catalog row.
#[derive(Debug, Clone, QueryableByName)]
pub struct ItemTotalsRow {
    #[diesel(sql_type = SqlUuid)]
    pub item_id: Uuid,
    #[diesel(sql_type = Varchar)]
    pub title: String,
    #[diesel(sql_type = Varchar)]
    pub author: String,
    #[diesel(sql_type = Varchar)]
    pub category: String,
    #[diesel(sql_type = Int4)]
    pub available_quantity: i32,
    #[diesel(sql_type = BigInt)]
    pub checked_out: i64,
    #[diesel(sql_type = BigInt)]
    pub returned: i64,
}

/// Whole-ledger counters computed in one aggregate query.
#[derive(Debug, Clone, QueryableByName)]
pub struct OutstandingRow {
    #[diesel(sql_type = BigInt)]
    pub checkouts: i64,
    #[diesel(sql_type = BigInt)]
    pub returns: i64,
    #[diesel(sql_type = BigInt)]
    pub currently_held: i64,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Self {
            id: ItemId(row.id),
            title: row.title,
            author: row.author,
            category: row.category,
            available_quantity: row.available_quantity,
        }
    }
}

impl From<SelectionRow> for PendingSelection {
    fn from(row: SelectionRow) -> Self {
        Self {
            user_id: UserId(row.user_id),
            item_id: ItemId(row.item_id),
            quantity: row.quantity,
        }
    }
}

impl TryFrom<LedgerRow> for LedgerEntry {
    type Error = LendingError;

    fn try_from(row: LedgerRow) -> Result<Self, Self::Error> {
        let kind = row
            .kind
            .parse::<EntryKind>()
            .map_err(LendingError::store_unavailable)?;
        Ok(Self {
            id: row.id,
            user_id: UserId(row.user_id),
            item_id: ItemId(row.item_id),
            quantity: row.quantity,
            kind,
            created_at: row.created_at,
        })
    }
}

impl NewLedgerRow {
    pub fn new(entry: &NewLedgerEntry, created_at: DateTime<Utc>) -> Self {
        Self {
            user_id: entry.user_id.0,
            item_id: entry.item_id.0,
            quantity: entry.quantity,
            kind: entry.kind.as_str().to_string(),
            created_at,
        }
    }
}

impl From<TotalsRow> for LedgerTotals {
    fn from(row: TotalsRow) -> Self {
        Self {
            checked_out: row.checked_out,
            returned: row.returned,
        }
    }
}

impl From<ItemTotalsRow> for (Item, LedgerTotals) {
    fn from(row: ItemTotalsRow) -> Self {
        (
            Item {
                id: ItemId(row.item_id),
                title: row.title,
                author: row.author,
                category: row.category,
                available_quantity: row.available_quantity,
            },
            LedgerTotals {
                checked_out: row.checked_out,
                returned: row.returned,
            },
        )
    }
}

impl From<OutstandingRow> for OutstandingTotals {
    fn from(row: OutstandingRow) -> Self {
        Self {
            checkouts: row.checkouts,
            returns: row.returns,
            currently_held: row.currently_held,
        }
    }
}
