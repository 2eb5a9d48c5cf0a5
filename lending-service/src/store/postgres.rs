use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use diesel::sql_types::{BigInt, Uuid as SqlUuid};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use shared::*;
use tracing::{debug, error, warn};

use super::{LendingStore, LockScope, StoreTx};
use crate::models::*;
use crate::schema::*;

pub type DbPool = Pool<AsyncPgConnection>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

type PooledConn = bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

const ITEM_TOTALS_SQL: &str = r#"
    SELECT
        i.id AS item_id,
        i.title,
        i.author,
        i.category,
        i.available_quantity,
        COALESCE(SUM(CASE WHEN l.kind = 'checkout' THEN l.quantity ELSE 0 END), 0)::BIGINT AS checked_out,
        COALESCE(SUM(CASE WHEN l.kind = 'return' THEN l.quantity ELSE 0 END), 0)::BIGINT AS returned
    FROM ledger_entries l
    JOIN items i ON i.id = l.item_id
    WHERE l.user_id = $1
    GROUP BY i.id, i.title, i.author, i.category, i.available_quantity
    ORDER BY i.title ASC
"#;

const OUTSTANDING_SQL: &str = r#"
    SELECT
        COUNT(*) FILTER (WHERE kind = 'checkout') AS checkouts,
        COUNT(*) FILTER (WHERE kind = 'return') AS returns,
        COALESCE((
            SELECT SUM(GREATEST(pairs.held, 0))
            FROM (
                SELECT SUM(CASE WHEN kind = 'checkout' THEN quantity ELSE -quantity END) AS held
                FROM ledger_entries
                GROUP BY user_id, item_id
            ) pairs
        ), 0)::BIGINT AS currently_held
    FROM ledger_entries
"#;

const TOTALS_SQL: &str = r#"
    SELECT
        COALESCE(SUM(CASE WHEN kind = 'checkout' THEN quantity ELSE 0 END), 0)::BIGINT AS checked_out,
        COALESCE(SUM(CASE WHEN kind = 'return' THEN quantity ELSE 0 END), 0)::BIGINT AS returned
    FROM ledger_entries
    WHERE user_id = $1 AND item_id = $2
"#;

fn map_diesel_error(op: &'static str) -> impl FnOnce(diesel::result::Error) -> LendingError {
    move |e| {
        error!("Database error during {}: {}", op, e);
        LendingError::store_unavailable(format!("{op}: {e}"))
    }
}

/// PostgreSQL store over a bb8 pool of async diesel connections.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Build a pool for `database_url`. Connections are opened lazily.
    pub async fn connect(database_url: &str, pool_size: u32, timeout: Duration) -> anyhow::Result<Self> {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(timeout)
            .build(config)
            .await?;
        Ok(Self::new(pool))
    }
}

/// Apply pending migrations over a blocking connection, waiting up to
/// `retries` times two seconds for the database to come up.
pub fn run_migrations(database_url: &str, retries: u32) -> anyhow::Result<()> {
    let mut attempt = 0;
    let mut conn = loop {
        match PgConnection::establish(database_url) {
            Ok(conn) => break conn,
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!("Waiting for database ({}/{}): {}", attempt, retries, e);
                std::thread::sleep(Duration::from_secs(2));
            }
            Err(e) => return Err(anyhow::Error::new(e).context("database connection failed")),
        }
    };
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    Ok(())
}

#[async_trait]
impl LendingStore for PgStore {
    type Tx = PgTx;

    async fn begin(&self, scope: LockScope) -> LendingResult<PgTx> {
        let mut conn = self.pool.get_owned().await.map_err(|e| {
            error!("Failed to acquire database connection: {}", e);
            LendingError::store_unavailable(format!("pool: {e}"))
        })?;

        AnsiTransactionManager::begin_transaction(&mut *conn)
            .await
            .map_err(map_diesel_error("begin"))?;

        let mut tx = PgTx { conn };
        if let Some(key) = scope.advisory_key() {
            let locked = diesel::sql_query("SELECT pg_advisory_xact_lock($1)")
                .bind::<BigInt, _>(key)
                .execute(&mut *tx.conn)
                .await
                .map_err(map_diesel_error("advisory_lock"));
            if let Err(err) = locked {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!("Rollback after failed lock also failed: {}", rollback_err);
                }
                return Err(err);
            }
            debug!("Acquired advisory lock {} for {:?}", key, scope);
        }
        Ok(tx)
    }

    async fn put_item(&self, item: Item) -> LendingResult<()> {
        let mut conn = self.pool.get().await.map_err(|e| {
            error!("Failed to acquire database connection: {}", e);
            LendingError::store_unavailable(format!("pool: {e}"))
        })?;
        let row = NewItemRow::from(item);
        diesel::insert_into(items::table)
            .values(&row)
            .on_conflict(items::id)
            .do_update()
            .set(&row)
            .execute(&mut *conn)
            .await
            .map_err(map_diesel_error("put_item"))?;
        Ok(())
    }
}

pub struct PgTx {
    conn: PooledConn,
}

#[async_trait]
impl StoreTx for PgTx {
    async fn item(&mut self, item: ItemId) -> LendingResult<Option<Item>> {
        let row = items::table
            .find(item.0)
            .first::<ItemRow>(&mut *self.conn)
            .await
            .optional()
            .map_err(map_diesel_error("item"))?;
        Ok(row.map(Item::from))
    }

    async fn try_reserve(&mut self, item: ItemId, quantity: i32) -> LendingResult<bool> {
        let updated = diesel::update(
            items::table
                .filter(items::id.eq(item.0))
                .filter(items::available_quantity.ge(quantity)),
        )
        .set(items::available_quantity.eq(items::available_quantity - quantity))
        .execute(&mut *self.conn)
        .await
        .map_err(map_diesel_error("reserve"))?;
        Ok(updated == 1)
    }

    async fn release(&mut self, item: ItemId, quantity: i32) -> LendingResult<()> {
        let updated = diesel::update(items::table.filter(items::id.eq(item.0)))
            .set(items::available_quantity.eq(items::available_quantity + quantity))
            .execute(&mut *self.conn)
            .await
            .map_err(map_diesel_error("release"))?;
        if updated == 0 {
            return Err(LendingError::ItemNotFound(item));
        }
        Ok(())
    }

    async fn selection(&mut self, user: UserId, item: ItemId) -> LendingResult<Option<PendingSelection>> {
        let row = pending_selections::table
            .find((user.0, item.0))
            .first::<SelectionRow>(&mut *self.conn)
            .await
            .optional()
            .map_err(map_diesel_error("selection"))?;
        Ok(row.map(PendingSelection::from))
    }

    async fn increment_selection(&mut self, user: UserId, item: ItemId) -> LendingResult<PendingSelection> {
        let now = Utc::now();
        let row = diesel::insert_into(pending_selections::table)
            .values(&NewSelectionRow {
                user_id: user.0,
                item_id: item.0,
                quantity: 1,
                created_at: now,
                updated_at: now,
            })
            .on_conflict((pending_selections::user_id, pending_selections::item_id))
            .do_update()
            .set((
                pending_selections::quantity.eq(pending_selections::quantity + 1),
                pending_selections::updated_at.eq(now),
            ))
            .get_result::<SelectionRow>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("increment_selection"))?;
        Ok(row.into())
    }

    async fn set_selection_quantity(&mut self, user: UserId, item: ItemId, quantity: i32) -> LendingResult<()> {
        let updated = diesel::update(pending_selections::table.find((user.0, item.0)))
            .set((
                pending_selections::quantity.eq(quantity),
                pending_selections::updated_at.eq(Utc::now()),
            ))
            .execute(&mut *self.conn)
            .await
            .map_err(map_diesel_error("set_selection_quantity"))?;
        if updated == 0 {
            return Err(LendingError::SelectionNotFound(item));
        }
        Ok(())
    }

    async fn delete_selection(&mut self, user: UserId, item: ItemId) -> LendingResult<()> {
        diesel::delete(pending_selections::table.find((user.0, item.0)))
            .execute(&mut *self.conn)
            .await
            .map_err(map_diesel_error("delete_selection"))?;
        Ok(())
    }

    async fn selections(&mut self, user: UserId) -> LendingResult<Vec<SelectionWithItem>> {
        let rows = pending_selections::table
            .inner_join(items::table)
            .filter(pending_selections::user_id.eq(user.0))
            .order((items::title.asc(), items::id.asc()))
            .load::<(SelectionRow, ItemRow)>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("selections"))?;
        Ok(rows
            .into_iter()
            .map(|(selection, item)| SelectionWithItem {
                selection: selection.into(),
                item: item.into(),
            })
            .collect())
    }

    async fn clear_selections(&mut self, user: UserId) -> LendingResult<usize> {
        diesel::delete(pending_selections::table.filter(pending_selections::user_id.eq(user.0)))
            .execute(&mut *self.conn)
            .await
            .map_err(map_diesel_error("clear_selections"))
    }

    async fn append_entry(&mut self, entry: NewLedgerEntry) -> LendingResult<LedgerEntry> {
        let row = diesel::insert_into(ledger_entries::table)
            .values(&NewLedgerRow::new(&entry, Utc::now()))
            .get_result::<LedgerRow>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("append_entry"))?;
        LedgerEntry::try_from(row)
    }

    async fn totals(&mut self, user: UserId, item: ItemId) -> LendingResult<LedgerTotals> {
        let row = diesel::sql_query(TOTALS_SQL)
            .bind::<SqlUuid, _>(user.0)
            .bind::<SqlUuid, _>(item.0)
            .get_result::<TotalsRow>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("totals"))?;
        Ok(row.into())
    }

    async fn item_totals(&mut self, user: UserId) -> LendingResult<Vec<(Item, LedgerTotals)>> {
        let rows = diesel::sql_query(ITEM_TOTALS_SQL)
            .bind::<SqlUuid, _>(user.0)
            .load::<ItemTotalsRow>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("item_totals"))?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn outstanding(&mut self) -> LendingResult<OutstandingTotals> {
        let row = diesel::sql_query(OUTSTANDING_SQL)
            .get_result::<OutstandingRow>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("outstanding"))?;
        Ok(row.into())
    }

    async fn history(&mut self, user: UserId) -> LendingResult<Vec<LedgerEntry>> {
        let rows = ledger_entries::table
            .filter(ledger_entries::user_id.eq(user.0))
            .order((ledger_entries::created_at.desc(), ledger_entries::id.desc()))
            .load::<LedgerRow>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("history"))?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn all_history(&mut self) -> LendingResult<Vec<LedgerEntry>> {
        let rows = ledger_entries::table
            .order((ledger_entries::created_at.desc(), ledger_entries::id.desc()))
            .load::<LedgerRow>(&mut *self.conn)
            .await
            .map_err(map_diesel_error("all_history"))?;
        rows.into_iter().map(LedgerEntry::try_from).collect()
    }

    async fn commit(mut self) -> LendingResult<()> {
        AnsiTransactionManager::commit_transaction(&mut *self.conn)
            .await
            .map_err(map_diesel_error("commit"))
    }

    async fn rollback(mut self) -> LendingResult<()> {
        AnsiTransactionManager::rollback_transaction(&mut *self.conn)
            .await
            .map_err(map_diesel_error("rollback"))
    }
}
