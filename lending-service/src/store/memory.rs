use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use shared::*;
use tokio::sync::{Mutex as ScopeMutex, OwnedMutexGuard};
use tokio::task::yield_now;

use super::{LendingStore, LockScope, StoreTx};

#[derive(Debug, Default)]
struct MemoryState {
    items: HashMap<ItemId, Item>,
    selections: HashMap<(UserId, ItemId), i32>,
    ledger: Vec<LedgerEntry>,
    next_entry_id: i64,
}

/// In-memory store.
///
/// Behaves like the Postgres store rather than like a single lock: only
/// transactions opened with the same [`LockScope`] exclude each other, stock
/// and cart writes land on the shared state immediately (and are undone on
/// rollback), and ledger appends become visible on commit. Every call yields
/// once, like a round trip, so concurrent transactions really interleave.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    scopes: Arc<Mutex<HashMap<LockScope, Arc<ScopeMutex<()>>>>>,
    fail_appends: Arc<AtomicBool>,
}

fn lock(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_items(items: impl IntoIterator<Item = Item>) -> Self {
        let store = Self::default();
        {
            let mut state = lock(&store.state);
            for item in items {
                state.items.insert(item.id, item);
            }
        }
        store
    }

    pub async fn item_snapshot(&self, item: ItemId) -> Option<Item> {
        lock(&self.state).items.get(&item).cloned()
    }

    pub async fn selection_snapshot(&self, user: UserId, item: ItemId) -> Option<i32> {
        lock(&self.state).selections.get(&(user, item)).copied()
    }

    pub async fn ledger_len(&self) -> usize {
        lock(&self.state).ledger.len()
    }

    /// Make every subsequent ledger append fail with `StoreUnavailable`.
    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    fn scope_mutex(&self, scope: LockScope) -> Arc<ScopeMutex<()>> {
        let mut scopes = self.scopes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        scopes.entry(scope).or_default().clone()
    }
}

#[async_trait]
impl LendingStore for MemoryStore {
    type Tx = MemoryTx;

    async fn begin(&self, scope: LockScope) -> LendingResult<MemoryTx> {
        let scope_guard = match scope {
            LockScope::Read => None,
            scope => Some(self.scope_mutex(scope).lock_owned().await),
        };
        Ok(MemoryTx {
            state: self.state.clone(),
            _scope_guard: scope_guard,
            undo: Vec::new(),
            staged: Vec::new(),
            fail_appends: self.fail_appends.load(Ordering::SeqCst),
        })
    }

    async fn put_item(&self, item: Item) -> LendingResult<()> {
        lock(&self.state).items.insert(item.id, item);
        Ok(())
    }
}

enum Undo {
    Stock(ItemId, i32),
    Selection((UserId, ItemId), Option<i32>),
}

/// Open memory transaction. Dropping it without commit rolls it back.
pub struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    _scope_guard: Option<OwnedMutexGuard<()>>,
    undo: Vec<Undo>,
    staged: Vec<LedgerEntry>,
    fail_appends: bool,
}

impl MemoryTx {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock(&self.state)
    }

    /// Committed ledger plus this transaction's own appends.
    fn visible_entries(&self, mut keep: impl FnMut(&LedgerEntry) -> bool) -> Vec<LedgerEntry> {
        let mut entries: Vec<LedgerEntry> = self
            .state()
            .ledger
            .iter()
            .filter(|e| keep(*e))
            .cloned()
            .collect();
        entries.extend(self.staged.iter().filter(|e| keep(*e)).cloned());
        entries
    }

    fn set_selection(&mut self, key: (UserId, ItemId), quantity: Option<i32>) {
        let previous = {
            let mut state = self.state();
            match quantity {
                Some(quantity) => state.selections.insert(key, quantity),
                None => state.selections.remove(&key),
            }
        };
        self.undo.push(Undo::Selection(key, previous));
    }

    fn undo_all(&mut self) {
        let undo = std::mem::take(&mut self.undo);
        self.staged.clear();
        if undo.is_empty() {
            return;
        }
        let mut state = lock(&self.state);
        for step in undo.into_iter().rev() {
            match step {
                Undo::Stock(item, delta) => {
                    if let Some(row) = state.items.get_mut(&item) {
                        row.available_quantity -= delta;
                    }
                }
                Undo::Selection(key, Some(quantity)) => {
                    state.selections.insert(key, quantity);
                }
                Undo::Selection(key, None) => {
                    state.selections.remove(&key);
                }
            }
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.undo_all();
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn item(&mut self, item: ItemId) -> LendingResult<Option<Item>> {
        yield_now().await;
        Ok(self.state().items.get(&item).cloned())
    }

    async fn try_reserve(&mut self, item: ItemId, quantity: i32) -> LendingResult<bool> {
        yield_now().await;
        let reserved = match self.state().items.get_mut(&item) {
            Some(row) if row.available_quantity >= quantity => {
                row.available_quantity -= quantity;
                true
            }
            _ => false,
        };
        if reserved {
            self.undo.push(Undo::Stock(item, -quantity));
        }
        Ok(reserved)
    }

    async fn release(&mut self, item: ItemId, quantity: i32) -> LendingResult<()> {
        yield_now().await;
        self.state()
            .items
            .get_mut(&item)
            .ok_or(LendingError::ItemNotFound(item))?
            .available_quantity += quantity;
        self.undo.push(Undo::Stock(item, quantity));
        Ok(())
    }

    async fn selection(&mut self, user: UserId, item: ItemId) -> LendingResult<Option<PendingSelection>> {
        yield_now().await;
        Ok(self
            .state()
            .selections
            .get(&(user, item))
            .map(|quantity| PendingSelection {
                user_id: user,
                item_id: item,
                quantity: *quantity,
            }))
    }

    async fn increment_selection(&mut self, user: UserId, item: ItemId) -> LendingResult<PendingSelection> {
        yield_now().await;
        let current = self.state().selections.get(&(user, item)).copied();
        let quantity = current.unwrap_or(0) + 1;
        self.set_selection((user, item), Some(quantity));
        Ok(PendingSelection {
            user_id: user,
            item_id: item,
            quantity,
        })
    }

    async fn set_selection_quantity(&mut self, user: UserId, item: ItemId, quantity: i32) -> LendingResult<()> {
        yield_now().await;
        if !self.state().selections.contains_key(&(user, item)) {
            return Err(LendingError::SelectionNotFound(item));
        }
        self.set_selection((user, item), Some(quantity));
        Ok(())
    }

    async fn delete_selection(&mut self, user: UserId, item: ItemId) -> LendingResult<()> {
        yield_now().await;
        if self.state().selections.contains_key(&(user, item)) {
            self.set_selection((user, item), None);
        }
        Ok(())
    }

    async fn selections(&mut self, user: UserId) -> LendingResult<Vec<SelectionWithItem>> {
        yield_now().await;
        let state = self.state();
        let mut out = Vec::new();
        for ((owner, item_id), quantity) in &state.selections {
            if *owner != user {
                continue;
            }
            let item = state
                .items
                .get(item_id)
                .cloned()
                .ok_or(LendingError::ItemNotFound(*item_id))?;
            out.push(SelectionWithItem {
                selection: PendingSelection {
                    user_id: user,
                    item_id: *item_id,
                    quantity: *quantity,
                },
                item,
            });
        }
        out.sort_by(|a, b| {
            a.item
                .title
                .cmp(&b.item.title)
                .then(a.item.id.cmp(&b.item.id))
        });
        Ok(out)
    }

    async fn clear_selections(&mut self, user: UserId) -> LendingResult<usize> {
        yield_now().await;
        let keys: Vec<(UserId, ItemId)> = self
            .state()
            .selections
            .keys()
            .filter(|(owner, _)| *owner == user)
            .copied()
            .collect();
        for key in &keys {
            self.set_selection(*key, None);
        }
        Ok(keys.len())
    }

    async fn append_entry(&mut self, entry: NewLedgerEntry) -> LendingResult<LedgerEntry> {
        yield_now().await;
        if self.fail_appends {
            return Err(LendingError::store_unavailable("ledger append failed"));
        }
        let id = {
            let mut state = self.state();
            state.next_entry_id += 1;
            state.next_entry_id
        };
        let stored = LedgerEntry {
            id,
            user_id: entry.user_id,
            item_id: entry.item_id,
            quantity: entry.quantity,
            kind: entry.kind,
            created_at: Utc::now(),
        };
        self.staged.push(stored.clone());
        Ok(stored)
    }

    async fn totals(&mut self, user: UserId, item: ItemId) -> LendingResult<LedgerTotals> {
        yield_now().await;
        let entries = self.visible_entries(|e| e.user_id == user && e.item_id == item);
        Ok(LedgerTotals::from_entries(&entries))
    }

    async fn item_totals(&mut self, user: UserId) -> LendingResult<Vec<(Item, LedgerTotals)>> {
        yield_now().await;
        let mut totals: HashMap<ItemId, LedgerTotals> = HashMap::new();
        for entry in self.visible_entries(|e| e.user_id == user) {
            totals
                .entry(entry.item_id)
                .or_default()
                .record(entry.kind, entry.quantity);
        }
        let state = self.state();
        let rows = totals
            .into_iter()
            .map(|(item_id, totals)| {
                state
                    .items
                    .get(&item_id)
                    .cloned()
                    .map(|item| (item, totals))
                    .ok_or(LendingError::ItemNotFound(item_id))
            })
            .collect();
        rows
    }

    async fn outstanding(&mut self) -> LendingResult<OutstandingTotals> {
        yield_now().await;
        Ok(OutstandingTotals::from_entries(&self.visible_entries(|_| true)))
    }

    async fn history(&mut self, user: UserId) -> LendingResult<Vec<LedgerEntry>> {
        yield_now().await;
        Ok(newest_first(self.visible_entries(|e| e.user_id == user)))
    }

    async fn all_history(&mut self) -> LendingResult<Vec<LedgerEntry>> {
        yield_now().await;
        Ok(newest_first(self.visible_entries(|_| true)))
    }

    async fn commit(mut self) -> LendingResult<()> {
        let staged = std::mem::take(&mut self.staged);
        self.state().ledger.extend(staged);
        self.undo.clear();
        Ok(())
    }

    async fn rollback(mut self) -> LendingResult<()> {
        self.undo_all();
        Ok(())
    }
}

fn newest_first(mut entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    entries
}
