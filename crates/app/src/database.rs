//! In-memory transactional store
//!
//! Committed rows live in [`Tables`] behind a read/write lock. A
//! [`Transaction`] holds row locks taken in [`RowKey`] order, stages its writes
//! and overlays them on every read; [`Transaction::commit`] applies them in one
//! step and dropping the transaction discards them.

use std::{
    fmt::{self, Display},
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use passbook::{
    bookings::Booking,
    deposits::{Deposit, Recredit},
    ids::{BookingUuid, DepositUuid, FinanceIncidentUuid, RecreditUuid, StockUuid, UserUuid},
    incidents::FinanceIncident,
    stocks::Stock,
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use thiserror::Error;
use tokio::{
    sync::{Mutex as RowMutex, OwnedMutexGuard, RwLock},
    time::timeout,
};
use tracing::debug;

/// A lockable row. Locks are always acquired in the derived order: stocks,
/// then users, deposits, bookings and finally incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowKey {
    /// A stock and the capacity it guards.
    Stock(StockUuid),

    /// A beneficiary's wallet: which deposit is current and its balance.
    User(UserUuid),

    /// A single deposit.
    Deposit(DepositUuid),

    /// A single booking.
    Booking(BookingUuid),

    /// A single finance incident.
    Incident(FinanceIncidentUuid),
}

impl Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stock(uuid) => write!(f, "stock {uuid}"),
            Self::User(uuid) => write!(f, "user {uuid}"),
            Self::Deposit(uuid) => write!(f, "deposit {uuid}"),
            Self::Booking(uuid) => write!(f, "booking {uuid}"),
            Self::Incident(uuid) => write!(f, "incident {uuid}"),
        }
    }
}

/// Storage errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Another transaction held the row for longer than the lock timeout.
    #[error("timed out waiting for a lock on {0}")]
    LockTimeout(RowKey),

    /// A lock was requested out of order.
    #[error("lock on {requested} requested while holding {held}")]
    LockOrder {
        /// Highest lock currently held.
        held: RowKey,
        /// Lock that was requested.
        requested: RowKey,
    },
}

impl DbError {
    /// Whether retrying the whole transaction may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::LockTimeout(_))
    }
}

/// All stored rows.
#[derive(Debug, Default, Clone)]
pub struct Tables {
    stocks: FxHashMap<StockUuid, Stock>,
    deposits: FxHashMap<DepositUuid, Deposit>,
    recredits: FxHashMap<RecreditUuid, Recredit>,
    bookings: FxHashMap<BookingUuid, Booking>,
    incidents: FxHashMap<FinanceIncidentUuid, FinanceIncident>,
}

impl Tables {
    fn absorb(&mut self, staged: Tables) {
        self.stocks.extend(staged.stocks);
        self.deposits.extend(staged.deposits);
        self.recredits.extend(staged.recredits);
        self.bookings.extend(staged.bookings);
        self.incidents.extend(staged.incidents);
    }
}

/// A type stored in one of the [`Tables`].
pub trait Row: Clone + Send + Sync + 'static {
    /// Primary key.
    type Key: Copy + Eq + Hash + Send + Sync;

    /// Primary key of this row.
    fn key(&self) -> Self::Key;

    /// The table holding rows of this type.
    fn table(tables: &Tables) -> &FxHashMap<Self::Key, Self>;

    /// Mutable access to the table holding rows of this type.
    fn table_mut(tables: &mut Tables) -> &mut FxHashMap<Self::Key, Self>;
}

impl Row for Stock {
    type Key = StockUuid;

    fn key(&self) -> Self::Key {
        self.uuid
    }

    fn table(tables: &Tables) -> &FxHashMap<Self::Key, Self> {
        &tables.stocks
    }

    fn table_mut(tables: &mut Tables) -> &mut FxHashMap<Self::Key, Self> {
        &mut tables.stocks
    }
}

impl Row for Deposit {
    type Key = DepositUuid;

    fn key(&self) -> Self::Key {
        self.uuid
    }

    fn table(tables: &Tables) -> &FxHashMap<Self::Key, Self> {
        &tables.deposits
    }

    fn table_mut(tables: &mut Tables) -> &mut FxHashMap<Self::Key, Self> {
        &mut tables.deposits
    }
}

impl Row for Recredit {
    type Key = RecreditUuid;

    fn key(&self) -> Self::Key {
        self.uuid
    }

    fn table(tables: &Tables) -> &FxHashMap<Self::Key, Self> {
        &tables.recredits
    }

    fn table_mut(tables: &mut Tables) -> &mut FxHashMap<Self::Key, Self> {
        &mut tables.recredits
    }
}

impl Row for Booking {
    type Key = BookingUuid;

    fn key(&self) -> Self::Key {
        self.uuid
    }

    fn table(tables: &Tables) -> &FxHashMap<Self::Key, Self> {
        &tables.bookings
    }

    fn table_mut(tables: &mut Tables) -> &mut FxHashMap<Self::Key, Self> {
        &mut tables.bookings
    }
}

impl Row for FinanceIncident {
    type Key = FinanceIncidentUuid;

    fn key(&self) -> Self::Key {
        self.uuid
    }

    fn table(tables: &Tables) -> &FxHashMap<Self::Key, Self> {
        &tables.incidents
    }

    fn table_mut(tables: &mut Tables) -> &mut FxHashMap<Self::Key, Self> {
        &mut tables.incidents
    }
}

/// Row mutexes exist only while a transaction holds or waits for them.
#[derive(Debug, Default)]
struct LockManager {
    rows: Mutex<FxHashMap<RowKey, Arc<RowMutex<()>>>>,
}

impl LockManager {
    fn row(&self, key: RowKey) -> Arc<RowMutex<()>> {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);

        Arc::clone(rows.entry(key).or_default())
    }

    /// Forget the mutex of `key` once nobody else references it.
    fn release(&self, key: RowKey) {
        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);

        if rows.get(&key).is_some_and(|row| Arc::strong_count(row) == 1) {
            rows.remove(&key);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// A held row lock. Dropping it unlocks the row and prunes its mutex.
#[derive(Debug)]
struct RowGuard {
    key: RowKey,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockManager>,
}

impl Drop for RowGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.key);
    }
}

/// Handle to the store. Cloning is cheap and shares the same rows.
#[derive(Debug, Clone)]
pub struct Db {
    tables: Arc<RwLock<Tables>>,
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl Db {
    /// Create an empty store whose row locks wait at most `lock_timeout`.
    #[must_use]
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            tables: Arc::new(RwLock::new(Tables::default())),
            locks: Arc::new(LockManager::default()),
            lock_timeout,
        }
    }

    /// Begin a transaction holding locks on `rows`, acquired in [`RowKey`]
    /// order whatever order they are given in.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LockTimeout`] if a row stays locked for longer than
    /// the lock timeout. Locks already taken are released.
    pub async fn begin(
        &self,
        rows: impl IntoIterator<Item = RowKey>,
    ) -> Result<Transaction, DbError> {
        let mut keys: SmallVec<[RowKey; 4]> = rows.into_iter().collect();
        keys.sort_unstable();
        keys.dedup();

        let mut tx = Transaction {
            db: self.clone(),
            staged: Tables::default(),
            held: SmallVec::new(),
        };

        for key in keys {
            tx.lock(key).await?;
        }

        Ok(tx)
    }

    /// Read a committed row without locking it.
    pub async fn get<T: Row>(&self, key: T::Key) -> Option<T> {
        let tables = self.tables.read().await;

        T::table(&tables).get(&key).cloned()
    }

    /// Read every committed row matching `filter` without locking.
    pub async fn select<T, F>(&self, filter: F) -> Vec<T>
    where
        T: Row,
        F: Fn(&T) -> bool + Send,
    {
        let tables = self.tables.read().await;

        T::table(&tables)
            .values()
            .filter(|row| filter(row))
            .cloned()
            .collect()
    }
}

/// A unit of work. Reads see committed rows overlaid with this transaction's
/// own writes; nothing is visible to others until [`Transaction::commit`].
#[derive(Debug)]
pub struct Transaction {
    db: Db,
    staged: Tables,
    held: SmallVec<[RowGuard; 4]>,
}

impl Transaction {
    /// Lock one more row. Locking a row already held is a no-op; locking a row
    /// ordered before the highest one held is refused.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::LockOrder`] for out-of-order requests and
    /// [`DbError::LockTimeout`] if the row stays locked too long.
    pub async fn lock(&mut self, key: RowKey) -> Result<(), DbError> {
        if self.holds(key) {
            return Ok(());
        }

        match self.held.last() {
            Some(held) if held.key > key => {
                return Err(DbError::LockOrder {
                    held: held.key,
                    requested: key,
                });
            }
            _ => {}
        }

        let row = self.db.locks.row(key);

        debug!(row = %key, "waiting for row lock");

        let acquired = timeout(self.db.lock_timeout, row.lock_owned()).await;

        let Ok(guard) = acquired else {
            self.db.locks.release(key);

            return Err(DbError::LockTimeout(key));
        };

        debug!(row = %key, "row lock acquired");

        self.held.push(RowGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.db.locks),
        });

        Ok(())
    }

    /// Whether this transaction holds the lock on `key`.
    #[must_use]
    pub fn holds(&self, key: RowKey) -> bool {
        self.held.iter().any(|held| held.key == key)
    }

    /// Read a row, staged version first.
    pub async fn get<T: Row>(&self, key: T::Key) -> Option<T> {
        if let Some(row) = T::table(&self.staged).get(&key) {
            return Some(row.clone());
        }

        self.db.get(key).await
    }

    /// Read the committed version of a row, ignoring staged writes.
    pub async fn committed<T: Row>(&self, key: T::Key) -> Option<T> {
        self.db.get(key).await
    }

    /// Read every row matching `filter`, staged versions replacing committed
    /// ones.
    pub async fn select<T, F>(&self, filter: F) -> Vec<T>
    where
        T: Row,
        F: Fn(&T) -> bool + Send,
    {
        let staged = T::table(&self.staged);
        let tables = self.db.tables.read().await;

        T::table(&tables)
            .iter()
            .filter(|(key, _row)| !staged.contains_key(key))
            .map(|(_key, row)| row)
            .chain(staged.values())
            .filter(|row| filter(row))
            .cloned()
            .collect()
    }

    /// Stage an insert or update.
    pub fn put<T: Row>(&mut self, row: T) {
        T::table_mut(&mut self.staged).insert(row.key(), row);
    }

    /// Rows of one type written by this transaction.
    pub fn staged<T: Row>(&self) -> impl Iterator<Item = &T> + Send {
        T::table(&self.staged).values()
    }

    /// Apply every staged write atomically and release the row locks.
    pub async fn commit(self) {
        let Self { db, staged, held } = self;

        db.tables.write().await.absorb(staged);

        debug!(rows = held.len(), "transaction committed");

        drop(held);
    }
}
