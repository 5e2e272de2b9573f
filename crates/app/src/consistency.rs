//! Capacity and balance checks run inside a transaction before it commits.

use jiff::Timestamp;
use passbook::{
    bookings::Booking,
    deposits::{self, BalanceScope, Deposit, Recredit},
    ids::{DepositUuid, StockUuid},
    incidents::FinanceIncident,
    money::{Amount, MoneyError},
    stocks::{Stock, reserved_quantity},
};
use rustc_hash::FxHashSet;
use thiserror::Error;
use tracing::warn;

use crate::database::{RowKey, Transaction};

/// A staged write would break a capacity or balance invariant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConsistencyError {
    /// More units reserved than the stock declares.
    #[error("stock {stock} would hold {reserved} reservations for {quantity} units")]
    CapacityExceeded {
        /// Over-reserved stock.
        stock: StockUuid,
        /// Reserved units after the write.
        reserved: u32,
        /// Declared capacity.
        quantity: u32,
    },

    /// Committed consumption above the deposit's credit.
    #[error("deposit {deposit} would be overdrawn to {remaining}")]
    BalanceOverdrawn {
        /// Overdrawn deposit.
        deposit: DepositUuid,
        /// Signed balance after the write.
        remaining: Amount,
    },

    /// A staged booking points at a stock that does not exist.
    #[error("stock {0} not found")]
    MissingStock(StockUuid),

    /// A staged booking points at a deposit that does not exist.
    #[error("deposit {0} not found")]
    MissingDeposit(DepositUuid),

    /// A row whose invariant is re-checked was not locked by the transaction.
    #[error("{0} was not locked by the transaction")]
    Unlocked(RowKey),

    /// Amount arithmetic failed.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Re-asserts stock capacity and deposit balance for every row a transaction
/// makes tighter.
///
/// Only writes that can break an invariant are checked: stocks that were
/// written, stocks gaining a reservation, and deposits gaining committed
/// consumption. Cancellations, recredits and incidents only ever relax them.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsistencyGuard;

impl ConsistencyGuard {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Check the transaction's view of every affected stock and deposit.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConsistencyError`] found. The caller drops the
    /// transaction, which rolls it back.
    pub async fn check(&self, tx: &Transaction, now: Timestamp) -> Result<(), ConsistencyError> {
        let mut stocks: FxHashSet<StockUuid> = tx.staged::<Stock>().map(|stock| stock.uuid).collect();
        let mut deposits: FxHashSet<DepositUuid> = FxHashSet::default();

        for booking in tx.staged::<Booking>() {
            let before = tx.committed::<Booking>(booking.uuid).await;
            let before = before.as_ref().map(|booking| booking.status);

            if booking.status.holds_capacity() && !before.is_some_and(|status| status.holds_capacity()) {
                stocks.insert(booking.stock);
            }

            let counted = BalanceScope::Committed;
            if let Some(deposit) = booking.deposit {
                if counted.includes(booking.status) && !before.is_some_and(|status| counted.includes(status)) {
                    deposits.insert(deposit);
                }
            }
        }

        for stock in stocks {
            self.check_stock(tx, stock).await?;
        }

        for deposit in deposits {
            self.check_deposit(tx, deposit, now).await?;
        }

        Ok(())
    }

    async fn check_stock(&self, tx: &Transaction, uuid: StockUuid) -> Result<(), ConsistencyError> {
        ensure_locked(tx, RowKey::Stock(uuid))?;

        let stock = tx
            .get::<Stock>(uuid)
            .await
            .ok_or(ConsistencyError::MissingStock(uuid))?;

        let Some(quantity) = stock.quantity else {
            return Ok(());
        };

        let bookings = tx.select::<Booking, _>(|booking| booking.stock == uuid).await;
        let reserved = reserved_quantity(uuid, &bookings);

        if reserved > quantity {
            warn!(stock = %uuid, reserved, quantity, "capacity check failed");

            return Err(ConsistencyError::CapacityExceeded {
                stock: uuid,
                reserved,
                quantity,
            });
        }

        Ok(())
    }

    async fn check_deposit(
        &self,
        tx: &Transaction,
        uuid: DepositUuid,
        now: Timestamp,
    ) -> Result<(), ConsistencyError> {
        ensure_locked(tx, RowKey::Deposit(uuid))?;

        let deposit = tx
            .get::<Deposit>(uuid)
            .await
            .ok_or(ConsistencyError::MissingDeposit(uuid))?;

        let recredits = tx.select::<Recredit, _>(|recredit| recredit.deposit == uuid).await;
        let bookings = tx
            .select::<Booking, _>(|booking| booking.deposit == Some(uuid))
            .await;
        let incidents = tx
            .select::<FinanceIncident, _>(|incident| {
                incident
                    .bookings
                    .iter()
                    .any(|line| line.beneficiary == deposit.user)
            })
            .await;

        let remaining = deposits::balance(
            &deposit,
            &recredits,
            &bookings,
            &incidents,
            BalanceScope::Committed,
            now,
        )?
        .remaining()?;

        if remaining.is_negative() {
            warn!(deposit = %uuid, %remaining, "balance check failed");

            return Err(ConsistencyError::BalanceOverdrawn {
                deposit: uuid,
                remaining,
            });
        }

        Ok(())
    }
}

fn ensure_locked(tx: &Transaction, key: RowKey) -> Result<(), ConsistencyError> {
    if tx.holds(key) {
        Ok(())
    } else {
        Err(ConsistencyError::Unlocked(key))
    }
}
