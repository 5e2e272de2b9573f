//! Deposits
//!
//! The deposit ledger. A deposit's face amount never changes; top-ups are
//! appended as [`Recredit`]s and balances are always derived from the
//! bookings paid from the deposit.

use std::fmt::{self, Display};

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    bookings::{Booking, BookingStatus},
    ids::{DepositUuid, RecreditUuid, UserUuid},
    incidents::FinanceIncident,
    money::{Amount, MoneyError},
};

/// Deposit ledger errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Recredits must add credit.
    #[error("recredit amount {0} must be positive")]
    NonPositiveRecredit(Amount),

    /// Deposits cannot start negative.
    #[error("deposit amount {0} is negative")]
    NegativeDeposit(Amount),

    /// The user already received this grant.
    #[error("user already received a {0} deposit")]
    AlreadyGranted(DepositType),

    /// The user still has credit that has not expired.
    #[error("deposit {0} is still active")]
    ActiveDepositExists(DepositUuid),

    /// A date computation left the supported range.
    #[error("date out of range")]
    DateOutOfRange,

    /// Amount arithmetic failed.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Grant tier of a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositType {
    /// Age-based grant for 15 to 17 year olds.
    Grant15To17,

    /// Age-based grant for 17 and 18 year olds.
    Grant17To18,

    /// Grant for 18 year olds.
    Grant18,

    /// Free-offer only grant, no spendable credit.
    GrantFree,
}

impl Display for DepositType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Grant15To17 => "grant_15_17",
            Self::Grant17To18 => "grant_17_18",
            Self::Grant18 => "grant_18",
            Self::GrantFree => "grant_free",
        };

        f.write_str(label)
    }
}

/// Why credit was added to a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecreditType {
    /// Yearly top-up at 15.
    Recredit15,

    /// Yearly top-up at 16.
    Recredit16,

    /// Yearly top-up at 17.
    Recredit17,

    /// Top-up at 18.
    Recredit18,

    /// Manual back-office correction.
    ManualModification,

    /// Credit carried over from an earlier deposit.
    PreviousDeposit,

    /// Credit given back after a finance incident.
    FinanceIncidentRecredit,
}

/// Whether a deposit still grants new spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositState {
    /// Credit may still be spent.
    Active,

    /// Expiration date reached.
    Expired,
}

/// Which bookings count as consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceScope {
    /// Confirmed, used and reimbursed bookings: the gate for new bookings.
    Committed,

    /// Used and reimbursed bookings only: what was actually spent.
    Spent,
}

impl BalanceScope {
    /// Scope selected by the `only_used_and_reimbursed` flag.
    #[must_use]
    pub const fn from_only_used_and_reimbursed(only_used_and_reimbursed: bool) -> Self {
        if only_used_and_reimbursed {
            Self::Spent
        } else {
            Self::Committed
        }
    }

    /// Whether a booking in `status` is counted.
    #[must_use]
    pub const fn includes(self, status: BookingStatus) -> bool {
        match self {
            Self::Committed => matches!(
                status,
                BookingStatus::Confirmed | BookingStatus::Used | BookingStatus::Reimbursed
            ),
            Self::Spent => matches!(status, BookingStatus::Used | BookingStatus::Reimbursed),
        }
    }
}

/// Deposit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Deposit identifier
    pub uuid: DepositUuid,

    /// Owning beneficiary
    pub user: UserUuid,

    /// Face value
    pub amount: Amount,

    /// Moment the deposit stops granting new spend, `None` for never
    pub expiration_date: Option<Timestamp>,

    /// Grant tier
    pub kind: DepositType,

    /// Grant time
    pub created_at: Timestamp,
}

/// Recredit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recredit {
    /// Recredit identifier
    pub uuid: RecreditUuid,

    /// Credited deposit
    pub deposit: DepositUuid,

    /// Added credit
    pub amount: Amount,

    /// Reason for the top-up
    pub kind: RecreditType,

    /// Operator comment
    pub comment: Option<String>,

    /// Creation time
    pub created_at: Timestamp,

    /// Soft-deletion time; deleted recredits grant nothing
    pub deleted_at: Option<Timestamp>,
}

/// A derived balance: credit granted minus consumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Balance {
    /// Credit available to the computation.
    pub credit: Amount,

    /// Effective amounts of the counted bookings.
    pub consumed: Amount,
}

impl Balance {
    /// Signed remainder; negative once consumption exceeds credit.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the difference is not representable.
    pub fn remaining(&self) -> Result<Amount, MoneyError> {
        self.credit.checked_sub(self.consumed)
    }

    /// Remainder as reported to users, never below zero.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the difference is not representable.
    pub fn reported(&self) -> Result<Amount, MoneyError> {
        self.remaining().map(Amount::clamp_to_zero)
    }

    /// Whether `amount` more can be consumed without going negative.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the arithmetic is not representable.
    pub fn covers(&self, amount: Amount) -> Result<bool, MoneyError> {
        Ok(!self.remaining()?.checked_sub(amount)?.is_negative())
    }
}

impl Deposit {
    /// Create a non-expiring deposit.
    #[must_use]
    pub fn new(
        uuid: DepositUuid,
        user: UserUuid,
        amount: Amount,
        kind: DepositType,
        created_at: Timestamp,
    ) -> Self {
        Self {
            uuid,
            user,
            amount,
            expiration_date: None,
            kind,
            created_at,
        }
    }

    /// Set the expiration date.
    #[must_use]
    pub fn with_expiration(mut self, expiration_date: Timestamp) -> Self {
        self.expiration_date = Some(expiration_date);
        self
    }

    /// Whether the deposit has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expiration_date
            .is_some_and(|expiration| expiration <= now)
    }

    /// State of the deposit at `now`.
    #[must_use]
    pub fn expire_if_needed(&self, now: Timestamp) -> DepositState {
        if self.is_expired(now) {
            DepositState::Expired
        } else {
            DepositState::Active
        }
    }

    /// Expire the deposit immediately by moving its expiration date one second
    /// before `now`. Past consumption is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DateOutOfRange`] if `now` is the earliest
    /// representable instant.
    pub fn expire(&mut self, now: Timestamp) -> Result<(), LedgerError> {
        let expiration = now
            .checked_sub(SignedDuration::from_secs(1))
            .map_err(|_error| LedgerError::DateOutOfRange)?;

        self.expiration_date = Some(expiration);

        Ok(())
    }

    /// Face amount plus every non-deleted recredit of this deposit, regardless
    /// of expiration.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the sum is not representable.
    pub fn granted_amount<'a>(
        &self,
        recredits: impl IntoIterator<Item = &'a Recredit>,
    ) -> Result<Amount, MoneyError> {
        recredits
            .into_iter()
            .filter(|recredit| recredit.deposit == self.uuid && recredit.deleted_at.is_none())
            .try_fold(self.amount, |granted, recredit| {
                granted.checked_add(recredit.amount)
            })
    }

    /// Credit the deposit grants at `now`: zero once expired, the granted
    /// amount otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the sum is not representable.
    pub fn effective_amount<'a>(
        &self,
        recredits: impl IntoIterator<Item = &'a Recredit>,
        now: Timestamp,
    ) -> Result<Amount, MoneyError> {
        match self.expire_if_needed(now) {
            DepositState::Expired => Ok(Amount::ZERO),
            DepositState::Active => self.granted_amount(recredits),
        }
    }

    /// Build a recredit for this deposit. The deposit itself is not touched.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NonPositiveRecredit`] for zero or negative
    /// amounts.
    pub fn recredit(
        &self,
        uuid: RecreditUuid,
        amount: Amount,
        kind: RecreditType,
        comment: Option<String>,
        at: Timestamp,
    ) -> Result<Recredit, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::NonPositiveRecredit(amount));
        }

        Ok(Recredit {
            uuid,
            deposit: self.uuid,
            amount,
            kind,
            comment,
            created_at: at,
            deleted_at: None,
        })
    }
}

/// Sum of the effective amounts of the bookings paid from `deposit` that
/// `scope` counts.
///
/// # Errors
///
/// Returns [`MoneyError::Overflow`] if the sum is not representable.
pub fn consumed<'a>(
    deposit: DepositUuid,
    bookings: impl IntoIterator<Item = &'a Booking>,
    incidents: &[FinanceIncident],
    scope: BalanceScope,
) -> Result<Amount, MoneyError> {
    bookings
        .into_iter()
        .filter(|booking| booking.deposit == Some(deposit) && scope.includes(booking.status))
        .try_fold(Amount::ZERO, |consumed, booking| {
            consumed.checked_add(booking.effective_amount(incidents)?)
        })
}

/// Derive the balance of `deposit` at `now`.
///
/// # Errors
///
/// Returns [`MoneyError::Overflow`] if a sum is not representable.
pub fn balance<'a>(
    deposit: &Deposit,
    recredits: impl IntoIterator<Item = &'a Recredit>,
    bookings: impl IntoIterator<Item = &'a Booking>,
    incidents: &[FinanceIncident],
    scope: BalanceScope,
    now: Timestamp,
) -> Result<Balance, MoneyError> {
    Ok(Balance {
        credit: deposit.effective_amount(recredits, now)?,
        consumed: consumed(deposit.uuid, bookings, incidents, scope)?,
    })
}

/// Check that `user` may receive a new deposit of `kind` at `now`, given the
/// deposits they already hold.
///
/// # Errors
///
/// Returns [`LedgerError::AlreadyGranted`] if a deposit of the same kind
/// exists, or [`LedgerError::ActiveDepositExists`] if an earlier deposit has
/// not expired yet.
pub fn check_new_grant<'a>(
    existing: impl IntoIterator<Item = &'a Deposit>,
    kind: DepositType,
    amount: Amount,
    now: Timestamp,
) -> Result<(), LedgerError> {
    if amount.is_negative() {
        return Err(LedgerError::NegativeDeposit(amount));
    }

    for deposit in existing {
        if deposit.kind == kind {
            return Err(LedgerError::AlreadyGranted(kind));
        }

        if !deposit.is_expired(now) {
            return Err(LedgerError::ActiveDepositExists(deposit.uuid));
        }
    }

    Ok(())
}
