//! Bookings
//!
//! The booking state machine. A booking starts `Confirmed`, may become `Used`,
//! `Cancelled` or `Reimbursed`, and never leaves `Cancelled` or `Reimbursed`
//! through an ordinary transition. Re-applying a transition that already holds
//! returns [`Transition::Unchanged`] instead of failing.

use std::fmt::{self, Display};

use jiff::{SignedDuration, Timestamp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    ids::{BookingUuid, DepositUuid, StockUuid, UserUuid, VenueUuid},
    incidents::{FinanceIncident, latest_validated_total},
    money::{Amount, MoneyError},
    stocks::Stock,
};

/// Booking lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    /// Reserved, not yet collected.
    Confirmed,

    /// Collected by the beneficiary.
    Used,

    /// Cancelled; frees capacity and credit.
    Cancelled,

    /// Paid back to the venue.
    Reimbursed,
}

impl BookingStatus {
    /// Whether a booking in this state counts against its stock's capacity.
    #[must_use]
    pub const fn holds_capacity(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Confirmed => "confirmed",
            Self::Used => "used",
            Self::Cancelled => "cancelled",
            Self::Reimbursed => "reimbursed",
        };

        f.write_str(label)
    }
}

/// Why a booking was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancellationReason {
    /// Cancelled by the beneficiary.
    Beneficiary,

    /// Cancelled by the venue.
    Offerer,

    /// Never collected in time.
    Expired,

    /// Fraud handling.
    Fraud,

    /// Back-office operation.
    Backoffice,

    /// A validated total overpayment incident.
    FinanceIncident,
}

/// Who is asking for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAuthority {
    /// The beneficiary; bound by the cancellation limit date.
    Beneficiary,

    /// The venue.
    Offerer,

    /// Back-office override, the only authority allowed to cancel a used
    /// booking.
    Admin,
}

/// Who validated a booking as used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationAuthor {
    /// The venue (counter mark, QR code scan).
    Offerer,

    /// A back-office operator.
    Backoffice,

    /// The system, once the event is over.
    Auto,
}

/// What drives a `Confirmed → Used` transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UseTrigger {
    /// Time based; only allowed once the event has begun.
    Automatic,

    /// An explicit validation action, allowed at any time.
    Validation(ValidationAuthor),
}

/// Outcome of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The booking changed state.
    Applied,

    /// The booking was already in the target state.
    Unchanged,
}

impl Transition {
    /// Whether the transition changed anything.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Booking state machine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BookingError {
    /// Bookings must reserve at least one unit.
    #[error("booking quantity must be positive")]
    InvalidQuantity,

    /// The requested transition is not allowed from the current state.
    #[error("cannot move booking from {from} to {to}")]
    IllegalTransition {
        /// Current state.
        from: BookingStatus,
        /// Requested state.
        to: BookingStatus,
    },

    /// Used bookings may only be cancelled by an administrator.
    #[error("booking was already used")]
    BookingAlreadyUsed,

    /// An automatic use was requested before the event began.
    #[error("event has not started yet, it begins at {0}")]
    EventNotStarted(Timestamp),

    /// The beneficiary can no longer cancel.
    #[error("cancellation limit date {0} has passed")]
    CancellationLimitPassed(Timestamp),

    /// A date computation left the supported range.
    #[error("date out of range")]
    DateOutOfRange,

    /// Amount arithmetic failed.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// Delays bounding when a beneficiary may cancel a timed booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationDelays {
    /// How long before the event cancellation closes.
    pub before_event: SignedDuration,

    /// How long after booking cancellation stays open.
    pub after_booking: SignedDuration,
}

impl Default for CancellationDelays {
    fn default() -> Self {
        Self {
            before_event: SignedDuration::from_hours(48),
            after_booking: SignedDuration::from_hours(48),
        }
    }
}

/// Last moment a beneficiary may cancel a booking made at `booked_at`.
///
/// Non-timed stocks have no limit. Otherwise the limit is the earlier of
/// `beginning - before_event` and `booked_at + after_booking`, but never
/// before the booking itself.
///
/// # Errors
///
/// Returns [`BookingError::DateOutOfRange`] if the arithmetic overflows.
pub fn cancellation_limit_date(
    beginning: Option<Timestamp>,
    booked_at: Timestamp,
    delays: &CancellationDelays,
) -> Result<Option<Timestamp>, BookingError> {
    let Some(beginning) = beginning else {
        return Ok(None);
    };

    let before_event = beginning
        .checked_sub(delays.before_event)
        .map_err(|_error| BookingError::DateOutOfRange)?;

    let after_booking = booked_at
        .checked_add(delays.after_booking)
        .map_err(|_error| BookingError::DateOutOfRange)?;

    Ok(Some(before_event.min(after_booking).max(booked_at)))
}

/// Booking
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking identifier
    pub uuid: BookingUuid,

    /// Beneficiary
    pub user: UserUuid,

    /// Booked stock
    pub stock: StockUuid,

    /// Deposit the booking is paid from, `None` for free bookings made
    /// without credit
    pub deposit: Option<DepositUuid>,

    /// Venue of the booked stock
    pub venue: VenueUuid,

    /// Reserved units
    pub quantity: u32,

    /// Unit price frozen at booking time
    pub amount: Amount,

    /// Current state
    pub status: BookingStatus,

    /// Booking time
    pub created_at: Timestamp,

    /// When the booking was used
    pub used_at: Option<Timestamp>,

    /// When the booking was cancelled
    pub cancelled_at: Option<Timestamp>,

    /// When the venue was paid back
    pub reimbursed_at: Option<Timestamp>,

    /// Why the booking was cancelled
    pub cancellation_reason: Option<CancellationReason>,

    /// Who marked the booking as used
    pub validation_author: Option<ValidationAuthor>,

    /// Last moment the beneficiary may cancel
    pub cancellation_limit_date: Option<Timestamp>,
}

impl Booking {
    /// Build a confirmed booking on `stock` at its current price.
    ///
    /// No capacity, credit or quantity check happens here; see
    /// [`Booking::create`].
    #[must_use]
    pub fn confirmed(
        uuid: BookingUuid,
        user: UserUuid,
        stock: &Stock,
        deposit: Option<DepositUuid>,
        quantity: u32,
        at: Timestamp,
    ) -> Self {
        Self {
            uuid,
            user,
            stock: stock.uuid,
            deposit,
            venue: stock.venue,
            quantity,
            amount: stock.price,
            status: BookingStatus::Confirmed,
            created_at: at,
            used_at: None,
            cancelled_at: None,
            reimbursed_at: None,
            cancellation_reason: None,
            validation_author: None,
            cancellation_limit_date: None,
        }
    }

    /// Create a confirmed booking, validating the quantity and computing the
    /// cancellation limit date.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::InvalidQuantity`] for a zero quantity, or
    /// [`BookingError::DateOutOfRange`] if the limit date cannot be computed.
    pub fn create(
        uuid: BookingUuid,
        user: UserUuid,
        stock: &Stock,
        deposit: Option<DepositUuid>,
        quantity: u32,
        at: Timestamp,
        delays: &CancellationDelays,
    ) -> Result<Self, BookingError> {
        if quantity == 0 {
            return Err(BookingError::InvalidQuantity);
        }

        let mut booking = Self::confirmed(uuid, user, stock, deposit, quantity, at);
        booking.cancellation_limit_date =
            cancellation_limit_date(stock.beginning_datetime, at, delays)?;

        Ok(booking)
    }

    /// Frozen price times quantity.
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the product is not representable.
    pub fn total_amount(&self) -> Result<Amount, MoneyError> {
        self.amount.times(self.quantity)
    }

    /// Amount used for balance and reimbursement: the corrected total of the
    /// most recently validated finance incident linked to this booking,
    /// otherwise [`Booking::total_amount`].
    ///
    /// # Errors
    ///
    /// Returns [`MoneyError::Overflow`] if the total is not representable.
    pub fn effective_amount<'a>(
        &self,
        incidents: impl IntoIterator<Item = &'a FinanceIncident>,
    ) -> Result<Amount, MoneyError> {
        match latest_validated_total(self.uuid, incidents) {
            Some(total) => Ok(total),
            None => self.total_amount(),
        }
    }

    /// Whether the booking is still confirmed long enough after its event that
    /// it should be marked as used automatically.
    #[must_use]
    pub fn is_due_for_auto_use(&self, beginning: Option<Timestamp>, threshold: Timestamp) -> bool {
        self.status == BookingStatus::Confirmed
            && beginning.is_some_and(|beginning| beginning < threshold)
    }

    /// `Confirmed → Used`.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::EventNotStarted`] for an automatic use before
    /// the event begins, or [`BookingError::IllegalTransition`] if the booking
    /// is cancelled or reimbursed.
    pub fn mark_used(
        &mut self,
        stock: &Stock,
        at: Timestamp,
        trigger: UseTrigger,
    ) -> Result<Transition, BookingError> {
        match self.status {
            BookingStatus::Used => Ok(Transition::Unchanged),
            BookingStatus::Confirmed => {
                let author = match trigger {
                    UseTrigger::Automatic => {
                        match stock.beginning_datetime {
                            Some(beginning) if at < beginning => {
                                return Err(BookingError::EventNotStarted(beginning));
                            }
                            _ => {}
                        }

                        ValidationAuthor::Auto
                    }
                    UseTrigger::Validation(author) => author,
                };

                self.status = BookingStatus::Used;
                self.used_at = Some(at);
                self.validation_author = Some(author);

                Ok(Transition::Applied)
            }
            from @ (BookingStatus::Cancelled | BookingStatus::Reimbursed) => {
                Err(BookingError::IllegalTransition {
                    from,
                    to: BookingStatus::Used,
                })
            }
        }
    }

    /// `Used → Confirmed`, undoing a mistaken validation.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::IllegalTransition`] if the booking is cancelled
    /// or reimbursed.
    pub fn mark_unused(&mut self) -> Result<Transition, BookingError> {
        match self.status {
            BookingStatus::Confirmed => Ok(Transition::Unchanged),
            BookingStatus::Used => {
                self.status = BookingStatus::Confirmed;
                self.used_at = None;
                self.validation_author = None;

                Ok(Transition::Applied)
            }
            from @ (BookingStatus::Cancelled | BookingStatus::Reimbursed) => {
                Err(BookingError::IllegalTransition {
                    from,
                    to: BookingStatus::Confirmed,
                })
            }
        }
    }

    /// `Confirmed → Cancelled`, or `Used → Cancelled` for an administrator.
    ///
    /// # Errors
    ///
    /// - [`BookingError::CancellationLimitPassed`] when a beneficiary cancels
    ///   after the limit date.
    /// - [`BookingError::BookingAlreadyUsed`] when a non-admin cancels a used
    ///   booking.
    /// - [`BookingError::IllegalTransition`] for reimbursed bookings.
    pub fn cancel(
        &mut self,
        reason: CancellationReason,
        authority: CancelAuthority,
        at: Timestamp,
    ) -> Result<Transition, BookingError> {
        match self.status {
            BookingStatus::Cancelled => Ok(Transition::Unchanged),
            BookingStatus::Confirmed => {
                if authority == CancelAuthority::Beneficiary {
                    match self.cancellation_limit_date {
                        Some(limit) if at > limit => {
                            return Err(BookingError::CancellationLimitPassed(limit));
                        }
                        _ => {}
                    }
                }

                self.apply_cancellation(reason, at);

                Ok(Transition::Applied)
            }
            BookingStatus::Used if authority == CancelAuthority::Admin => {
                self.apply_cancellation(reason, at);

                Ok(Transition::Applied)
            }
            BookingStatus::Used => Err(BookingError::BookingAlreadyUsed),
            BookingStatus::Reimbursed => Err(BookingError::IllegalTransition {
                from: BookingStatus::Reimbursed,
                to: BookingStatus::Cancelled,
            }),
        }
    }

    /// Cancel a booking whose whole amount was clawed back by a validated
    /// overpayment incident. Unlike [`Booking::cancel`] this also applies to
    /// reimbursed bookings.
    pub fn cancel_for_incident(&mut self, at: Timestamp) -> Transition {
        if self.status == BookingStatus::Cancelled {
            return Transition::Unchanged;
        }

        self.apply_cancellation(CancellationReason::FinanceIncident, at);

        Transition::Applied
    }

    /// `Cancelled → Used`, for bookings cancelled by mistake after the goods
    /// were collected. The caller must re-check capacity and credit.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::IllegalTransition`] unless the booking is
    /// cancelled.
    pub fn uncancel_as_used(&mut self, at: Timestamp) -> Result<Transition, BookingError> {
        match self.status {
            BookingStatus::Used => Ok(Transition::Unchanged),
            BookingStatus::Cancelled => {
                self.status = BookingStatus::Used;
                self.used_at = Some(at);
                self.validation_author = Some(ValidationAuthor::Backoffice);
                self.cancelled_at = None;
                self.cancellation_reason = None;

                Ok(Transition::Applied)
            }
            from @ (BookingStatus::Confirmed | BookingStatus::Reimbursed) => {
                Err(BookingError::IllegalTransition {
                    from,
                    to: BookingStatus::Used,
                })
            }
        }
    }

    /// `Used → Reimbursed`.
    ///
    /// # Errors
    ///
    /// Returns [`BookingError::IllegalTransition`] unless the booking is used.
    pub fn reimburse(&mut self, at: Timestamp) -> Result<Transition, BookingError> {
        match self.status {
            BookingStatus::Reimbursed => Ok(Transition::Unchanged),
            BookingStatus::Used => {
                self.status = BookingStatus::Reimbursed;
                self.reimbursed_at = Some(at);

                Ok(Transition::Applied)
            }
            from @ (BookingStatus::Confirmed | BookingStatus::Cancelled) => {
                Err(BookingError::IllegalTransition {
                    from,
                    to: BookingStatus::Reimbursed,
                })
            }
        }
    }

    fn apply_cancellation(&mut self, reason: CancellationReason, at: Timestamp) {
        self.status = BookingStatus::Cancelled;
        self.cancelled_at = Some(at);
        self.cancellation_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use jiff::ToSpan;
    use testresult::TestResult;

    use crate::ids::VenueUuid;

    use super::*;

    fn new_stock() -> Stock {
        Stock::new(StockUuid::now_v7(), VenueUuid::now_v7(), Amount::from_euros(10))
    }

    fn new_booking(stock: &Stock) -> Booking {
        Booking::confirmed(
            BookingUuid::now_v7(),
            UserUuid::now_v7(),
            stock,
            Some(DepositUuid::now_v7()),
            2,
            Timestamp::UNIX_EPOCH,
        )
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let result = Booking::create(
            BookingUuid::now_v7(),
            UserUuid::now_v7(),
            &new_stock(),
            None,
            0,
            Timestamp::UNIX_EPOCH,
            &CancellationDelays::default(),
        );

        assert_eq!(result, Err(BookingError::InvalidQuantity));
    }

    #[test]
    fn amount_is_frozen_at_booking_time() -> TestResult {
        let mut stock = new_stock();
        let booking = new_booking(&stock);

        stock.price = Amount::from_euros(99);

        assert_eq!(booking.amount, Amount::from_euros(10));
        assert_eq!(booking.total_amount()?, Amount::from_euros(20));

        Ok(())
    }

    #[test]
    fn limit_date_is_none_for_non_timed_stock() -> TestResult {
        let limit = cancellation_limit_date(
            None,
            Timestamp::UNIX_EPOCH,
            &CancellationDelays::default(),
        )?;

        assert_eq!(limit, None);

        Ok(())
    }

    #[test]
    fn limit_date_is_two_days_after_booking_for_distant_events() -> TestResult {
        let booked_at = Timestamp::UNIX_EPOCH;
        let beginning = booked_at.checked_add(240.hours())?;

        let limit =
            cancellation_limit_date(Some(beginning), booked_at, &CancellationDelays::default())?;

        assert_eq!(limit, Some(booked_at.checked_add(48.hours())?));

        Ok(())
    }

    #[test]
    fn limit_date_is_two_days_before_close_events() -> TestResult {
        let booked_at = Timestamp::UNIX_EPOCH;
        let beginning = booked_at.checked_add(72.hours())?;

        let limit =
            cancellation_limit_date(Some(beginning), booked_at, &CancellationDelays::default())?;

        assert_eq!(limit, Some(booked_at.checked_add(24.hours())?));

        Ok(())
    }

    #[test]
    fn limit_date_never_precedes_the_booking() -> TestResult {
        let booked_at = Timestamp::UNIX_EPOCH;
        let beginning = booked_at.checked_add(1.hours())?;

        let limit =
            cancellation_limit_date(Some(beginning), booked_at, &CancellationDelays::default())?;

        assert_eq!(limit, Some(booked_at));

        Ok(())
    }

    #[test]
    fn automatic_use_requires_the_event_to_have_begun() -> TestResult {
        let beginning = Timestamp::UNIX_EPOCH.checked_add(10.hours())?;
        let stock = new_stock().with_beginning(beginning);
        let mut booking = new_booking(&stock);

        assert_eq!(
            booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic),
            Err(BookingError::EventNotStarted(beginning))
        );
        assert_eq!(booking.status, BookingStatus::Confirmed);

        assert_eq!(
            booking.mark_used(&stock, beginning, UseTrigger::Automatic)?,
            Transition::Applied
        );
        assert_eq!(booking.validation_author, Some(ValidationAuthor::Auto));
        assert_eq!(booking.used_at, Some(beginning));

        Ok(())
    }

    #[test]
    fn explicit_validation_may_happen_before_the_event() -> TestResult {
        let beginning = Timestamp::UNIX_EPOCH.checked_add(10.hours())?;
        let stock = new_stock().with_beginning(beginning);
        let mut booking = new_booking(&stock);

        let transition = booking.mark_used(
            &stock,
            Timestamp::UNIX_EPOCH,
            UseTrigger::Validation(ValidationAuthor::Offerer),
        )?;

        assert!(transition.is_applied());
        assert_eq!(booking.validation_author, Some(ValidationAuthor::Offerer));

        Ok(())
    }

    #[test]
    fn marking_used_twice_is_a_no_op() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);

        booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic)?;
        let used_at = booking.used_at;

        let later = Timestamp::UNIX_EPOCH.checked_add(1.hours())?;
        assert_eq!(
            booking.mark_used(&stock, later, UseTrigger::Automatic)?,
            Transition::Unchanged
        );
        assert_eq!(booking.used_at, used_at);

        Ok(())
    }

    #[test]
    fn cancelling_twice_is_a_no_op() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);

        let first = booking.cancel(
            CancellationReason::Beneficiary,
            CancelAuthority::Beneficiary,
            Timestamp::UNIX_EPOCH,
        )?;
        let second = booking.cancel(
            CancellationReason::Offerer,
            CancelAuthority::Offerer,
            Timestamp::UNIX_EPOCH,
        )?;

        assert_eq!(first, Transition::Applied);
        assert_eq!(second, Transition::Unchanged);
        assert_eq!(
            booking.cancellation_reason,
            Some(CancellationReason::Beneficiary)
        );

        Ok(())
    }

    #[test]
    fn used_booking_needs_an_admin_to_cancel() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);
        booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic)?;

        assert_eq!(
            booking.cancel(
                CancellationReason::Offerer,
                CancelAuthority::Offerer,
                Timestamp::UNIX_EPOCH
            ),
            Err(BookingError::BookingAlreadyUsed)
        );
        assert_eq!(booking.status, BookingStatus::Used);

        booking.cancel(
            CancellationReason::Fraud,
            CancelAuthority::Admin,
            Timestamp::UNIX_EPOCH,
        )?;
        assert_eq!(booking.status, BookingStatus::Cancelled);

        Ok(())
    }

    #[test]
    fn reimbursed_booking_cannot_be_cancelled() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);
        booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic)?;
        booking.reimburse(Timestamp::UNIX_EPOCH)?;

        assert_eq!(
            booking.cancel(
                CancellationReason::Fraud,
                CancelAuthority::Admin,
                Timestamp::UNIX_EPOCH
            ),
            Err(BookingError::IllegalTransition {
                from: BookingStatus::Reimbursed,
                to: BookingStatus::Cancelled,
            })
        );
        assert_eq!(booking.status, BookingStatus::Reimbursed);

        Ok(())
    }

    #[test]
    fn beneficiary_cannot_cancel_after_the_limit_date() -> TestResult {
        let booked_at = Timestamp::UNIX_EPOCH;
        let stock = new_stock().with_beginning(booked_at.checked_add(240.hours())?);
        let mut booking = Booking::create(
            BookingUuid::now_v7(),
            UserUuid::now_v7(),
            &stock,
            None,
            1,
            booked_at,
            &CancellationDelays::default(),
        )?;
        let too_late = booked_at.checked_add(49.hours())?;

        assert!(matches!(
            booking.cancel(
                CancellationReason::Beneficiary,
                CancelAuthority::Beneficiary,
                too_late
            ),
            Err(BookingError::CancellationLimitPassed(_))
        ));

        assert!(
            booking
                .cancel(
                    CancellationReason::Offerer,
                    CancelAuthority::Offerer,
                    too_late
                )?
                .is_applied()
        );

        Ok(())
    }

    #[test]
    fn reimburse_requires_a_used_booking() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);

        assert_eq!(
            booking.reimburse(Timestamp::UNIX_EPOCH),
            Err(BookingError::IllegalTransition {
                from: BookingStatus::Confirmed,
                to: BookingStatus::Reimbursed,
            })
        );

        booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic)?;

        assert_eq!(
            booking.reimburse(Timestamp::UNIX_EPOCH)?,
            Transition::Applied
        );
        assert_eq!(
            booking.reimburse(Timestamp::UNIX_EPOCH)?,
            Transition::Unchanged
        );

        Ok(())
    }

    #[test]
    fn mark_unused_reverts_to_confirmed() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);
        booking.mark_used(
            &stock,
            Timestamp::UNIX_EPOCH,
            UseTrigger::Validation(ValidationAuthor::Offerer),
        )?;

        assert_eq!(booking.mark_unused()?, Transition::Applied);
        assert_eq!(booking.status, BookingStatus::Confirmed);
        assert_eq!(booking.used_at, None);
        assert_eq!(booking.validation_author, None);

        Ok(())
    }

    #[test]
    fn reimbursed_booking_cannot_be_marked_unused() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);
        booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic)?;
        booking.reimburse(Timestamp::UNIX_EPOCH)?;

        assert!(matches!(
            booking.mark_unused(),
            Err(BookingError::IllegalTransition { .. })
        ));

        Ok(())
    }

    #[test]
    fn uncancel_restores_a_used_booking() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);
        booking.cancel(
            CancellationReason::Offerer,
            CancelAuthority::Offerer,
            Timestamp::UNIX_EPOCH,
        )?;

        assert_eq!(
            booking.uncancel_as_used(Timestamp::UNIX_EPOCH)?,
            Transition::Applied
        );
        assert_eq!(booking.status, BookingStatus::Used);
        assert_eq!(booking.cancellation_reason, None);
        assert_eq!(booking.validation_author, Some(ValidationAuthor::Backoffice));

        Ok(())
    }

    #[test]
    fn incident_cancellation_applies_to_reimbursed_bookings() -> TestResult {
        let stock = new_stock();
        let mut booking = new_booking(&stock);
        booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic)?;
        booking.reimburse(Timestamp::UNIX_EPOCH)?;

        assert!(booking.cancel_for_incident(Timestamp::UNIX_EPOCH).is_applied());
        assert_eq!(booking.status, BookingStatus::Cancelled);
        assert_eq!(
            booking.cancellation_reason,
            Some(CancellationReason::FinanceIncident)
        );
        assert_eq!(
            booking.cancel_for_incident(Timestamp::UNIX_EPOCH),
            Transition::Unchanged
        );

        Ok(())
    }

    #[test]
    fn auto_use_is_due_only_for_old_confirmed_bookings() -> TestResult {
        let beginning = Timestamp::UNIX_EPOCH;
        let stock = new_stock().with_beginning(beginning);
        let booking = new_booking(&stock);
        let threshold = beginning.checked_add(1.seconds())?;

        assert!(booking.is_due_for_auto_use(Some(beginning), threshold));
        assert!(!booking.is_due_for_auto_use(Some(beginning), beginning));
        assert!(!booking.is_due_for_auto_use(None, threshold));

        Ok(())
    }
}
