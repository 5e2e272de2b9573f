//! Finance incidents
//!
//! Post-hoc corrections of what a booking is worth. An incident never touches
//! the booking's frozen amount; once validated, its `new_total_amount` is what
//! [`Booking::effective_amount`] reports.

use std::fmt::{self, Display};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    bookings::{Booking, BookingStatus},
    ids::{BookingUuid, FinanceIncidentUuid, UserUuid, VenueUuid},
    money::{Amount, MoneyError},
};

/// Kind of correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    /// The venue was paid too much; the difference is clawed back.
    Overpayment,

    /// The venue is paid for cancelled bookings as a goodwill gesture.
    CommercialGesture,
}

/// Incident lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    /// Awaiting approval.
    Created,

    /// Approved; amounts are corrected.
    Validated,

    /// Dropped without effect.
    Cancelled,
}

impl IncidentStatus {
    /// Whether the incident still blocks a new incident on its bookings.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Created | Self::Validated)
    }
}

impl Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Created => "created",
            Self::Validated => "validated",
            Self::Cancelled => "cancelled",
        };

        f.write_str(label)
    }
}

/// Incident errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IncidentError {
    /// An incident needs at least one booking.
    #[error("an incident needs at least one booking")]
    NoBookings,

    /// Incidents are raised against a single venue.
    #[error("bookings belong to different venues")]
    VenueMismatch,

    /// Commercial gestures cover bookings of a single stock.
    #[error("bookings belong to different stocks")]
    StockMismatch,

    /// The same booking was listed more than once.
    #[error("booking {0} is listed more than once")]
    DuplicateBooking(BookingUuid),

    /// A booking already has a created or validated incident.
    #[error("booking {0} already has an open incident")]
    OpenIncidentExists(BookingUuid),

    /// The booking is not in a state the incident kind applies to.
    #[error("booking {booking} is {status} and cannot be part of this incident")]
    BookingNotPriced {
        /// Offending booking.
        booking: BookingUuid,
        /// Its current state.
        status: BookingStatus,
    },

    /// Incident amounts must be strictly positive.
    #[error("incident amount {0} must be positive")]
    NonPositiveAmount(Amount),

    /// Cannot claw back more than was priced.
    #[error("incident amount {requested} exceeds priced total {priced}")]
    AmountExceedsPricing {
        /// Requested amount.
        requested: Amount,
        /// Sum of the bookings' totals.
        priced: Amount,
    },

    /// The incident cannot move between these states.
    #[error("cannot move incident from {from} to {to}")]
    IllegalTransition {
        /// Current state.
        from: IncidentStatus,
        /// Requested state.
        to: IncidentStatus,
    },

    /// Validated incidents cannot be cancelled.
    #[error("incident was already validated")]
    AlreadyValidated,

    /// Amount arithmetic failed.
    #[error(transparent)]
    Money(#[from] MoneyError),
}

/// A booking's share of an incident.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingFinanceIncident {
    /// Corrected booking
    pub booking: BookingUuid,

    /// Beneficiary of the booking
    pub beneficiary: UserUuid,

    /// Total used in place of the booking's own once validated
    pub new_total_amount: Amount,
}

/// Finance incident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinanceIncident {
    /// Incident identifier
    pub uuid: FinanceIncidentUuid,

    /// Kind of correction
    pub kind: IncidentKind,

    /// Lifecycle state
    pub status: IncidentStatus,

    /// Venue of every linked booking
    pub venue: VenueUuid,

    /// Free-form description of what triggered the incident
    pub origin: Option<String>,

    /// Creation time
    pub created_at: Timestamp,

    /// Validation time
    pub validated_at: Option<Timestamp>,

    /// Cancellation time
    pub cancelled_at: Option<Timestamp>,

    /// Per-booking corrections
    pub bookings: Vec<BookingFinanceIncident>,
}

type Totals = SmallVec<[i64; 8]>;

impl FinanceIncident {
    /// Raise an overpayment incident clawing `total_amount` back from
    /// `bookings`.
    ///
    /// The clawback is split in proportion to each booking's total, floored to
    /// the cent; leftover cents are taken from the last bookings first. The new
    /// totals always sum to the priced total minus `total_amount`.
    ///
    /// # Errors
    ///
    /// Returns an [`IncidentError`] if the bookings do not share one venue,
    /// already have an open incident, are not used or reimbursed, or if the
    /// amount is not in `(0, priced total]`.
    pub fn overpayment<'a>(
        uuid: FinanceIncidentUuid,
        bookings: &[Booking],
        existing: impl IntoIterator<Item = &'a FinanceIncident>,
        total_amount: Amount,
        origin: Option<String>,
        at: Timestamp,
    ) -> Result<Self, IncidentError> {
        let venue = check_bookings(bookings, existing, |status| {
            matches!(status, BookingStatus::Used | BookingStatus::Reimbursed)
        })?;

        let totals = booking_totals(bookings)?;
        let priced = check_amount(total_amount, &totals)?;

        let clawback = total_amount.to_cents()?;
        let mut shares = totals
            .iter()
            .map(|total| split_cents(clawback, *total, priced))
            .collect::<Result<Totals, _>>()?;

        let mut leftover = clawback - shares.iter().sum::<i64>();
        for (share, total) in shares.iter_mut().zip(&totals).rev() {
            if leftover == 0 {
                break;
            }

            let taken = leftover.min(total - *share);
            *share += taken;
            leftover -= taken;
        }

        let lines = bookings
            .iter()
            .zip(totals.iter().zip(&shares))
            .map(|(booking, (total, share))| BookingFinanceIncident {
                booking: booking.uuid,
                beneficiary: booking.user,
                new_total_amount: Amount::from_cents(total - share),
            })
            .collect();

        Ok(Self::created(uuid, IncidentKind::Overpayment, venue, origin, at, lines))
    }

    /// Raise a commercial gesture paying `amount` to the venue for cancelled
    /// bookings of a single stock. Each booking's new total is the priced total
    /// minus its share of `amount` by quantity, floored to the cent.
    ///
    /// # Errors
    ///
    /// Returns an [`IncidentError`] if the bookings do not share one stock,
    /// already have an open incident, are not cancelled, or if the amount is
    /// not in `(0, priced total]`.
    pub fn commercial_gesture<'a>(
        uuid: FinanceIncidentUuid,
        bookings: &[Booking],
        existing: impl IntoIterator<Item = &'a FinanceIncident>,
        amount: Amount,
        origin: Option<String>,
        at: Timestamp,
    ) -> Result<Self, IncidentError> {
        let venue = check_bookings(bookings, existing, |status| {
            status == BookingStatus::Cancelled
        })?;

        let stock = bookings.first().map(|booking| booking.stock);
        if bookings.iter().any(|booking| Some(booking.stock) != stock) {
            return Err(IncidentError::StockMismatch);
        }

        let totals = booking_totals(bookings)?;
        let priced = check_amount(amount, &totals)?;
        let priced = Amount::from_cents(priced);

        let total_quantity: u64 = bookings
            .iter()
            .map(|booking| u64::from(booking.quantity))
            .sum();

        let lines = bookings
            .iter()
            .map(|booking| -> Result<BookingFinanceIncident, MoneyError> {
                let gesture = amount.share(u64::from(booking.quantity), total_quantity)?;

                Ok(BookingFinanceIncident {
                    booking: booking.uuid,
                    beneficiary: booking.user,
                    new_total_amount: priced.checked_sub(gesture)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::created(
            uuid,
            IncidentKind::CommercialGesture,
            venue,
            origin,
            at,
            lines,
        ))
    }

    fn created(
        uuid: FinanceIncidentUuid,
        kind: IncidentKind,
        venue: VenueUuid,
        origin: Option<String>,
        at: Timestamp,
        bookings: Vec<BookingFinanceIncident>,
    ) -> Self {
        Self {
            uuid,
            kind,
            status: IncidentStatus::Created,
            venue,
            origin,
            created_at: at,
            validated_at: None,
            cancelled_at: None,
            bookings,
        }
    }

    /// The correction for `booking`, if it is part of this incident.
    #[must_use]
    pub fn line_for(&self, booking: BookingUuid) -> Option<&BookingFinanceIncident> {
        self.bookings.iter().find(|line| line.booking == booking)
    }

    /// Whether `booking` is part of this incident.
    #[must_use]
    pub fn covers(&self, booking: BookingUuid) -> bool {
        self.line_for(booking).is_some()
    }

    /// Bookings whose whole amount is clawed back once this incident is
    /// validated. Only overpayments cancel bookings.
    pub fn total_overpayments(&self) -> impl Iterator<Item = BookingUuid> + '_ {
        let overpayment = self.kind == IncidentKind::Overpayment;

        self.bookings
            .iter()
            .filter(move |line| overpayment && !line.new_total_amount.is_positive())
            .map(|line| line.booking)
    }

    /// `Created → Validated`.
    ///
    /// # Errors
    ///
    /// Returns [`IncidentError::IllegalTransition`] for a cancelled incident.
    pub fn validate(&mut self, at: Timestamp) -> Result<bool, IncidentError> {
        match self.status {
            IncidentStatus::Validated => Ok(false),
            IncidentStatus::Created => {
                self.status = IncidentStatus::Validated;
                self.validated_at = Some(at);

                Ok(true)
            }
            IncidentStatus::Cancelled => Err(IncidentError::IllegalTransition {
                from: IncidentStatus::Cancelled,
                to: IncidentStatus::Validated,
            }),
        }
    }

    /// `Created → Cancelled`.
    ///
    /// # Errors
    ///
    /// Returns [`IncidentError::AlreadyValidated`] for a validated incident.
    pub fn cancel(&mut self, at: Timestamp) -> Result<bool, IncidentError> {
        match self.status {
            IncidentStatus::Cancelled => Ok(false),
            IncidentStatus::Created => {
                self.status = IncidentStatus::Cancelled;
                self.cancelled_at = Some(at);

                Ok(true)
            }
            IncidentStatus::Validated => Err(IncidentError::AlreadyValidated),
        }
    }
}

/// Corrected total of the most recently validated incident covering
/// `booking`, if any, whatever its kind.
pub fn latest_validated_total<'a>(
    booking: BookingUuid,
    incidents: impl IntoIterator<Item = &'a FinanceIncident>,
) -> Option<Amount> {
    incidents
        .into_iter()
        .filter(|incident| incident.status == IncidentStatus::Validated)
        .filter_map(|incident| {
            incident
                .line_for(booking)
                .map(|line| (incident.validated_at, line.new_total_amount))
        })
        .max_by_key(|(validated_at, _amount)| *validated_at)
        .map(|(_validated_at, amount)| amount)
}

fn check_bookings<'a>(
    bookings: &[Booking],
    existing: impl IntoIterator<Item = &'a FinanceIncident>,
    priced: impl Fn(BookingStatus) -> bool,
) -> Result<VenueUuid, IncidentError> {
    let Some(first) = bookings.first() else {
        return Err(IncidentError::NoBookings);
    };

    for (index, booking) in bookings.iter().enumerate() {
        if bookings.iter().take(index).any(|earlier| earlier.uuid == booking.uuid) {
            return Err(IncidentError::DuplicateBooking(booking.uuid));
        }
    }

    if bookings.iter().any(|booking| booking.venue != first.venue) {
        return Err(IncidentError::VenueMismatch);
    }

    let open: SmallVec<[&FinanceIncident; 4]> = existing
        .into_iter()
        .filter(|incident| incident.status.is_open())
        .collect();

    for booking in bookings {
        if open.iter().any(|incident| incident.covers(booking.uuid)) {
            return Err(IncidentError::OpenIncidentExists(booking.uuid));
        }

        if !priced(booking.status) {
            return Err(IncidentError::BookingNotPriced {
                booking: booking.uuid,
                status: booking.status,
            });
        }
    }

    Ok(first.venue)
}

fn booking_totals(bookings: &[Booking]) -> Result<Totals, MoneyError> {
    bookings
        .iter()
        .map(|booking| booking.total_amount().and_then(Amount::to_cents))
        .collect()
}

/// Check `0 < amount <= sum(totals)` and return the priced sum in cents.
fn check_amount(amount: Amount, totals: &[i64]) -> Result<i64, IncidentError> {
    if !amount.is_positive() {
        return Err(IncidentError::NonPositiveAmount(amount));
    }

    let priced = totals
        .iter()
        .try_fold(0_i64, |sum, total| sum.checked_add(*total))
        .ok_or(MoneyError::Overflow)?;

    if amount.to_cents()? > priced {
        return Err(IncidentError::AmountExceedsPricing {
            requested: amount,
            priced: Amount::from_cents(priced),
        });
    }

    Ok(priced)
}

fn split_cents(clawback: i64, total: i64, priced: i64) -> Result<i64, MoneyError> {
    if priced == 0 {
        return Ok(0);
    }

    let share = i128::from(clawback)
        .checked_mul(i128::from(total))
        .ok_or(MoneyError::Overflow)?
        .div_euclid(i128::from(priced));

    i64::try_from(share).map_err(|_conversion| MoneyError::Overflow)
}
