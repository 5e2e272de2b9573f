//! Stocks
//!
//! A stock is a bookable, capacity-limited unit of an offer. The capacity guard
//! functions in this module never cache anything: reserved quantities are
//! always recomputed from the bookings handed to them.

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    bookings::Booking,
    ids::{StockUuid, VenueUuid},
    money::Amount,
};

/// Errors raised while defining or editing a stock.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StockError {
    /// The booking window closes after the event has begun.
    #[error("booking limit {limit} is after the event beginning {beginning}")]
    BookingLimitAfterBeginning {
        /// Requested booking limit.
        limit: Timestamp,
        /// Event beginning.
        beginning: Timestamp,
    },

    /// Prices cannot be negative.
    #[error("stock price {0} is negative")]
    NegativePrice(Amount),
}

/// Reasons a reservation or quantity change is refused by the capacity guard.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// The stock was soft-deleted by its venue.
    #[error("stock is no longer available")]
    StockSoftDeleted,

    /// The booking window has closed.
    #[error("booking limit datetime {0} has passed")]
    BookingLimitDatetimePassed(Timestamp),

    /// The event has already started.
    #[error("event already started at {0}")]
    EventAlreadyStarted(Timestamp),

    /// Not enough remaining capacity.
    #[error("too many bookings: requested {requested}, remaining {remaining}")]
    TooManyBookings {
        /// Quantity requested.
        requested: u32,
        /// Quantity still available.
        remaining: u32,
    },

    /// A new quantity would fall below what is already reserved.
    #[error("quantity {requested} is below the {reserved} already reserved")]
    QuantityBelowReserved {
        /// Requested quantity.
        requested: u32,
        /// Quantity currently reserved.
        reserved: u32,
    },
}

/// Stock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stock {
    /// Stock identifier
    pub uuid: StockUuid,

    /// Venue offering the stock
    pub venue: VenueUuid,

    /// Unit price
    pub price: Amount,

    /// Declared capacity, `None` for unlimited stock
    pub quantity: Option<u32>,

    /// Event start, `None` for non-timed offers
    pub beginning_datetime: Option<Timestamp>,

    /// Last moment a booking may be made
    pub booking_limit_datetime: Option<Timestamp>,

    /// Soft-deleted stocks keep their bookings but accept no new ones
    pub is_soft_deleted: bool,
}

impl Stock {
    /// Create an unlimited, non-timed stock.
    #[must_use]
    pub fn new(uuid: StockUuid, venue: VenueUuid, price: Amount) -> Self {
        Self {
            uuid,
            venue,
            price,
            quantity: None,
            beginning_datetime: None,
            booking_limit_datetime: None,
            is_soft_deleted: false,
        }
    }

    /// Limit the stock to `quantity` units.
    #[must_use]
    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = Some(quantity);
        self
    }

    /// Set the event beginning.
    #[must_use]
    pub fn with_beginning(mut self, beginning: Timestamp) -> Self {
        self.beginning_datetime = Some(beginning);
        self
    }

    /// Set the booking limit datetime.
    #[must_use]
    pub fn with_booking_limit(mut self, limit: Timestamp) -> Self {
        self.booking_limit_datetime = Some(limit);
        self
    }

    /// Check the stock's own consistency: positive price, and a booking limit
    /// that does not fall after the event beginning.
    ///
    /// # Errors
    ///
    /// Returns a [`StockError`] describing the first inconsistency found.
    pub fn validate(&self) -> Result<(), StockError> {
        if self.price.is_negative() {
            return Err(StockError::NegativePrice(self.price));
        }

        match (self.booking_limit_datetime, self.beginning_datetime) {
            (Some(limit), Some(beginning)) if limit > beginning => {
                Err(StockError::BookingLimitAfterBeginning { limit, beginning })
            }
            _ => Ok(()),
        }
    }

    /// Whether the stock has a free (zero) price.
    #[must_use]
    pub fn is_free(&self) -> bool {
        !self.price.is_positive()
    }

    /// Remaining units given the current reserved quantity, `None` if unlimited.
    #[must_use]
    pub fn remaining_quantity(&self, reserved: u32) -> Option<u32> {
        self.quantity
            .map(|quantity| quantity.saturating_sub(reserved))
    }

    /// Check whether `requested` units may be reserved at `at`, given the
    /// quantity already `reserved`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ReservationError`] that applies, checking the
    /// soft-deletion flag, the booking limit, the event start and finally the
    /// capacity.
    pub fn check_reservation(
        &self,
        reserved: u32,
        requested: u32,
        at: Timestamp,
    ) -> Result<(), ReservationError> {
        if self.is_soft_deleted {
            return Err(ReservationError::StockSoftDeleted);
        }

        match self.booking_limit_datetime {
            Some(limit) if at > limit => {
                return Err(ReservationError::BookingLimitDatetimePassed(limit));
            }
            _ => {}
        }

        match self.beginning_datetime {
            Some(beginning) if at > beginning => {
                return Err(ReservationError::EventAlreadyStarted(beginning));
            }
            _ => {}
        }

        self.check_capacity(reserved, requested)
    }

    /// Capacity-only part of [`Stock::check_reservation`].
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::TooManyBookings`] when `reserved + requested`
    /// exceeds the declared quantity.
    pub fn check_capacity(&self, reserved: u32, requested: u32) -> Result<(), ReservationError> {
        let Some(quantity) = self.quantity else {
            return Ok(());
        };

        if u64::from(reserved) + u64::from(requested) > u64::from(quantity) {
            return Err(ReservationError::TooManyBookings {
                requested,
                remaining: quantity.saturating_sub(reserved),
            });
        }

        Ok(())
    }

    /// Boolean form of [`Stock::check_reservation`].
    #[must_use]
    pub fn can_reserve(&self, reserved: u32, requested: u32, at: Timestamp) -> bool {
        self.check_reservation(reserved, requested, at).is_ok()
    }

    /// Check that the declared quantity may be changed to `new_quantity`.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::QuantityBelowReserved`] if fewer units than
    /// already reserved would remain.
    pub fn check_quantity_change(
        &self,
        reserved: u32,
        new_quantity: Option<u32>,
    ) -> Result<(), ReservationError> {
        match new_quantity {
            Some(requested) if requested < reserved => {
                Err(ReservationError::QuantityBelowReserved {
                    requested,
                    reserved,
                })
            }
            _ => Ok(()),
        }
    }

    /// Boolean form of [`Stock::check_quantity_change`].
    #[must_use]
    pub fn can_lower_quantity(&self, reserved: u32, new_quantity: u32) -> bool {
        self.check_quantity_change(reserved, Some(new_quantity))
            .is_ok()
    }
}

/// Sum of quantities of the bookings on `stock` that hold capacity.
pub fn reserved_quantity<'a>(
    stock: StockUuid,
    bookings: impl IntoIterator<Item = &'a Booking>,
) -> u32 {
    bookings
        .into_iter()
        .filter(|booking| booking.stock == stock && booking.status.holds_capacity())
        .fold(0_u32, |reserved, booking| {
            reserved.saturating_add(booking.quantity)
        })
}
