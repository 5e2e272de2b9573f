//! Bookings service errors.

use passbook::{
    bookings::BookingError,
    ids::{StockUuid, UserUuid},
    money::{Amount, MoneyError},
    stocks::ReservationError,
};
use thiserror::Error;

use crate::{consistency::ConsistencyError, database::DbError, retry::Retryable};

#[derive(Debug, Error)]
pub enum BookingsServiceError {
    #[error("booking not found")]
    NotFound,

    #[error("stock {0} not found")]
    StockNotFound(StockUuid),

    #[error("user {0} has no deposit")]
    DepositNotFound(UserUuid),

    #[error("deposit has expired")]
    DepositExpired,

    #[error("insufficient funds: {required} required, {available} available")]
    InsufficientFunds { required: Amount, available: Amount },

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Transition(#[from] BookingError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("storage error")]
    Db(#[from] DbError),

    #[error("booking is busy, gave up after {attempts} attempts")]
    Busy { attempts: u32 },
}

impl Retryable for BookingsServiceError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Db(error) if error.is_transient())
    }

    fn exhausted(self, attempts: u32) -> Self {
        Self::Busy { attempts }
    }
}
