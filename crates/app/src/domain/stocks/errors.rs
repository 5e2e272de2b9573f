//! Stocks service errors.

use passbook::stocks::{ReservationError, StockError};
use thiserror::Error;

use crate::{consistency::ConsistencyError, database::DbError, retry::Retryable};

#[derive(Debug, Error)]
pub enum StocksServiceError {
    #[error("stock already exists")]
    AlreadyExists,

    #[error("stock not found")]
    NotFound,

    #[error("invalid stock")]
    Invalid(#[from] StockError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Consistency(#[from] ConsistencyError),

    #[error("storage error")]
    Db(#[from] DbError),

    #[error("stock is busy, gave up after {attempts} attempts")]
    Busy { attempts: u32 },
}

impl Retryable for StocksServiceError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Db(error) if error.is_transient())
    }

    fn exhausted(self, attempts: u32) -> Self {
        Self::Busy { attempts }
    }
}
