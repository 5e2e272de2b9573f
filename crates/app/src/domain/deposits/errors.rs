//! Deposits service errors.

use passbook::{deposits::LedgerError, money::MoneyError};
use thiserror::Error;

use crate::{database::DbError, retry::Retryable};

#[derive(Debug, Error)]
pub enum DepositsServiceError {
    #[error("deposit already exists")]
    AlreadyExists,

    #[error("deposit not found")]
    NotFound,

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("storage error")]
    Db(#[from] DbError),

    #[error("wallet is busy, gave up after {attempts} attempts")]
    Busy { attempts: u32 },
}

impl Retryable for DepositsServiceError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Db(error) if error.is_transient())
    }

    fn exhausted(self, attempts: u32) -> Self {
        Self::Busy { attempts }
    }
}
