//! Finance incidents service errors.

use passbook::{ids::BookingUuid, incidents::IncidentError};
use thiserror::Error;

use crate::{database::DbError, retry::Retryable};

#[derive(Debug, Error)]
pub enum IncidentsServiceError {
    #[error("finance incident not found")]
    NotFound,

    #[error("booking {0} not found")]
    BookingNotFound(BookingUuid),

    #[error(transparent)]
    Incident(#[from] IncidentError),

    #[error("storage error")]
    Db(#[from] DbError),

    #[error("incident is busy, gave up after {attempts} attempts")]
    Busy { attempts: u32 },
}

impl Retryable for IncidentsServiceError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Db(error) if error.is_transient())
    }

    fn exhausted(self, attempts: u32) -> Self {
        Self::Busy { attempts }
    }
}
