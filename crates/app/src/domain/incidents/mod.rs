//! Finance incidents

pub mod errors;
mod repository;
pub mod service;

pub use errors::IncidentsServiceError;
pub(crate) use repository::MemIncidentsRepository;
pub use service::*;
