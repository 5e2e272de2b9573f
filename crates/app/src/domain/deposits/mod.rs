//! Deposits

pub mod errors;
mod repository;
pub mod service;

pub use errors::DepositsServiceError;
pub(crate) use repository::MemDepositsRepository;
pub use service::*;
