//! Bookings

pub mod errors;
mod repository;
pub mod service;

pub use errors::BookingsServiceError;
pub(crate) use repository::MemBookingsRepository;
pub use service::*;
