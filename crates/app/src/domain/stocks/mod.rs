//! Stocks

pub mod errors;
mod repository;
pub mod service;

pub use errors::StocksServiceError;
pub(crate) use repository::MemStocksRepository;
pub use service::*;
