//! Consistency layer of the booking engine: a transactional in-memory store
//! with ordered row locks, the services built on it, and their configuration.

pub mod config;
pub mod consistency;
pub mod context;
pub mod database;
pub mod domain;
pub mod engine;
pub mod retry;

#[cfg(test)]
mod test;
