//! Passbook
//!
//! Booking capacity and wallet consistency rules for a cultural booking
//! marketplace: beneficiaries spend a granted credit to book finite stocks,
//! and every amount is derived from booking rows rather than stored.
//!
//! This crate is pure and synchronous. Transactions, locking and services
//! live in `passbook-app`.

pub mod bookings;
pub mod clock;
pub mod deposits;
pub mod ids;
pub mod incidents;
pub mod money;
pub mod policy;
pub mod prelude;
pub mod stocks;
