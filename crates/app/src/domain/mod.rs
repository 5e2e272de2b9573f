//! Passbook Domain Concerns

pub mod bookings;
pub mod deposits;
pub mod incidents;
pub mod stocks;
