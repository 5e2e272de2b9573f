//! App Context

use std::sync::Arc;

use crate::{
    domain::{
        bookings::{BookingsService, MemBookingsService},
        deposits::{DepositsService, MemDepositsService},
        incidents::{IncidentsService, MemIncidentsService},
        stocks::{MemStocksService, StocksService},
    },
    engine::Engine,
};

#[derive(Clone)]
pub struct AppContext {
    pub stocks: Arc<dyn StocksService>,
    pub deposits: Arc<dyn DepositsService>,
    pub bookings: Arc<dyn BookingsService>,
    pub incidents: Arc<dyn IncidentsService>,
}

impl AppContext {
    /// Build every service over one shared engine.
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            stocks: Arc::new(MemStocksService::new(engine.clone())),
            deposits: Arc::new(MemDepositsService::new(engine.clone())),
            bookings: Arc::new(MemBookingsService::new(engine.clone())),
            incidents: Arc::new(MemIncidentsService::new(engine)),
        }
    }
}
