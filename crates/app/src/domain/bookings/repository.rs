//! Bookings Repository

use passbook::{
    bookings::{Booking, BookingStatus},
    ids::{BookingUuid, StockUuid},
};

use crate::database::Transaction;

#[derive(Debug, Clone, Default)]
pub(crate) struct MemBookingsRepository;

impl MemBookingsRepository {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) async fn get_booking(
        &self,
        tx: &Transaction,
        booking: BookingUuid,
    ) -> Option<Booking> {
        tx.get(booking).await
    }

    pub(crate) fn put_booking(&self, tx: &mut Transaction, booking: Booking) {
        tx.put(booking);
    }

    /// Every booking of `stock`, whatever its status.
    pub(crate) async fn bookings_for_stock(
        &self,
        tx: &Transaction,
        stock: StockUuid,
    ) -> Vec<Booking> {
        tx.select(|booking: &Booking| booking.stock == stock).await
    }

    pub(crate) async fn confirmed_bookings(&self, tx: &Transaction) -> Vec<Booking> {
        tx.select(|booking: &Booking| booking.status == BookingStatus::Confirmed)
            .await
    }
}
