//! Finance Incidents Repository

use passbook::{
    ids::{BookingUuid, FinanceIncidentUuid},
    incidents::FinanceIncident,
};

use crate::database::Transaction;

#[derive(Debug, Clone, Default)]
pub(crate) struct MemIncidentsRepository;

impl MemIncidentsRepository {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) async fn get_incident(
        &self,
        tx: &Transaction,
        incident: FinanceIncidentUuid,
    ) -> Option<FinanceIncident> {
        tx.get(incident).await
    }

    pub(crate) fn put_incident(&self, tx: &mut Transaction, incident: FinanceIncident) {
        tx.put(incident);
    }

    /// Incidents covering at least one of `bookings`.
    pub(crate) async fn incidents_for_bookings(
        &self,
        tx: &Transaction,
        bookings: &[BookingUuid],
    ) -> Vec<FinanceIncident> {
        tx.select(|incident: &FinanceIncident| {
            bookings.iter().any(|booking| incident.covers(*booking))
        })
        .await
    }
}
