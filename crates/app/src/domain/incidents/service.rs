//! Finance Incidents Service

use async_trait::async_trait;
use mockall::automock;
use passbook::{
    bookings::Booking,
    ids::{BookingUuid, FinanceIncidentUuid},
    incidents::{FinanceIncident, IncidentKind},
    money::Amount,
};
use tracing::{error, info};

use crate::{
    database::{RowKey, Transaction},
    domain::{
        bookings::MemBookingsRepository,
        incidents::{IncidentsServiceError, MemIncidentsRepository},
    },
    engine::Engine,
};

#[derive(Debug, Clone)]
pub struct MemIncidentsService {
    engine: Engine,
    incidents: MemIncidentsRepository,
    bookings: MemBookingsRepository,
}

impl MemIncidentsService {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            incidents: MemIncidentsRepository::new(),
            bookings: MemBookingsRepository::new(),
        }
    }

    async fn try_create_incident(
        &self,
        kind: IncidentKind,
        booking_ids: &[BookingUuid],
        amount: Amount,
        origin: Option<&str>,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        let mut tx = self
            .engine
            .db
            .begin(booking_ids.iter().copied().map(RowKey::Booking))
            .await?;

        let mut bookings = Vec::with_capacity(booking_ids.len());
        for uuid in booking_ids {
            bookings.push(self.booking(&tx, *uuid).await?);
        }

        let existing = self.incidents.incidents_for_bookings(&tx, booking_ids).await;
        let uuid = FinanceIncidentUuid::now_v7();
        let origin = origin.map(str::to_owned);
        let now = self.engine.clock.now();

        let incident = match kind {
            IncidentKind::Overpayment => {
                FinanceIncident::overpayment(uuid, &bookings, &existing, amount, origin, now)?
            }
            IncidentKind::CommercialGesture => {
                FinanceIncident::commercial_gesture(uuid, &bookings, &existing, amount, origin, now)?
            }
        };

        tx.lock(RowKey::Incident(uuid)).await?;

        self.incidents.put_incident(&mut tx, incident.clone());

        tx.commit().await;

        info!(
            incident = %uuid,
            ?kind,
            venue = %incident.venue,
            bookings = incident.bookings.len(),
            %amount,
            "created finance incident"
        );

        Ok(incident)
    }

    async fn try_validate_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        // Booking rows sort before the incident row, so they are found first.
        let snapshot = self.incident(&self.engine.db.begin([]).await?, uuid).await?;

        let rows = snapshot
            .bookings
            .iter()
            .map(|line| RowKey::Booking(line.booking))
            .chain([RowKey::Incident(uuid)]);

        let mut tx = self.engine.db.begin(rows).await?;

        let mut incident = self.incident(&tx, uuid).await?;
        let now = self.engine.clock.now();

        if !incident.validate(now)? {
            return Ok(incident);
        }

        for booking in incident.total_overpayments() {
            let mut booking = self.booking(&tx, booking).await?;

            if booking.cancel_for_incident(now).is_applied() {
                info!(booking = %booking.uuid, incident = %uuid, "cancelled fully clawed-back booking");

                self.bookings.put_booking(&mut tx, booking);
            }
        }

        self.incidents.put_incident(&mut tx, incident.clone());

        tx.commit().await;

        info!(incident = %uuid, "validated finance incident");

        Ok(incident)
    }

    async fn try_cancel_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Incident(uuid)]).await?;

        let mut incident = self.incident(&tx, uuid).await?;

        if incident.cancel(self.engine.clock.now())? {
            self.incidents.put_incident(&mut tx, incident.clone());

            tx.commit().await;

            info!(incident = %uuid, "cancelled finance incident");
        }

        Ok(incident)
    }

    async fn booking(&self, tx: &Transaction, uuid: BookingUuid) -> Result<Booking, IncidentsServiceError> {
        self.bookings.get_booking(tx, uuid).await.ok_or_else(|| {
            error!(booking = %uuid, "finance incident references a missing booking");

            IncidentsServiceError::BookingNotFound(uuid)
        })
    }

    async fn incident(
        &self,
        tx: &Transaction,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        self.incidents
            .get_incident(tx, uuid)
            .await
            .ok_or(IncidentsServiceError::NotFound)
    }
}

#[async_trait]
impl IncidentsService for MemIncidentsService {
    #[tracing::instrument(
        name = "incidents.service.create_finance_incident",
        skip(self, origin),
        fields(bookings = booking_ids.len(), total_amount = %total_amount),
        err(level = "warn")
    )]
    async fn create_finance_incident(
        &self,
        booking_ids: Vec<BookingUuid>,
        total_amount: Amount,
        origin: Option<String>,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| {
                self.try_create_incident(
                    IncidentKind::Overpayment,
                    &booking_ids,
                    total_amount,
                    origin.as_deref(),
                )
            })
            .await
    }

    #[tracing::instrument(
        name = "incidents.service.create_commercial_gesture",
        skip(self, origin),
        fields(bookings = booking_ids.len(), amount = %amount),
        err(level = "warn")
    )]
    async fn create_commercial_gesture(
        &self,
        booking_ids: Vec<BookingUuid>,
        amount: Amount,
        origin: Option<String>,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| {
                self.try_create_incident(
                    IncidentKind::CommercialGesture,
                    &booking_ids,
                    amount,
                    origin.as_deref(),
                )
            })
            .await
    }

    #[tracing::instrument(
        name = "incidents.service.validate_finance_incident",
        skip(self),
        fields(incident = %uuid),
        err(level = "warn")
    )]
    async fn validate_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_validate_finance_incident(uuid))
            .await
    }

    #[tracing::instrument(
        name = "incidents.service.cancel_finance_incident",
        skip(self),
        fields(incident = %uuid),
        err(level = "warn")
    )]
    async fn cancel_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_cancel_finance_incident(uuid))
            .await
    }

    async fn get_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError> {
        let tx = self.engine.db.begin([]).await?;

        let incident = self.incident(&tx, uuid).await?;

        tx.commit().await;

        Ok(incident)
    }
}

#[automock]
#[async_trait]
pub trait IncidentsService: Send + Sync {
    /// Raise an overpayment incident clawing `total_amount` back from used or
    /// reimbursed bookings of a single venue.
    async fn create_finance_incident(
        &self,
        booking_ids: Vec<BookingUuid>,
        total_amount: Amount,
        origin: Option<String>,
    ) -> Result<FinanceIncident, IncidentsServiceError>;

    /// Raise a commercial gesture paying `amount` to the venue for cancelled
    /// bookings of a single stock.
    async fn create_commercial_gesture(
        &self,
        booking_ids: Vec<BookingUuid>,
        amount: Amount,
        origin: Option<String>,
    ) -> Result<FinanceIncident, IncidentsServiceError>;

    /// Validate an incident. Its corrected totals become authoritative and
    /// bookings clawed back in full are cancelled.
    async fn validate_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError>;

    /// Cancel an incident that was not validated.
    async fn cancel_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError>;

    /// Retrieve a single incident.
    async fn get_finance_incident(
        &self,
        uuid: FinanceIncidentUuid,
    ) -> Result<FinanceIncident, IncidentsServiceError>;
}

#[cfg(test)]
mod tests {
    use passbook::{
        bookings::{BookingStatus, CancellationReason, ValidationAuthor},
        incidents::{IncidentError, IncidentStatus},
        ids::UserUuid,
        stocks::Stock,
    };
    use testresult::TestResult;

    use crate::{
        domain::{bookings::BookingsService, deposits::DepositsService},
        test::TestContext,
    };

    use super::*;

    async fn used_booking(ctx: &TestContext, stock: &Stock, user: UserUuid) -> TestResult<Booking> {
        let booking = ctx
            .bookings
            .create_booking(user, stock.uuid, 1, ctx.now())
            .await?;

        Ok(ctx
            .bookings
            .validate_booking(booking.uuid, ValidationAuthor::Offerer)
            .await?)
    }

    #[tokio::test]
    async fn validated_incident_overrides_the_booking_amount() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(20, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(30).await;
        let booking = used_booking(&ctx, &stock, user).await?;

        let incident = ctx
            .incidents
            .create_finance_incident(vec![booking.uuid], Amount::from_euros(15), None)
            .await?;

        assert_eq!(incident.status, IncidentStatus::Created);
        assert_eq!(
            ctx.deposits.get_wallet_balance(user, false).await?,
            Amount::from_euros(10),
            "created incidents do not change the balance"
        );

        let validated = ctx
            .incidents
            .validate_finance_incident(incident.uuid)
            .await?;

        assert_eq!(validated.status, IncidentStatus::Validated);
        assert_eq!(
            ctx.deposits.get_wallet_balance(user, false).await?,
            Amount::from_euros(25)
        );
        assert_eq!(
            ctx.bookings.get_booking(booking.uuid).await?.amount,
            Amount::from_euros(20)
        );

        let again = ctx
            .incidents
            .validate_finance_incident(incident.uuid)
            .await?;

        assert_eq!(again.validated_at, validated.validated_at);

        Ok(())
    }

    #[tokio::test]
    async fn total_overpayment_cancels_the_booking() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(20, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(30).await;
        let booking = used_booking(&ctx, &stock, user).await?;
        ctx.bookings.reimburse_booking(booking.uuid).await?;

        let incident = ctx
            .incidents
            .create_finance_incident(vec![booking.uuid], Amount::from_euros(20), Some("venue closed".to_owned()))
            .await?;
        ctx.incidents
            .validate_finance_incident(incident.uuid)
            .await?;

        let cancelled = ctx.bookings.get_booking(booking.uuid).await?;

        assert_eq!(cancelled.status, BookingStatus::Cancelled);
        assert_eq!(
            cancelled.cancellation_reason,
            Some(CancellationReason::FinanceIncident)
        );
        assert_eq!(
            ctx.deposits.get_wallet_balance(user, false).await?,
            Amount::from_euros(30)
        );

        Ok(())
    }

    #[tokio::test]
    async fn one_open_incident_per_booking() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(20, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(30).await;
        let booking = used_booking(&ctx, &stock, user).await?;

        let first = ctx
            .incidents
            .create_finance_incident(vec![booking.uuid], Amount::from_euros(5), None)
            .await?;

        let result = ctx
            .incidents
            .create_finance_incident(vec![booking.uuid], Amount::from_euros(5), None)
            .await;

        assert!(matches!(
            result,
            Err(IncidentsServiceError::Incident(IncidentError::OpenIncidentExists(uuid))) if uuid == booking.uuid
        ));

        ctx.incidents.cancel_finance_incident(first.uuid).await?;

        ctx.incidents
            .create_finance_incident(vec![booking.uuid], Amount::from_euros(5), None)
            .await?;

        Ok(())
    }

    #[tokio::test]
    async fn listing_a_booking_twice_is_refused() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(20, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(30).await;
        let booking = used_booking(&ctx, &stock, user).await?;

        let result = ctx
            .incidents
            .create_finance_incident(vec![booking.uuid, booking.uuid], Amount::from_euros(30), None)
            .await;

        assert!(
            matches!(
                result,
                Err(IncidentsServiceError::Incident(IncidentError::DuplicateBooking(uuid))) if uuid == booking.uuid
            ),
            "expected DuplicateBooking, got {result:?}"
        );
        assert_eq!(
            ctx.deposits.get_wallet_balance(user, false).await?,
            Amount::from_euros(10)
        );

        Ok(())
    }

    #[tokio::test]
    async fn validated_incident_cannot_be_cancelled() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(20, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(30).await;
        let booking = used_booking(&ctx, &stock, user).await?;

        let incident = ctx
            .incidents
            .create_finance_incident(vec![booking.uuid], Amount::from_euros(5), None)
            .await?;
        ctx.incidents
            .validate_finance_incident(incident.uuid)
            .await?;

        let result = ctx.incidents.cancel_finance_incident(incident.uuid).await;

        assert!(matches!(
            result,
            Err(IncidentsServiceError::Incident(IncidentError::AlreadyValidated))
        ));

        Ok(())
    }

    #[tokio::test]
    async fn unknown_references_are_integrity_errors() -> TestResult {
        let ctx = TestContext::new();
        let missing = BookingUuid::now_v7();

        let result = ctx
            .incidents
            .create_finance_incident(vec![missing], Amount::from_euros(5), None)
            .await;

        assert!(matches!(
            result,
            Err(IncidentsServiceError::BookingNotFound(uuid)) if uuid == missing
        ));

        let result = ctx
            .incidents
            .validate_finance_incident(FinanceIncidentUuid::now_v7())
            .await;

        assert!(matches!(result, Err(IncidentsServiceError::NotFound)));

        Ok(())
    }

    #[tokio::test]
    async fn commercial_gesture_leaves_the_balance_alone() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(10, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(30).await;

        let booking = ctx
            .bookings
            .create_booking(user, stock.uuid, 2, ctx.now())
            .await?;
        ctx.bookings
            .cancel_booking(booking.uuid, CancellationReason::Offerer)
            .await?;

        let gesture = ctx
            .incidents
            .create_commercial_gesture(vec![booking.uuid], Amount::from_euros(8), None)
            .await?;
        ctx.incidents
            .validate_finance_incident(gesture.uuid)
            .await?;

        assert_eq!(gesture.kind, IncidentKind::CommercialGesture);
        assert_eq!(
            gesture.line_for(booking.uuid).map(|line| line.new_total_amount),
            Some(Amount::from_euros(12))
        );
        assert_eq!(
            ctx.deposits.get_wallet_balance(user, false).await?,
            Amount::from_euros(30)
        );

        Ok(())
    }
}
