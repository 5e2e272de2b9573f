//! Bookings Service

use async_trait::async_trait;
use jiff::Timestamp;
use mockall::automock;
use passbook::{
    bookings::{
        Booking, BookingStatus, CancelAuthority, CancellationReason, UseTrigger, ValidationAuthor,
    },
    deposits::BalanceScope,
    ids::{BookingUuid, StockUuid, UserUuid},
    stocks::{self, Stock},
};
use rustc_hash::FxHashMap;
use tracing::{Span, error, info, warn};

use crate::{
    database::{RowKey, Transaction},
    domain::{
        bookings::{BookingsServiceError, MemBookingsRepository},
        deposits::MemDepositsRepository,
        stocks::MemStocksRepository,
    },
    engine::Engine,
};

#[derive(Debug, Clone)]
pub struct MemBookingsService {
    engine: Engine,
    bookings: MemBookingsRepository,
    stocks: MemStocksRepository,
    deposits: MemDepositsRepository,
}

impl MemBookingsService {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            bookings: MemBookingsRepository::new(),
            stocks: MemStocksRepository::new(),
            deposits: MemDepositsRepository::new(),
        }
    }

    async fn try_create_booking(
        &self,
        user: UserUuid,
        stock_uuid: StockUuid,
        quantity: u32,
        now: Timestamp,
    ) -> Result<Booking, BookingsServiceError> {
        let mut tx = self
            .engine
            .db
            .begin([RowKey::Stock(stock_uuid), RowKey::User(user)])
            .await?;

        let stock = self.stock(&tx, stock_uuid).await?;

        let current = self
            .deposits
            .current_deposit(&tx, self.engine.policy.as_ref(), user)
            .await;

        // Expired credit pays for nothing, free stock is booked without it.
        let expired = current.as_ref().is_some_and(|deposit| deposit.is_expired(now));
        let deposit = current.filter(|deposit| !deposit.is_expired(now));

        if let Some(deposit) = &deposit {
            tx.lock(RowKey::Deposit(deposit.uuid)).await?;
        }

        let booking = Booking::create(
            BookingUuid::now_v7(),
            user,
            &stock,
            deposit.as_ref().map(|deposit| deposit.uuid),
            quantity,
            now,
            &self.engine.config.cancellation,
        )?;

        let reserved = self.reserved_quantity(&tx, stock_uuid).await;

        if let Err(error) = stock.check_reservation(reserved, quantity, now) {
            warn!(stock = %stock_uuid, reserved, quantity, %error, "refused reservation");

            return Err(error.into());
        }

        let required = booking.total_amount()?;

        match &deposit {
            Some(deposit) => {
                let balance = self
                    .deposits
                    .balance(&tx, deposit, BalanceScope::Committed, now)
                    .await?;

                if !balance.covers(required)? {
                    let available = balance.reported()?;

                    warn!(deposit = %deposit.uuid, %required, %available, "refused reservation");

                    return Err(BookingsServiceError::InsufficientFunds {
                        required,
                        available,
                    });
                }
            }
            None if required.is_positive() && expired => {
                warn!(%user, %required, "refused reservation on expired deposit");

                return Err(BookingsServiceError::DepositExpired);
            }
            None if required.is_positive() => {
                warn!(%user, %required, "refused reservation without deposit");

                return Err(BookingsServiceError::DepositNotFound(user));
            }
            None => {}
        }

        self.bookings.put_booking(&mut tx, booking.clone());
        self.engine.guard.check(&tx, now).await?;

        tx.commit().await;

        Span::current().record("booking", tracing::field::display(booking.uuid));

        info!(
            booking = %booking.uuid,
            stock = %stock_uuid,
            %user,
            quantity,
            amount = %required,
            "created booking"
        );

        Ok(booking)
    }

    async fn try_cancel_booking(
        &self,
        uuid: BookingUuid,
        reason: CancellationReason,
        authority: CancelAuthority,
    ) -> Result<Booking, BookingsServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Booking(uuid)]).await?;

        let mut booking = self.booking(&tx, uuid).await?;

        if booking
            .cancel(reason, authority, self.engine.clock.now())?
            .is_applied()
        {
            self.bookings.put_booking(&mut tx, booking.clone());

            tx.commit().await;

            info!(booking = %uuid, ?reason, "cancelled booking");
        }

        Ok(booking)
    }

    async fn try_mark_booking_used(
        &self,
        uuid: BookingUuid,
        at: Timestamp,
        trigger: UseTrigger,
    ) -> Result<Booking, BookingsServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Booking(uuid)]).await?;

        let mut booking = self.booking(&tx, uuid).await?;
        let stock = self.stock(&tx, booking.stock).await?;

        if booking.mark_used(&stock, at, trigger)?.is_applied() {
            self.bookings.put_booking(&mut tx, booking.clone());

            tx.commit().await;

            info!(booking = %uuid, ?trigger, "marked booking as used");
        }

        Ok(booking)
    }

    async fn try_mark_booking_unused(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Booking(uuid)]).await?;

        let mut booking = self.booking(&tx, uuid).await?;

        if booking.mark_unused()?.is_applied() {
            self.bookings.put_booking(&mut tx, booking.clone());

            tx.commit().await;

            info!(booking = %uuid, "marked booking as unused");
        }

        Ok(booking)
    }

    async fn try_uncancel_booking_as_used(
        &self,
        uuid: BookingUuid,
    ) -> Result<Booking, BookingsServiceError> {
        let now = self.engine.clock.now();

        // Rows to lock are only known once the booking has been read.
        let snapshot = self.booking(&self.engine.db.begin([]).await?, uuid).await?;

        let mut rows = vec![
            RowKey::Stock(snapshot.stock),
            RowKey::User(snapshot.user),
            RowKey::Booking(uuid),
        ];
        rows.extend(snapshot.deposit.map(RowKey::Deposit));

        let mut tx = self.engine.db.begin(rows).await?;

        let mut booking = self.booking(&tx, uuid).await?;
        let stock = self.stock(&tx, booking.stock).await?;
        let deposit = match booking.deposit {
            Some(deposit) => Some(
                self.deposits
                    .get_deposit(&tx, deposit)
                    .await
                    .ok_or(BookingsServiceError::DepositNotFound(booking.user))?,
            ),
            None => None,
        };

        if booking.status != BookingStatus::Cancelled {
            booking.uncancel_as_used(now)?;

            return Ok(booking);
        }

        if deposit.as_ref().is_some_and(|deposit| deposit.is_expired(now)) {
            warn!(booking = %uuid, "refused uncancel on expired deposit");

            return Err(BookingsServiceError::DepositExpired);
        }

        let reserved = self.reserved_quantity(&tx, stock.uuid).await;
        stock.check_capacity(reserved, booking.quantity)?;

        if let Some(deposit) = &deposit {
            let required = booking.total_amount()?;
            let balance = self
                .deposits
                .balance(&tx, deposit, BalanceScope::Committed, now)
                .await?;

            if !balance.covers(required)? {
                return Err(BookingsServiceError::InsufficientFunds {
                    required,
                    available: balance.reported()?,
                });
            }
        }

        booking.uncancel_as_used(now)?;

        self.bookings.put_booking(&mut tx, booking.clone());
        self.engine.guard.check(&tx, now).await?;

        tx.commit().await;

        info!(booking = %uuid, "uncancelled booking as used");

        Ok(booking)
    }

    async fn try_reimburse_booking(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Booking(uuid)]).await?;

        let mut booking = self.booking(&tx, uuid).await?;

        if booking.reimburse(self.engine.clock.now())?.is_applied() {
            self.bookings.put_booking(&mut tx, booking.clone());

            tx.commit().await;

            info!(booking = %uuid, "reimbursed booking");
        }

        Ok(booking)
    }

    async fn try_auto_mark_as_used(&self, now: Timestamp) -> Result<usize, BookingsServiceError> {
        let threshold = now
            .checked_sub(self.engine.config.auto_use_delay)
            .unwrap_or(Timestamp::MIN);

        let candidates = {
            let tx = self.engine.db.begin([]).await?;

            self.due_bookings(&tx, threshold).await
        };

        if candidates.is_empty() {
            return Ok(0);
        }

        let mut tx = self
            .engine
            .db
            .begin(candidates.iter().map(|booking| RowKey::Booking(booking.uuid)))
            .await?;

        let mut marked = 0;

        // Bookings that became due after the locks were taken wait for the next run.
        for mut booking in self.due_bookings(&tx, threshold).await {
            if !tx.holds(RowKey::Booking(booking.uuid)) {
                continue;
            }

            let stock = self.stock(&tx, booking.stock).await?;

            if booking.mark_used(&stock, now, UseTrigger::Automatic)?.is_applied() {
                self.bookings.put_booking(&mut tx, booking);
                marked += 1;
            }
        }

        tx.commit().await;

        Ok(marked)
    }

    /// Confirmed bookings whose event began before `threshold`.
    async fn due_bookings(&self, tx: &Transaction, threshold: Timestamp) -> Vec<Booking> {
        let mut beginnings: FxHashMap<StockUuid, Option<Timestamp>> = FxHashMap::default();
        let mut due = Vec::new();

        for booking in self.bookings.confirmed_bookings(tx).await {
            let beginning = match beginnings.get(&booking.stock) {
                Some(beginning) => *beginning,
                None => {
                    let beginning = self
                        .stocks
                        .get_stock(tx, booking.stock)
                        .await
                        .and_then(|stock| stock.beginning_datetime);

                    beginnings.insert(booking.stock, beginning);

                    beginning
                }
            };

            if booking.is_due_for_auto_use(beginning, threshold) {
                due.push(booking);
            }
        }

        due
    }

    async fn booking(&self, tx: &Transaction, uuid: BookingUuid) -> Result<Booking, BookingsServiceError> {
        self.bookings
            .get_booking(tx, uuid)
            .await
            .ok_or(BookingsServiceError::NotFound)
    }

    async fn stock(&self, tx: &Transaction, uuid: StockUuid) -> Result<Stock, BookingsServiceError> {
        self.stocks.get_stock(tx, uuid).await.ok_or_else(|| {
            error!(stock = %uuid, "booking references a missing stock");

            BookingsServiceError::StockNotFound(uuid)
        })
    }

    async fn reserved_quantity(&self, tx: &Transaction, stock: StockUuid) -> u32 {
        let bookings = self.bookings.bookings_for_stock(tx, stock).await;

        stocks::reserved_quantity(stock, &bookings)
    }
}

#[async_trait]
impl BookingsService for MemBookingsService {
    #[tracing::instrument(
        name = "bookings.service.create_booking",
        skip(self, now),
        fields(user = %user, stock = %stock, booking = tracing::field::Empty),
        err(level = "warn")
    )]
    async fn create_booking(
        &self,
        user: UserUuid,
        stock: StockUuid,
        quantity: u32,
        now: Timestamp,
    ) -> Result<Booking, BookingsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_create_booking(user, stock, quantity, now))
            .await
    }

    async fn get_booking(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError> {
        let tx = self.engine.db.begin([]).await?;

        let booking = self.booking(&tx, uuid).await?;

        tx.commit().await;

        Ok(booking)
    }

    #[tracing::instrument(
        name = "bookings.service.cancel_booking",
        skip(self),
        fields(booking = %uuid),
        err(level = "warn")
    )]
    async fn cancel_booking(
        &self,
        uuid: BookingUuid,
        reason: CancellationReason,
    ) -> Result<Booking, BookingsServiceError> {
        let authority = match reason {
            CancellationReason::Beneficiary => CancelAuthority::Beneficiary,
            _ => CancelAuthority::Offerer,
        };

        self.engine
            .config
            .retry
            .retry(|| self.try_cancel_booking(uuid, reason, authority))
            .await
    }

    #[tracing::instrument(
        name = "bookings.service.cancel_booking_as_admin",
        skip(self),
        fields(booking = %uuid),
        err(level = "warn")
    )]
    async fn cancel_booking_as_admin(
        &self,
        uuid: BookingUuid,
        reason: CancellationReason,
    ) -> Result<Booking, BookingsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_cancel_booking(uuid, reason, CancelAuthority::Admin))
            .await
    }

    #[tracing::instrument(
        name = "bookings.service.mark_booking_used",
        skip(self),
        fields(booking = %uuid),
        err(level = "warn")
    )]
    async fn mark_booking_used(
        &self,
        uuid: BookingUuid,
        now: Timestamp,
    ) -> Result<Booking, BookingsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_mark_booking_used(uuid, now, UseTrigger::Automatic))
            .await
    }

    #[tracing::instrument(
        name = "bookings.service.validate_booking",
        skip(self),
        fields(booking = %uuid),
        err(level = "warn")
    )]
    async fn validate_booking(
        &self,
        uuid: BookingUuid,
        author: ValidationAuthor,
    ) -> Result<Booking, BookingsServiceError> {
        let now = self.engine.clock.now();

        self.engine
            .config
            .retry
            .retry(|| self.try_mark_booking_used(uuid, now, UseTrigger::Validation(author)))
            .await
    }

    #[tracing::instrument(
        name = "bookings.service.mark_booking_unused",
        skip(self),
        fields(booking = %uuid),
        err(level = "warn")
    )]
    async fn mark_booking_unused(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_mark_booking_unused(uuid))
            .await
    }

    #[tracing::instrument(
        name = "bookings.service.uncancel_booking_as_used",
        skip(self),
        fields(booking = %uuid),
        err(level = "warn")
    )]
    async fn uncancel_booking_as_used(
        &self,
        uuid: BookingUuid,
    ) -> Result<Booking, BookingsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_uncancel_booking_as_used(uuid))
            .await
    }

    #[tracing::instrument(
        name = "bookings.service.reimburse_booking",
        skip(self),
        fields(booking = %uuid),
        err(level = "warn")
    )]
    async fn reimburse_booking(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_reimburse_booking(uuid))
            .await
    }

    #[tracing::instrument(name = "bookings.service.auto_mark_as_used_after_event", skip(self), err)]
    async fn auto_mark_as_used_after_event(
        &self,
        now: Timestamp,
    ) -> Result<usize, BookingsServiceError> {
        let marked = self
            .engine
            .config
            .retry
            .retry(|| self.try_auto_mark_as_used(now))
            .await?;

        info!(marked, "auto-marked bookings as used");

        Ok(marked)
    }
}

#[automock]
#[async_trait]
pub trait BookingsService: Send + Sync {
    /// Reserve `quantity` units of `stock` for `user`, paid from their current
    /// deposit. Capacity and balance are checked under the same locks.
    async fn create_booking(
        &self,
        user: UserUuid,
        stock: StockUuid,
        quantity: u32,
        now: Timestamp,
    ) -> Result<Booking, BookingsServiceError>;

    /// Retrieve a single booking.
    async fn get_booking(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError>;

    /// Cancel a confirmed booking. Beneficiaries are bound by the cancellation
    /// limit date; used bookings are refused.
    async fn cancel_booking(
        &self,
        uuid: BookingUuid,
        reason: CancellationReason,
    ) -> Result<Booking, BookingsServiceError>;

    /// Cancel a confirmed or used booking with back-office authority.
    async fn cancel_booking_as_admin(
        &self,
        uuid: BookingUuid,
        reason: CancellationReason,
    ) -> Result<Booking, BookingsServiceError>;

    /// Mark a booking used once its event has begun.
    async fn mark_booking_used(
        &self,
        uuid: BookingUuid,
        now: Timestamp,
    ) -> Result<Booking, BookingsServiceError>;

    /// Mark a booking used on an explicit validation (counter, QR code,
    /// back-office).
    async fn validate_booking(
        &self,
        uuid: BookingUuid,
        author: ValidationAuthor,
    ) -> Result<Booking, BookingsServiceError>;

    /// Undo a validation.
    async fn mark_booking_unused(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError>;

    /// Restore a cancelled booking as used, re-checking capacity and credit.
    async fn uncancel_booking_as_used(
        &self,
        uuid: BookingUuid,
    ) -> Result<Booking, BookingsServiceError>;

    /// Record the venue's reimbursement of a used booking.
    async fn reimburse_booking(&self, uuid: BookingUuid) -> Result<Booking, BookingsServiceError>;

    /// Mark as used every confirmed booking whose event began more than the
    /// configured delay before `now`. Returns how many were marked.
    async fn auto_mark_as_used_after_event(
        &self,
        now: Timestamp,
    ) -> Result<usize, BookingsServiceError>;
}
