//! Stocks Service

use async_trait::async_trait;
use mockall::automock;
use passbook::{
    ids::StockUuid,
    stocks::{self, Stock},
};
use tracing::{info, warn};

use crate::{
    database::RowKey,
    domain::{
        bookings::MemBookingsRepository,
        stocks::{MemStocksRepository, StocksServiceError},
    },
    engine::Engine,
};

#[derive(Debug, Clone)]
pub struct MemStocksService {
    engine: Engine,
    stocks: MemStocksRepository,
    bookings: MemBookingsRepository,
}

impl MemStocksService {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            stocks: MemStocksRepository::new(),
            bookings: MemBookingsRepository::new(),
        }
    }

    async fn try_update_stock_quantity(
        &self,
        uuid: StockUuid,
        quantity: Option<u32>,
    ) -> Result<Stock, StocksServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Stock(uuid)]).await?;

        let mut stock = self
            .stocks
            .get_stock(&tx, uuid)
            .await
            .ok_or(StocksServiceError::NotFound)?;

        let bookings = self.bookings.bookings_for_stock(&tx, uuid).await;
        let reserved = stocks::reserved_quantity(uuid, &bookings);

        if let Err(error) = stock.check_quantity_change(reserved, quantity) {
            warn!(stock = %uuid, reserved, ?quantity, "refused quantity change");

            return Err(error.into());
        }

        stock.quantity = quantity;

        self.stocks.put_stock(&mut tx, stock.clone());
        self.engine.guard.check(&tx, self.engine.clock.now()).await?;

        tx.commit().await;

        info!(stock = %uuid, ?quantity, reserved, "updated stock quantity");

        Ok(stock)
    }

    async fn try_soft_delete_stock(&self, uuid: StockUuid) -> Result<Stock, StocksServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Stock(uuid)]).await?;

        let mut stock = self
            .stocks
            .get_stock(&tx, uuid)
            .await
            .ok_or(StocksServiceError::NotFound)?;

        if stock.is_soft_deleted {
            return Ok(stock);
        }

        stock.is_soft_deleted = true;

        self.stocks.put_stock(&mut tx, stock.clone());

        tx.commit().await;

        info!(stock = %uuid, "soft-deleted stock");

        Ok(stock)
    }
}

#[async_trait]
impl StocksService for MemStocksService {
    #[tracing::instrument(
        name = "stocks.service.create_stock",
        skip_all,
        fields(stock = %stock.uuid, price = %stock.price, quantity = ?stock.quantity),
        err
    )]
    async fn create_stock(&self, stock: Stock) -> Result<Stock, StocksServiceError> {
        stock.validate()?;

        let mut tx = self.engine.db.begin([RowKey::Stock(stock.uuid)]).await?;

        if self.stocks.get_stock(&tx, stock.uuid).await.is_some() {
            return Err(StocksServiceError::AlreadyExists);
        }

        self.stocks.put_stock(&mut tx, stock.clone());

        tx.commit().await;

        info!(stock = %stock.uuid, "created stock");

        Ok(stock)
    }

    async fn get_stock(&self, uuid: StockUuid) -> Result<Stock, StocksServiceError> {
        let tx = self.engine.db.begin([]).await?;

        let stock = self
            .stocks
            .get_stock(&tx, uuid)
            .await
            .ok_or(StocksServiceError::NotFound)?;

        tx.commit().await;

        Ok(stock)
    }

    #[tracing::instrument(
        name = "stocks.service.update_stock_quantity",
        skip(self),
        fields(stock = %uuid),
        err(level = "warn")
    )]
    async fn update_stock_quantity(
        &self,
        uuid: StockUuid,
        quantity: Option<u32>,
    ) -> Result<Stock, StocksServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_update_stock_quantity(uuid, quantity))
            .await
    }

    #[tracing::instrument(
        name = "stocks.service.soft_delete_stock",
        skip(self),
        fields(stock = %uuid),
        err
    )]
    async fn soft_delete_stock(&self, uuid: StockUuid) -> Result<Stock, StocksServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_soft_delete_stock(uuid))
            .await
    }

    async fn reserved_quantity(&self, uuid: StockUuid) -> Result<u32, StocksServiceError> {
        let tx = self.engine.db.begin([]).await?;

        if self.stocks.get_stock(&tx, uuid).await.is_none() {
            return Err(StocksServiceError::NotFound);
        }

        let bookings = self.bookings.bookings_for_stock(&tx, uuid).await;

        tx.commit().await;

        Ok(stocks::reserved_quantity(uuid, &bookings))
    }
}

#[automock]
#[async_trait]
pub trait StocksService: Send + Sync {
    /// Register a new stock after checking its dates and price.
    async fn create_stock(&self, stock: Stock) -> Result<Stock, StocksServiceError>;

    /// Retrieve a single stock.
    async fn get_stock(&self, uuid: StockUuid) -> Result<Stock, StocksServiceError>;

    /// Change the declared capacity; `None` makes the stock unlimited. Refused
    /// below the quantity already reserved.
    async fn update_stock_quantity(
        &self,
        uuid: StockUuid,
        quantity: Option<u32>,
    ) -> Result<Stock, StocksServiceError>;

    /// Close the stock to new bookings. Existing bookings are kept.
    async fn soft_delete_stock(&self, uuid: StockUuid) -> Result<Stock, StocksServiceError>;

    /// Units held by confirmed, used and reimbursed bookings.
    async fn reserved_quantity(&self, uuid: StockUuid) -> Result<u32, StocksServiceError>;
}

#[cfg(test)]
mod tests {
    use jiff::ToSpan;
    use passbook::{
        ids::VenueUuid,
        money::Amount,
        stocks::{ReservationError, StockError},
    };
    use testresult::TestResult;

    use crate::{domain::bookings::BookingsService, test::TestContext};

    use super::*;

    #[tokio::test]
    async fn create_stock_rejects_limit_after_beginning() -> TestResult {
        let ctx = TestContext::new();
        let beginning = ctx.now().checked_add(1.hour())?;
        let limit = ctx.now().checked_add(2.hours())?;

        let stock = Stock::new(StockUuid::now_v7(), VenueUuid::now_v7(), Amount::from_euros(5))
            .with_beginning(beginning)
            .with_booking_limit(limit);

        let result = ctx.stocks.create_stock(stock).await;

        assert!(
            matches!(
                result,
                Err(StocksServiceError::Invalid(
                    StockError::BookingLimitAfterBeginning { .. }
                ))
            ),
            "expected invalid stock, got {result:?}"
        );

        Ok(())
    }

    #[tokio::test]
    async fn create_stock_twice_is_refused() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(5, Some(3)).await;

        let result = ctx.stocks.create_stock(stock).await;

        assert!(matches!(result, Err(StocksServiceError::AlreadyExists)));

        Ok(())
    }

    #[tokio::test]
    async fn get_stock_unknown_uuid_returns_not_found() {
        let ctx = TestContext::new();

        let result = ctx.stocks.get_stock(StockUuid::now_v7()).await;

        assert!(matches!(result, Err(StocksServiceError::NotFound)));
    }

    #[tokio::test]
    async fn quantity_cannot_drop_below_reservations() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(10, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(100).await;

        ctx.bookings
            .create_booking(user, stock.uuid, 3, ctx.now())
            .await?;

        let lowered = ctx.stocks.update_stock_quantity(stock.uuid, Some(3)).await?;

        assert_eq!(lowered.quantity, Some(3));

        let result = ctx.stocks.update_stock_quantity(stock.uuid, Some(2)).await;

        assert!(
            matches!(
                result,
                Err(StocksServiceError::Reservation(
                    ReservationError::QuantityBelowReserved {
                        requested: 2,
                        reserved: 3
                    }
                ))
            ),
            "expected refusal, got {result:?}"
        );
        assert_eq!(ctx.stocks.get_stock(stock.uuid).await?.quantity, Some(3));

        Ok(())
    }

    #[tokio::test]
    async fn soft_deleted_stock_keeps_its_reservations() -> TestResult {
        let ctx = TestContext::new();
        let stock = ctx.create_stock(10, Some(5)).await;
        let (user, _deposit) = ctx.create_wallet(100).await;

        ctx.bookings
            .create_booking(user, stock.uuid, 2, ctx.now())
            .await?;

        let deleted = ctx.stocks.soft_delete_stock(stock.uuid).await?;

        assert!(deleted.is_soft_deleted);
        assert_eq!(ctx.stocks.reserved_quantity(stock.uuid).await?, 2);

        Ok(())
    }
}
