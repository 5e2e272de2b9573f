//! Concurrent bookings against shared stocks and wallets

use std::{sync::Arc, time::Duration};

use jiff::Timestamp;
use passbook::prelude::*;
use passbook_app::{
    config::EngineConfig,
    context::AppContext,
    domain::{bookings::BookingsServiceError, deposits::DepositsServiceError},
    engine::Engine,
    retry::RetryPolicy,
};
use testresult::TestResult;
use thiserror::Error;
use tokio::task::JoinSet;

#[derive(Debug, Error)]
enum TaskError {
    #[error(transparent)]
    Bookings(#[from] BookingsServiceError),

    #[error(transparent)]
    Deposits(#[from] DepositsServiceError),
}

fn context() -> (AppContext, Timestamp) {
    let now = Timestamp::UNIX_EPOCH;
    let config = EngineConfig {
        lock_timeout: Duration::from_secs(5),
        retry: RetryPolicy::new(5, Duration::from_millis(5), Duration::from_millis(50), 20),
        ..EngineConfig::default()
    };

    let engine = Engine::new(config, Arc::new(FixedClock::new(now)), Arc::new(LatestExpiration));

    (AppContext::new(engine), now)
}

async fn stock(ctx: &AppContext, euros: i64, quantity: Option<u32>) -> TestResult<Stock> {
    let mut stock = Stock::new(StockUuid::now_v7(), VenueUuid::now_v7(), Amount::from_euros(euros));
    stock.quantity = quantity;

    Ok(ctx.stocks.create_stock(stock).await?)
}

async fn wallet(ctx: &AppContext, euros: i64, now: Timestamp) -> TestResult<UserUuid> {
    let user = UserUuid::now_v7();

    ctx.deposits
        .create_deposit(Deposit::new(
            DepositUuid::now_v7(),
            user,
            Amount::from_euros(euros),
            DepositType::Grant18,
            now,
        ))
        .await?;

    Ok(user)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_unit_goes_to_exactly_one_beneficiary() -> TestResult {
    let (ctx, now) = context();
    let stock = stock(&ctx, 10, Some(1)).await?;

    let mut tasks = JoinSet::new();

    for _ in 0..8 {
        let user = wallet(&ctx, 30, now).await?;
        let bookings = Arc::clone(&ctx.bookings);
        let stock = stock.uuid;

        tasks.spawn(async move { bookings.create_booking(user, stock, 1, now).await });
    }

    let mut booked = 0;
    let mut refused = 0;

    while let Some(result) = tasks.join_next().await {
        match result? {
            Ok(_booking) => booked += 1,
            Err(BookingsServiceError::Reservation(ReservationError::TooManyBookings {
                requested: 1,
                remaining: 0,
            })) => refused += 1,
            Err(error) => return Err(error.into()),
        }
    }

    assert_eq!(booked, 1);
    assert_eq!(refused, 7);
    assert_eq!(ctx.stocks.reserved_quantity(stock.uuid).await?, 1);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wallet_is_never_overdrawn() -> TestResult {
    let (ctx, now) = context();
    let user = wallet(&ctx, 30, now).await?;

    let mut tasks = JoinSet::new();

    for _ in 0..6 {
        let stock = stock(&ctx, 20, None).await?;
        let bookings = Arc::clone(&ctx.bookings);

        tasks.spawn(async move { bookings.create_booking(user, stock.uuid, 1, now).await });
    }

    let mut booked = 0;
    let mut refused = 0;

    while let Some(result) = tasks.join_next().await {
        match result? {
            Ok(_booking) => booked += 1,
            Err(BookingsServiceError::InsufficientFunds { .. }) => refused += 1,
            Err(error) => return Err(error.into()),
        }
    }

    assert_eq!(booked, 1);
    assert_eq!(refused, 5);
    assert_eq!(
        ctx.deposits.get_wallet_balance(user, false).await?,
        Amount::from_euros(10)
    );

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mixed_operations_do_not_deadlock() -> TestResult {
    let (ctx, now) = context();
    let stocks = [
        stock(&ctx, 1, Some(50)).await?,
        stock(&ctx, 1, Some(50)).await?,
    ];

    let mut users = Vec::new();
    for _ in 0..4 {
        users.push(wallet(&ctx, 500, now).await?);
    }

    let mut tasks = JoinSet::new();

    for round in 0..40_usize {
        let ctx = ctx.clone();
        let user = users[round % users.len()];
        let stock = stocks[round % stocks.len()].uuid;

        tasks.spawn(async move {
            let booking = ctx.bookings.create_booking(user, stock, 1, now).await?;

            if round % 3 == 0 {
                ctx.bookings
                    .cancel_booking(booking.uuid, CancellationReason::Offerer)
                    .await?;
            } else {
                ctx.bookings
                    .validate_booking(booking.uuid, ValidationAuthor::Offerer)
                    .await?;
            }

            ctx.deposits.get_wallet_balance(user, false).await?;

            Ok::<_, TaskError>(())
        });
    }

    let finished = tokio::time::timeout(Duration::from_secs(30), async {
        let mut outcomes = Vec::new();

        while let Some(result) = tasks.join_next().await {
            outcomes.push(result);
        }

        outcomes
    })
    .await?;

    for outcome in finished {
        outcome??;
    }

    let reserved = ctx.stocks.reserved_quantity(stocks[0].uuid).await?
        + ctx.stocks.reserved_quantity(stocks[1].uuid).await?;

    // Every third round cancels its booking.
    assert_eq!(reserved, 26);

    Ok(())
}
