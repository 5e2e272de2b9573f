//! Booking scenarios over the pure ledger and capacity rules

use jiff::{Timestamp, ToSpan};
use testresult::TestResult;
use thiserror::Error;

use passbook::prelude::*;

#[derive(Debug, Error)]
enum Refused {
    #[error(transparent)]
    Reservation(#[from] ReservationError),

    #[error(transparent)]
    Booking(#[from] BookingError),

    #[error(transparent)]
    Money(#[from] MoneyError),

    #[error("insufficient funds")]
    InsufficientFunds,
}

struct Wallet {
    deposit: Deposit,
    bookings: Vec<Booking>,
    incidents: Vec<FinanceIncident>,
}

impl Wallet {
    fn with_credit(euros: i64) -> Self {
        Self {
            deposit: Deposit::new(
                DepositUuid::now_v7(),
                UserUuid::now_v7(),
                Amount::from_euros(euros),
                DepositType::Grant18,
                Timestamp::UNIX_EPOCH,
            ),
            bookings: Vec::new(),
            incidents: Vec::new(),
        }
    }

    fn balance(&self, scope: BalanceScope) -> TestResult<Amount> {
        let balance = passbook::deposits::balance(
            &self.deposit,
            [],
            &self.bookings,
            &self.incidents,
            scope,
            Timestamp::UNIX_EPOCH,
        )?;

        Ok(balance.remaining()?)
    }

    /// Capacity and credit checks, then the new booking.
    fn book(
        &mut self,
        stock: &Stock,
        quantity: u32,
        others: &[Booking],
    ) -> Result<BookingUuid, Refused> {
        let reserved = reserved_quantity(stock.uuid, self.bookings.iter().chain(others));
        stock.check_reservation(reserved, quantity, Timestamp::UNIX_EPOCH)?;

        let booking = Booking::create(
            BookingUuid::now_v7(),
            self.deposit.user,
            stock,
            Some(self.deposit.uuid),
            quantity,
            Timestamp::UNIX_EPOCH,
            &CancellationDelays::default(),
        )?;

        let balance = passbook::deposits::balance(
            &self.deposit,
            [],
            &self.bookings,
            &self.incidents,
            BalanceScope::Committed,
            Timestamp::UNIX_EPOCH,
        )?;

        if !balance.covers(booking.total_amount()?)? {
            return Err(Refused::InsufficientFunds);
        }

        let uuid = booking.uuid;
        self.bookings.push(booking);

        Ok(uuid)
    }
}

fn stock(euros: i64, quantity: u32) -> Stock {
    Stock::new(StockUuid::now_v7(), VenueUuid::now_v7(), Amount::from_euros(euros))
        .with_quantity(quantity)
}

#[test]
fn basic_reservation() -> TestResult {
    let mut wallet = Wallet::with_credit(30);
    let stock = stock(10, 2);

    wallet.book(&stock, 2, &[])?;

    assert_eq!(wallet.balance(BalanceScope::Committed)?, Amount::from_euros(10));
    assert_eq!(reserved_quantity(stock.uuid, &wallet.bookings), 2);

    let mut other = Wallet::with_credit(30);
    let result = other.book(&stock, 1, &wallet.bookings);

    assert!(
        matches!(
            result,
            Err(Refused::Reservation(ReservationError::TooManyBookings {
                requested: 1,
                remaining: 0
            }))
        ),
        "third unit must be refused, got {result:?}"
    );

    Ok(())
}

#[test]
fn insufficient_funds_leave_the_balance_untouched() -> TestResult {
    let mut wallet = Wallet::with_credit(5);
    let stock = stock(10, 10);

    let result = wallet.book(&stock, 1, &[]);

    assert!(
        matches!(result, Err(Refused::InsufficientFunds)),
        "expected insufficient funds, got {result:?}"
    );
    assert_eq!(wallet.balance(BalanceScope::Committed)?, Amount::from_euros(5));
    assert!(wallet.bookings.is_empty());

    Ok(())
}

#[test]
fn cancellation_frees_capacity() -> TestResult {
    let mut wallet = Wallet::with_credit(30);
    let stock = stock(10, 1);

    wallet.book(&stock, 1, &[])?;

    for booking in &mut wallet.bookings {
        booking.cancel(
            CancellationReason::Beneficiary,
            CancelAuthority::Beneficiary,
            Timestamp::UNIX_EPOCH,
        )?;
    }

    wallet.book(&stock, 1, &[])?;

    assert_eq!(reserved_quantity(stock.uuid, &wallet.bookings), 1);
    assert_eq!(wallet.balance(BalanceScope::Committed)?, Amount::from_euros(20));

    Ok(())
}

#[test]
fn expired_booking_window_wins_over_capacity_and_credit() -> TestResult {
    let limit = Timestamp::UNIX_EPOCH.checked_sub(1.hours())?;
    let stock = stock(0, 100).with_booking_limit(limit);

    assert_eq!(
        stock.check_reservation(0, 1, Timestamp::UNIX_EPOCH),
        Err(ReservationError::BookingLimitDatetimePassed(limit))
    );

    Ok(())
}

#[test]
fn incident_override_reduces_consumption() -> TestResult {
    let mut wallet = Wallet::with_credit(30);
    let stock = stock(20, 1);

    let uuid = wallet.book(&stock, 1, &[])?;

    for booking in &mut wallet.bookings {
        booking.mark_used(&stock, Timestamp::UNIX_EPOCH, UseTrigger::Automatic)?;
    }

    assert_eq!(wallet.balance(BalanceScope::Committed)?, Amount::from_euros(10));

    let mut incident = FinanceIncident::overpayment(
        FinanceIncidentUuid::now_v7(),
        &wallet.bookings,
        &wallet.incidents,
        Amount::from_euros(15),
        None,
        Timestamp::UNIX_EPOCH,
    )?;
    incident.validate(Timestamp::UNIX_EPOCH)?;
    wallet.incidents.push(incident);

    assert_eq!(wallet.balance(BalanceScope::Committed)?, Amount::from_euros(25));
    assert_eq!(wallet.balance(BalanceScope::Spent)?, Amount::from_euros(25));

    let frozen = wallet
        .bookings
        .iter()
        .find(|booking| booking.uuid == uuid)
        .map(|booking| booking.amount);

    assert_eq!(frozen, Some(Amount::from_euros(20)), "frozen amount is kept");

    Ok(())
}

#[test]
fn lowering_quantity_respects_reservations() -> TestResult {
    let mut wallet = Wallet::with_credit(100);
    let stock = stock(10, 5);

    wallet.book(&stock, 3, &[])?;

    let reserved = reserved_quantity(stock.uuid, &wallet.bookings);

    assert!(stock.can_lower_quantity(reserved, 3));
    assert_eq!(
        stock.check_quantity_change(reserved, Some(2)),
        Err(ReservationError::QuantityBelowReserved {
            requested: 2,
            reserved: 3
        })
    );

    Ok(())
}
