//! Passbook prelude.
//!
//! Convenience exports for common library consumers.

pub use crate::{
    bookings::{
        Booking, BookingError, BookingStatus, CancelAuthority, CancellationDelays,
        CancellationReason, Transition, UseTrigger, ValidationAuthor, cancellation_limit_date,
    },
    clock::{Clock, FixedClock, SystemClock},
    deposits::{
        Balance, BalanceScope, Deposit, DepositState, DepositType, LedgerError, Recredit,
        RecreditType,
    },
    ids::{
        BookingUuid, DepositUuid, FinanceIncidentUuid, RecreditUuid, StockUuid, TypedUuid,
        UserUuid, VenueUuid,
    },
    incidents::{
        BookingFinanceIncident, FinanceIncident, IncidentError, IncidentKind, IncidentStatus,
    },
    money::{Amount, MoneyError},
    policy::{CurrentDepositPolicy, LatestExpiration},
    stocks::{ReservationError, Stock, StockError, reserved_quantity},
};
