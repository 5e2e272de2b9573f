//! Scenario replay

use std::{collections::BTreeMap, sync::Arc};

use jiff::{SignedDuration, Timestamp};
use passbook::{
    clock::{Clock, FixedClock},
    deposits::Deposit,
    ids::{BookingUuid, DepositUuid, FinanceIncidentUuid, StockUuid, UserUuid, VenueUuid},
    incidents::IncidentKind,
    stocks::Stock,
};
use passbook_app::context::AppContext;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::{
    report::{Outcome, Report, StepRecord, StockLine, WalletLine},
    scenario::{Action, RecreditStep, Scenario, ScenarioError, Step, StepError},
};

/// Replays a scenario through the services, resolving names to ids.
pub(crate) struct Runner {
    ctx: AppContext,
    clock: Arc<FixedClock>,
    users: BTreeMap<String, UserUuid>,
    stocks: BTreeMap<String, StockUuid>,
    venues: FxHashMap<String, VenueUuid>,
    bookings: FxHashMap<String, BookingUuid>,
    incidents: FxHashMap<String, FinanceIncidentUuid>,
}

impl Runner {
    /// The clock must be the one the services read.
    pub(crate) fn new(ctx: AppContext, clock: Arc<FixedClock>) -> Self {
        Self {
            ctx,
            clock,
            users: BTreeMap::new(),
            stocks: BTreeMap::new(),
            venues: FxHashMap::default(),
            bookings: FxHashMap::default(),
            incidents: FxHashMap::default(),
        }
    }

    /// Seed, replay every step, then summarise wallets and stocks.
    pub(crate) async fn run(&mut self, scenario: &Scenario) -> Result<Report, ScenarioError> {
        self.clock.set(scenario.start);
        self.seed(scenario).await?;

        let mut steps = Vec::with_capacity(scenario.steps.len());

        for (index, step) in scenario.steps.iter().enumerate() {
            steps.push(self.run_step(index + 1, step).await?);
        }

        let wallets = self.wallets().await?;
        let stocks = self.stock_lines().await?;

        Ok(Report::new(steps, wallets, stocks))
    }

    pub(crate) async fn seed(&mut self, scenario: &Scenario) -> Result<(), ScenarioError> {
        let start = scenario.start;

        for (name, spec) in &scenario.users {
            let user = UserUuid::now_v7();
            let mut deposit = Deposit::new(DepositUuid::now_v7(), user, spec.deposit, spec.kind, start);

            if let Some(hours) = spec.expires_in_hours {
                deposit = deposit.with_expiration(at(start, hours)?);
            }

            self.ctx
                .deposits
                .create_deposit(deposit)
                .await
                .map_err(StepError::from)?;

            info!(user = %name, uuid = %user, deposit = %spec.deposit, "seeded wallet");

            self.users.insert(name.clone(), user);
        }

        for (name, spec) in &scenario.stocks {
            let venue = *self
                .venues
                .entry(spec.venue.clone())
                .or_insert_with(VenueUuid::now_v7);

            let mut stock = Stock::new(StockUuid::now_v7(), venue, spec.price);

            stock.quantity = spec.quantity;

            if let Some(hours) = spec.beginning_in_hours {
                stock = stock.with_beginning(at(start, hours)?);
            }

            if let Some(hours) = spec.booking_limit_in_hours {
                stock = stock.with_booking_limit(at(start, hours)?);
            }

            let stock = self
                .ctx
                .stocks
                .create_stock(stock)
                .await
                .map_err(StepError::from)?;

            info!(stock = %name, uuid = %stock.uuid, price = %stock.price, "seeded stock");

            self.stocks.insert(name.clone(), stock.uuid);
        }

        Ok(())
    }

    /// Run one step. Refusals are recorded; unknown names abort the replay.
    pub(crate) async fn run_step(
        &mut self,
        index: usize,
        step: &Step,
    ) -> Result<StepRecord, ScenarioError> {
        let at = self.clock.now();
        let (label, subject) = describe(&step.action);

        let outcome = match self.apply(&step.action).await? {
            Ok(detail) => {
                info!(step = index, action = label, %subject, %detail, "step applied");

                Outcome::Applied(detail)
            }
            Err(error) => {
                warn!(step = index, action = label, %subject, %error, "step refused");

                Outcome::Refused(error.to_string())
            }
        };

        let record = StepRecord {
            index,
            at,
            action: label,
            subject,
            expected: step.expect,
            outcome,
        };

        if !record.met_expectation() {
            warn!(step = index, action = label, expected = ?step.expect, "unexpected outcome");
        }

        Ok(record)
    }

    async fn apply(&mut self, action: &Action) -> Result<Result<String, StepError>, ScenarioError> {
        let now = self.clock.now();

        let result = match action {
            Action::Book(step) => {
                if self.bookings.contains_key(&step.booking) {
                    return Err(ScenarioError::DuplicateReference(step.booking.clone()));
                }

                let user = self.user(&step.user)?;
                let stock = self.stock(&step.stock)?;

                match self
                    .ctx
                    .bookings
                    .create_booking(user, stock, step.quantity, now)
                    .await
                {
                    Ok(booking) => {
                        self.bookings.insert(step.booking.clone(), booking.uuid);

                        Ok(format!("{} for {}", booking.status, booking.amount))
                    }
                    Err(error) => Err(error.into()),
                }
            }
            Action::Cancel(step) => {
                let uuid = self.booking(&step.booking)?;
                let bookings = &self.ctx.bookings;

                let cancelled = if step.admin {
                    bookings.cancel_booking_as_admin(uuid, step.reason).await
                } else {
                    bookings.cancel_booking(uuid, step.reason).await
                };

                cancelled
                    .map(|booking| booking.status.to_string())
                    .map_err(StepError::from)
            }
            Action::Use(step) => {
                let uuid = self.booking(&step.booking)?;

                self.ctx
                    .bookings
                    .validate_booking(uuid, step.author)
                    .await
                    .map(|booking| booking.status.to_string())
                    .map_err(StepError::from)
            }
            Action::Unuse(step) => {
                let uuid = self.booking(&step.booking)?;

                self.ctx
                    .bookings
                    .mark_booking_unused(uuid)
                    .await
                    .map(|booking| booking.status.to_string())
                    .map_err(StepError::from)
            }
            Action::Uncancel(step) => {
                let uuid = self.booking(&step.booking)?;

                self.ctx
                    .bookings
                    .uncancel_booking_as_used(uuid)
                    .await
                    .map(|booking| booking.status.to_string())
                    .map_err(StepError::from)
            }
            Action::Reimburse(step) => {
                let uuid = self.booking(&step.booking)?;

                self.ctx
                    .bookings
                    .reimburse_booking(uuid)
                    .await
                    .map(|booking| booking.status.to_string())
                    .map_err(StepError::from)
            }
            Action::Recredit(step) => {
                let user = self.user(&step.user)?;

                self.recredit(user, step).await
            }
            Action::Incident(step) => {
                if self.incidents.contains_key(&step.incident) {
                    return Err(ScenarioError::DuplicateReference(step.incident.clone()));
                }

                let bookings = step
                    .bookings
                    .iter()
                    .map(|name| self.booking(name))
                    .collect::<Result<Vec<_>, _>>()?;

                let incidents = &self.ctx.incidents;

                let raised = match step.kind {
                    IncidentKind::Overpayment => {
                        incidents
                            .create_finance_incident(bookings, step.amount, step.origin.clone())
                            .await
                    }
                    IncidentKind::CommercialGesture => {
                        incidents
                            .create_commercial_gesture(bookings, step.amount, step.origin.clone())
                            .await
                    }
                };

                match raised {
                    Ok(incident) => {
                        self.incidents.insert(step.incident.clone(), incident.uuid);

                        Ok(format!("{} on {} booking(s)", incident.status, incident.bookings.len()))
                    }
                    Err(error) => Err(error.into()),
                }
            }
            Action::ValidateIncident(step) => {
                let uuid = self.incident(&step.incident)?;

                self.ctx
                    .incidents
                    .validate_finance_incident(uuid)
                    .await
                    .map(|incident| incident.status.to_string())
                    .map_err(StepError::from)
            }
            Action::CancelIncident(step) => {
                let uuid = self.incident(&step.incident)?;

                self.ctx
                    .incidents
                    .cancel_finance_incident(uuid)
                    .await
                    .map(|incident| incident.status.to_string())
                    .map_err(StepError::from)
            }
            Action::ExpireDeposit(step) => {
                let user = self.user(&step.user)?;

                self.ctx
                    .deposits
                    .expire_current_deposit(user)
                    .await
                    .map(|deposit| format!("deposit {} expired", deposit.uuid))
                    .map_err(StepError::from)
            }
            Action::SetQuantity(step) => {
                let stock = self.stock(&step.stock)?;

                self.ctx
                    .stocks
                    .update_stock_quantity(stock, step.quantity)
                    .await
                    .map(|stock| quantity_label(stock.quantity))
                    .map_err(StepError::from)
            }
            Action::DeleteStock(step) => {
                let stock = self.stock(&step.stock)?;

                self.ctx
                    .stocks
                    .soft_delete_stock(stock)
                    .await
                    .map(|_stock| "soft-deleted".to_owned())
                    .map_err(StepError::from)
            }
            Action::AutoUse(_) => self
                .ctx
                .bookings
                .auto_mark_as_used_after_event(now)
                .await
                .map(|marked| format!("{marked} marked used"))
                .map_err(StepError::from),
            Action::Advance(step) => {
                let target = at(now, step.hours)?;

                self.clock.set(target);

                Ok(format!("clock at {target}"))
            }
        };

        Ok(result)
    }

    async fn recredit(
        &self,
        user: UserUuid,
        step: &RecreditStep,
    ) -> Result<String, StepError> {
        let deposit = self.ctx.deposits.current_deposit(user).await?;

        let recredit = self
            .ctx
            .deposits
            .add_recredit(deposit.uuid, step.amount, step.kind, step.comment.clone())
            .await?;

        Ok(format!("+{} on deposit {}", recredit.amount, deposit.uuid))
    }

    async fn wallets(&self) -> Result<Vec<WalletLine>, ScenarioError> {
        let mut lines = Vec::with_capacity(self.users.len());

        for (name, &user) in &self.users {
            let deposits = &self.ctx.deposits;

            let balance = deposits
                .get_wallet_balance(user, false)
                .await
                .map_err(StepError::from)?;
            let collected = deposits
                .get_wallet_balance(user, true)
                .await
                .map_err(StepError::from)?;

            lines.push(WalletLine {
                user: name.clone(),
                balance,
                collected,
            });
        }

        Ok(lines)
    }

    async fn stock_lines(&self) -> Result<Vec<StockLine>, ScenarioError> {
        let mut lines = Vec::with_capacity(self.stocks.len());

        for (name, &uuid) in &self.stocks {
            let stock = self
                .ctx
                .stocks
                .get_stock(uuid)
                .await
                .map_err(StepError::from)?;
            let reserved = self
                .ctx
                .stocks
                .reserved_quantity(uuid)
                .await
                .map_err(StepError::from)?;

            lines.push(StockLine {
                stock: name.clone(),
                price: stock.price,
                quantity: stock.quantity,
                reserved,
                remaining: stock.remaining_quantity(reserved),
                deleted: stock.is_soft_deleted,
            });
        }

        Ok(lines)
    }

    fn user(&self, name: &str) -> Result<UserUuid, ScenarioError> {
        self.users
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownUser(name.to_owned()))
    }

    fn stock(&self, name: &str) -> Result<StockUuid, ScenarioError> {
        self.stocks
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownStock(name.to_owned()))
    }

    fn booking(&self, name: &str) -> Result<BookingUuid, ScenarioError> {
        self.bookings
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownBooking(name.to_owned()))
    }

    fn incident(&self, name: &str) -> Result<FinanceIncidentUuid, ScenarioError> {
        self.incidents
            .get(name)
            .copied()
            .ok_or_else(|| ScenarioError::UnknownIncident(name.to_owned()))
    }
}

fn at(from: Timestamp, hours: i64) -> Result<Timestamp, ScenarioError> {
    let offset = SignedDuration::from_secs(hours.saturating_mul(3_600));

    Ok(from.checked_add(offset)?)
}

fn quantity_label(quantity: Option<u32>) -> String {
    quantity.map_or_else(|| "unlimited".to_owned(), |quantity| quantity.to_string())
}

fn describe(action: &Action) -> (&'static str, String) {
    match action {
        Action::Book(step) => (
            "book",
            format!("{}: {} x{} of {}", step.booking, step.user, step.quantity, step.stock),
        ),
        Action::Cancel(step) => ("cancel", format!("{} ({:?})", step.booking, step.reason)),
        Action::Use(step) => ("use", step.booking.clone()),
        Action::Unuse(step) => ("unuse", step.booking.clone()),
        Action::Uncancel(step) => ("uncancel", step.booking.clone()),
        Action::Reimburse(step) => ("reimburse", step.booking.clone()),
        Action::Recredit(step) => ("recredit", format!("{} +{}", step.user, step.amount)),
        Action::Incident(step) => (
            "incident",
            format!("{}: {} on {}", step.incident, step.amount, step.bookings.join(", ")),
        ),
        Action::ValidateIncident(step) => ("validate_incident", step.incident.clone()),
        Action::CancelIncident(step) => ("cancel_incident", step.incident.clone()),
        Action::ExpireDeposit(step) => ("expire_deposit", step.user.clone()),
        Action::SetQuantity(step) => (
            "set_quantity",
            format!("{} to {}", step.stock, quantity_label(step.quantity)),
        ),
        Action::DeleteStock(step) => ("delete_stock", step.stock.clone()),
        Action::AutoUse(_) => ("auto_use", String::new()),
        Action::Advance(step) => ("advance", format!("{}h", step.hours)),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use passbook::{
        bookings::{Booking, BookingStatus},
        money::Amount,
        policy::LatestExpiration,
        stocks::ReservationError,
    };
    use passbook_app::{
        config::EngineConfig,
        domain::{
            bookings::{BookingsServiceError, MockBookingsService},
            deposits::MockDepositsService,
            incidents::MockIncidentsService,
            stocks::MockStocksService,
        },
        engine::Engine,
    };
    use testresult::TestResult;

    use super::*;

    const ONE_USER_ONE_STOCK: &str = r#"
start: 2025-06-02T10:00:00Z
users:
  alice:
    deposit: "30.00"
stocks:
  concert:
    price: "10.00"
    quantity: 1
steps:
  - book: { booking: first, user: alice, stock: concert }
    expect: refused
  - cancel: { booking: first }
  - advance: { hours: 5 }
  - book: { booking: second, user: alice, stock: concert }
"#;

    fn seeded_mocks() -> (MockStocksService, MockDepositsService) {
        let mut stocks = MockStocksService::new();
        let mut deposits = MockDepositsService::new();

        stocks.expect_create_stock().once().returning(Ok);
        deposits.expect_create_deposit().once().returning(Ok);

        (stocks, deposits)
    }

    fn mock_context(
        stocks: MockStocksService,
        deposits: MockDepositsService,
        bookings: MockBookingsService,
    ) -> AppContext {
        AppContext {
            stocks: Arc::new(stocks),
            deposits: Arc::new(deposits),
            bookings: Arc::new(bookings),
            incidents: Arc::new(MockIncidentsService::new()),
        }
    }

    #[tokio::test]
    async fn refusals_are_recorded_and_unknown_bookings_abort() -> TestResult {
        let scenario = Scenario::parse(ONE_USER_ONE_STOCK)?;
        let (stocks, deposits) = seeded_mocks();
        let mut bookings = MockBookingsService::new();

        bookings
            .expect_create_booking()
            .once()
            .withf(|_, _, quantity, at| *quantity == 1 && at.to_string() == "2025-06-02T10:00:00Z")
            .return_once(|_, _, _, _| {
                Err(BookingsServiceError::Reservation(
                    ReservationError::TooManyBookings {
                        requested: 1,
                        remaining: 0,
                    },
                ))
            });

        bookings.expect_cancel_booking().never();

        let clock = Arc::new(FixedClock::new(scenario.start));
        let mut runner = Runner::new(mock_context(stocks, deposits, bookings), clock);

        runner.seed(&scenario).await?;

        let refused = runner
            .run_step(1, scenario.steps.first().ok_or("missing book step")?)
            .await?;

        assert!(matches!(refused.outcome, Outcome::Refused(_)));
        assert!(refused.met_expectation(), "refusal was expected");

        let cancel = runner
            .run_step(2, scenario.steps.get(1).ok_or("missing cancel step")?)
            .await;

        assert!(
            matches!(&cancel, Err(ScenarioError::UnknownBooking(name)) if name == "first"),
            "expected unknown booking, got {cancel:?}"
        );

        Ok(())
    }

    #[tokio::test]
    async fn advancing_moves_the_booking_clock() -> TestResult {
        let scenario = Scenario::parse(ONE_USER_ONE_STOCK)?;
        let (stocks, deposits) = seeded_mocks();
        let later = scenario.start.checked_add(SignedDuration::from_hours(5))?;
        let mut bookings = MockBookingsService::new();

        bookings
            .expect_create_booking()
            .once()
            .withf(move |_, _, _, at| *at == later)
            .return_once(|user, stock, quantity, at| {
                let stock = Stock::new(stock, VenueUuid::now_v7(), Amount::from_euros(10));

                Ok(Booking::confirmed(
                    BookingUuid::now_v7(),
                    user,
                    &stock,
                    None,
                    quantity,
                    at,
                ))
            });

        let clock = Arc::new(FixedClock::new(scenario.start));
        let mut runner = Runner::new(mock_context(stocks, deposits, bookings), Arc::clone(&clock));

        runner.seed(&scenario).await?;

        let advance = runner
            .run_step(3, scenario.steps.get(2).ok_or("missing advance step")?)
            .await?;

        assert!(matches!(advance.outcome, Outcome::Applied(_)));
        assert_eq!(clock.now(), later);

        let booked = runner
            .run_step(4, scenario.steps.get(3).ok_or("missing book step")?)
            .await?;

        assert_eq!(booked.at, later);
        assert_eq!(
            booked.outcome,
            Outcome::Applied(format!("{} for 10.00", BookingStatus::Confirmed))
        );

        Ok(())
    }

    #[tokio::test]
    async fn basic_fixture_goes_as_expected() -> TestResult {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/scenarios/basic.yaml");
        let scenario = Scenario::load(&path)?;

        let clock = Arc::new(FixedClock::new(scenario.start));
        let engine = Engine::new(
            EngineConfig::default(),
            clock.clone(),
            Arc::new(LatestExpiration),
        );
        let mut runner = Runner::new(AppContext::new(engine), clock);

        let report = runner.run(&scenario).await?;
        let unexpected: Vec<_> = report.unexpected().collect();

        assert!(unexpected.is_empty(), "unexpected steps: {unexpected:#?}");
        assert_eq!(report.steps.len(), scenario.steps.len());

        let auto_use = report
            .steps
            .iter()
            .find(|step| step.action == "auto_use")
            .ok_or("auto_use step missing")?;

        assert_eq!(auto_use.outcome, Outcome::Applied("2 marked used".to_owned()));

        let balances: Vec<_> = report
            .wallets
            .iter()
            .map(|wallet| (wallet.user.as_str(), wallet.balance, wallet.collected))
            .collect();

        assert_eq!(
            balances,
            [
                ("alice", Amount::from_euros(5), Amount::from_euros(5)),
                ("bob", Amount::ZERO, Amount::ZERO),
            ]
        );

        let reservations: Vec<_> = report
            .stocks
            .iter()
            .map(|stock| (stock.stock.as_str(), stock.reserved, stock.remaining))
            .collect();

        assert_eq!(reservations, [("concert", 2, Some(0)), ("novel", 1, None)]);

        let deleted: Vec<_> = report
            .stocks
            .iter()
            .filter(|stock| stock.deleted)
            .map(|stock| stock.stock.as_str())
            .collect();

        assert_eq!(deleted, ["novel"]);

        Ok(())
    }
}
