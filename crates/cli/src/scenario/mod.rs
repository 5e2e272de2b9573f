//! Scenarios
//!
//! A scenario seeds wallets and stocks, then replays an ordered list of
//! steps against the services on a controlled clock. Steps may state whether
//! they are expected to succeed or be refused.

use std::{collections::BTreeMap, fs, path::Path};

use jiff::Timestamp;
use passbook::{
    bookings::{CancellationReason, ValidationAuthor},
    deposits::{DepositType, RecreditType},
    incidents::IncidentKind,
    money::Amount,
};
use passbook_app::domain::{
    bookings::BookingsServiceError, deposits::DepositsServiceError,
    incidents::IncidentsServiceError, stocks::StocksServiceError,
};
use serde::Deserialize;
use thiserror::Error;

mod runner;

pub(crate) use runner::Runner;

/// Scenario loading and replay errors.
#[derive(Debug, Error)]
pub enum ScenarioError {
    /// IO error reading the scenario file
    #[error("failed to read scenario file: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error
    #[error("failed to parse scenario: {0}")]
    Yaml(#[from] serde_norway::Error),

    /// A relative date left the supported range
    #[error("scenario date out of range: {0}")]
    Date(#[from] jiff::Error),

    /// A step names a user the scenario never declared
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// A step names a stock the scenario never declared
    #[error("unknown stock: {0}")]
    UnknownStock(String),

    /// A step names a booking that was never made
    #[error("unknown booking: {0}")]
    UnknownBooking(String),

    /// A step names an incident that was never raised
    #[error("unknown incident: {0}")]
    UnknownIncident(String),

    /// Two bookings or incidents share a name
    #[error("duplicate reference: {0}")]
    DuplicateReference(String),

    /// Seeding or the final summary failed
    #[error(transparent)]
    Service(#[from] StepError),
}

/// A service refusal, recorded as a step outcome.
#[derive(Debug, Error)]
pub enum StepError {
    /// Wrapper for stock service errors.
    #[error(transparent)]
    Stocks(#[from] StocksServiceError),

    /// Wrapper for deposit service errors.
    #[error(transparent)]
    Deposits(#[from] DepositsServiceError),

    /// Wrapper for booking service errors.
    #[error(transparent)]
    Bookings(#[from] BookingsServiceError),

    /// Wrapper for incident service errors.
    #[error(transparent)]
    Incidents(#[from] IncidentsServiceError),
}

/// Scenario file
#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Clock reading when the scenario starts
    pub start: Timestamp,

    /// Beneficiaries and their initial deposit, keyed by name
    #[serde(default)]
    pub users: BTreeMap<String, UserSpec>,

    /// Stocks on sale, keyed by name
    #[serde(default)]
    pub stocks: BTreeMap<String, StockSpec>,

    /// Steps replayed in order
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Read and parse a scenario file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let contents = fs::read_to_string(path)?;

        Self::parse(&contents)
    }

    /// Parse a scenario from YAML.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML does not describe a scenario.
    pub fn parse(contents: &str) -> Result<Self, ScenarioError> {
        Ok(serde_norway::from_str(contents)?)
    }
}

/// A beneficiary and the deposit granted before the first step.
#[derive(Debug, Deserialize)]
pub struct UserSpec {
    /// Granted amount
    pub deposit: Amount,

    /// Grant tier
    #[serde(default = "default_deposit_type")]
    pub kind: DepositType,

    /// Hours after the start when the deposit expires
    #[serde(default)]
    pub expires_in_hours: Option<i64>,
}

fn default_deposit_type() -> DepositType {
    DepositType::Grant18
}

/// A stock seeded before the first step.
#[derive(Debug, Deserialize)]
pub struct StockSpec {
    /// Unit price
    pub price: Amount,

    /// Declared capacity, unlimited when absent
    #[serde(default)]
    pub quantity: Option<u32>,

    /// Offering venue; stocks naming the same venue share it
    #[serde(default = "default_venue")]
    pub venue: String,

    /// Hours after the start when the event begins
    #[serde(default)]
    pub beginning_in_hours: Option<i64>,

    /// Hours after the start when booking closes
    #[serde(default)]
    pub booking_limit_in_hours: Option<i64>,
}

fn default_venue() -> String {
    "venue".to_owned()
}

/// One replayed step.
#[derive(Debug, Deserialize)]
pub struct Step {
    /// What the step does
    #[serde(flatten)]
    pub action: Action,

    /// Expected outcome, unchecked when absent
    #[serde(default)]
    pub expect: Option<Expectation>,
}

/// Whether a step should go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expectation {
    /// The services accept the step.
    Ok,

    /// The services refuse the step.
    Refused,
}

/// Step actions
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Reserve units of a stock.
    Book(BookStep),

    /// Cancel a booking.
    Cancel(CancelStep),

    /// Validate a booking as used.
    Use(UseStep),

    /// Undo a validation.
    Unuse(BookingRef),

    /// Restore a cancelled booking as used.
    Uncancel(BookingRef),

    /// Record a reimbursement to the venue.
    Reimburse(BookingRef),

    /// Add credit to the user's current deposit.
    Recredit(RecreditStep),

    /// Raise a finance incident.
    Incident(IncidentStep),

    /// Validate a finance incident.
    ValidateIncident(IncidentRef),

    /// Cancel a finance incident.
    CancelIncident(IncidentRef),

    /// Expire the user's current deposit.
    ExpireDeposit(UserRef),

    /// Change a stock's declared capacity.
    SetQuantity(QuantityStep),

    /// Soft-delete a stock.
    DeleteStock(StockRef),

    /// Mark bookings of past events as used.
    AutoUse(AutoUseStep),

    /// Move the clock forward.
    Advance(AdvanceStep),
}

/// `book` step
#[derive(Debug, Deserialize)]
pub struct BookStep {
    /// Name later steps use for the booking
    pub booking: String,

    /// Booking user
    pub user: String,

    /// Booked stock
    pub stock: String,

    /// Units booked
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

fn default_quantity() -> u32 {
    1
}

/// `cancel` step
#[derive(Debug, Deserialize)]
pub struct CancelStep {
    /// Cancelled booking
    pub booking: String,

    /// Why the booking is cancelled
    #[serde(default = "default_cancellation_reason")]
    pub reason: CancellationReason,

    /// Cancel with back-office authority
    #[serde(default)]
    pub admin: bool,
}

fn default_cancellation_reason() -> CancellationReason {
    CancellationReason::Beneficiary
}

/// `use` step
#[derive(Debug, Deserialize)]
pub struct UseStep {
    /// Validated booking
    pub booking: String,

    /// Who validates the booking
    #[serde(default = "default_validation_author")]
    pub author: ValidationAuthor,
}

fn default_validation_author() -> ValidationAuthor {
    ValidationAuthor::Offerer
}

/// A step acting on one booking.
#[derive(Debug, Deserialize)]
pub struct BookingRef {
    /// Booking name
    pub booking: String,
}

/// `recredit` step
#[derive(Debug, Deserialize)]
pub struct RecreditStep {
    /// Credited user
    pub user: String,

    /// Added amount
    pub amount: Amount,

    /// Why credit is added
    #[serde(default = "default_recredit_type")]
    pub kind: RecreditType,

    /// Free-form note
    #[serde(default)]
    pub comment: Option<String>,
}

fn default_recredit_type() -> RecreditType {
    RecreditType::ManualModification
}

/// `incident` step
#[derive(Debug, Deserialize)]
pub struct IncidentStep {
    /// Name later steps use for the incident
    pub incident: String,

    /// Overpayment or commercial gesture
    #[serde(default = "default_incident_kind")]
    pub kind: IncidentKind,

    /// Bookings covered by the incident
    pub bookings: Vec<String>,

    /// Clawed back (overpayment) or paid (commercial gesture) amount
    pub amount: Amount,

    /// Free-form origin of the incident
    #[serde(default)]
    pub origin: Option<String>,
}

fn default_incident_kind() -> IncidentKind {
    IncidentKind::Overpayment
}

/// A step acting on one incident.
#[derive(Debug, Deserialize)]
pub struct IncidentRef {
    /// Incident name
    pub incident: String,
}

/// A step acting on one user.
#[derive(Debug, Deserialize)]
pub struct UserRef {
    /// User name
    pub user: String,
}

/// A step acting on one stock.
#[derive(Debug, Deserialize)]
pub struct StockRef {
    /// Stock name
    pub stock: String,
}

/// `set_quantity` step
#[derive(Debug, Deserialize)]
pub struct QuantityStep {
    /// Changed stock
    pub stock: String,

    /// New capacity, unlimited when absent
    #[serde(default)]
    pub quantity: Option<u32>,
}

/// `auto_use` step
#[derive(Debug, Default, Deserialize)]
pub struct AutoUseStep {}

/// `advance` step
#[derive(Debug, Deserialize)]
pub struct AdvanceStep {
    /// Hours the clock moves forward
    pub hours: i64,
}
