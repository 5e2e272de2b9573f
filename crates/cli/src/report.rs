//! Report

use std::{io, ops::Range};

use jiff::Timestamp;
use passbook::money::Amount;
use tabled::{
    Table,
    builder::Builder,
    grid::config::HorizontalLine,
    settings::{
        Alignment, Color, Style, Theme,
        object::{Columns, Rows},
    },
};
use thiserror::Error;

use crate::scenario::Expectation;

/// Errors raised while writing a report.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The output could not be written.
    #[error("failed to write report: {0}")]
    Io(#[from] io::Error),
}

/// What happened to a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The services accepted the step.
    Applied(String),

    /// The services refused the step.
    Refused(String),
}

/// One replayed step.
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Position in the scenario, from 1
    pub index: usize,

    /// Clock reading when the step ran
    pub at: Timestamp,

    /// Step name
    pub action: &'static str,

    /// What the step acted on
    pub subject: String,

    /// Declared expectation, if any
    pub expected: Option<Expectation>,

    /// Result of the step
    pub outcome: Outcome,
}

impl StepRecord {
    /// Whether the outcome agrees with the declared expectation.
    pub fn met_expectation(&self) -> bool {
        match (self.expected, &self.outcome) {
            (None, _)
            | (Some(Expectation::Ok), Outcome::Applied(_))
            | (Some(Expectation::Refused), Outcome::Refused(_)) => true,
            (Some(_), _) => false,
        }
    }
}

/// Final wallet of a user.
#[derive(Debug, Clone)]
pub struct WalletLine {
    /// User name
    pub user: String,

    /// Balance counting every booking that holds credit
    pub balance: Amount,

    /// Balance counting only used and reimbursed bookings
    pub collected: Amount,
}

/// Final state of a stock.
#[derive(Debug, Clone)]
pub struct StockLine {
    /// Stock name
    pub stock: String,

    /// Unit price
    pub price: Amount,

    /// Declared capacity
    pub quantity: Option<u32>,

    /// Units held by bookings
    pub reserved: u32,

    /// Units still bookable
    pub remaining: Option<u32>,

    /// Whether the stock was soft-deleted
    pub deleted: bool,
}

/// Replay report: every step outcome, then wallets and stocks.
#[derive(Debug, Clone)]
pub struct Report {
    /// Step outcomes in replay order
    pub steps: Vec<StepRecord>,

    /// Final wallets, by user name
    pub wallets: Vec<WalletLine>,

    /// Final stocks, by stock name
    pub stocks: Vec<StockLine>,
}

impl Report {
    /// Create a report.
    #[must_use]
    pub fn new(steps: Vec<StepRecord>, wallets: Vec<WalletLine>, stocks: Vec<StockLine>) -> Self {
        Self {
            steps,
            wallets,
            stocks,
        }
    }

    /// Steps whose outcome contradicts their expectation.
    pub fn unexpected(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|step| !step.met_expectation())
    }

    /// Write the three report tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the output cannot be written.
    pub fn write_to(&self, mut out: impl io::Write) -> Result<(), ReportError> {
        writeln!(out, "\n{}", self.steps_table())?;
        writeln!(out, "\n{}", self.wallets_table())?;
        writeln!(out, "\n{}", self.stocks_table())?;

        let unexpected = self.unexpected().count();

        if unexpected > 0 {
            writeln!(out, "\n {unexpected} step(s) did not go as expected")?;
        }

        Ok(())
    }

    fn steps_table(&self) -> Table {
        let mut builder = Builder::default();

        builder.push_record(["#", "At", "Step", "Subject", "Outcome", ""]);

        for step in &self.steps {
            let (outcome, detail) = match &step.outcome {
                Outcome::Applied(detail) => ("applied", detail.as_str()),
                Outcome::Refused(error) => ("refused", error.as_str()),
            };

            let check = match (step.expected, step.met_expectation()) {
                (None, _) => "",
                (Some(_), true) => "as expected",
                (Some(_), false) => "UNEXPECTED",
            };

            builder.push_record([
                format!("{}", step.index),
                step.at.to_string(),
                step.action.to_owned(),
                step.subject.clone(),
                format!("{outcome}: {detail}"),
                check.to_owned(),
            ]);
        }

        styled(builder, 0..1)
    }

    fn wallets_table(&self) -> Table {
        let mut builder = Builder::default();

        builder.push_record(["User", "Balance", "Used & reimbursed"]);

        for wallet in &self.wallets {
            builder.push_record([
                wallet.user.clone(),
                money(wallet.balance),
                money(wallet.collected),
            ]);
        }

        styled(builder, 1..3)
    }

    fn stocks_table(&self) -> Table {
        let mut builder = Builder::default();

        builder.push_record(["Stock", "Price", "Quantity", "Reserved", "Remaining", ""]);

        for stock in &self.stocks {
            builder.push_record([
                stock.stock.clone(),
                stock.price.to_string(),
                stock.quantity.map_or_else(|| "unlimited".to_owned(), |q| q.to_string()),
                stock.reserved.to_string(),
                stock.remaining.map_or_else(|| "-".to_owned(), |q| q.to_string()),
                if stock.deleted { "deleted" } else { "" }.to_owned(),
            ]);
        }

        styled(builder, 1..5)
    }
}

fn money(amount: Amount) -> String {
    amount
        .to_money()
        .map_or_else(|_overflow| amount.to_string(), |money| money.to_string())
}

fn styled(builder: Builder, numeric: Range<usize>) -> Table {
    let mut table = builder.build();
    let mut theme = Theme::from(Style::modern_rounded());
    let separator = HorizontalLine::new(Some('─'), Some('┼'), Some('├'), Some('┤'));

    theme.remove_horizontal_lines();
    theme.insert_horizontal_line(1, separator);

    table.with(theme);
    table.modify(Rows::first(), Color::BOLD);
    table.modify(Columns::new(numeric), Alignment::right());

    table
}
