//! Current deposit policy
//!
//! A user may hold several deposits over time; a [`CurrentDepositPolicy`]
//! decides which one new bookings are paid from.

use std::fmt::Debug;

use jiff::Timestamp;

use crate::deposits::Deposit;

/// Chooses a user's current deposit among all their deposits.
pub trait CurrentDepositPolicy: Debug + Send + Sync {
    /// The current deposit, `None` if the user has none.
    fn select<'a>(&self, deposits: &'a [Deposit]) -> Option<&'a Deposit>;
}

/// Picks the deposit expiring last, a deposit without expiration date being
/// the latest of all. Ties go to the most recently created deposit.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestExpiration;

impl CurrentDepositPolicy for LatestExpiration {
    fn select<'a>(&self, deposits: &'a [Deposit]) -> Option<&'a Deposit> {
        deposits.iter().max_by_key(|deposit| {
            (
                deposit.expiration_date.unwrap_or(Timestamp::MAX),
                deposit.created_at,
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use jiff::ToSpan;
    use testresult::TestResult;

    use crate::{
        deposits::DepositType,
        ids::{DepositUuid, UserUuid},
        money::Amount,
    };

    use super::*;

    fn deposit(kind: DepositType, created_at: Timestamp) -> Deposit {
        Deposit::new(
            DepositUuid::now_v7(),
            UserUuid::now_v7(),
            Amount::from_euros(30),
            kind,
            created_at,
        )
    }

    #[test]
    fn latest_expiration_wins() -> TestResult {
        let early = Timestamp::UNIX_EPOCH.checked_add(10.hours())?;
        let late = Timestamp::UNIX_EPOCH.checked_add(20.hours())?;
        let deposits = [
            deposit(DepositType::Grant15To17, Timestamp::UNIX_EPOCH).with_expiration(late),
            deposit(DepositType::Grant18, Timestamp::UNIX_EPOCH).with_expiration(early),
        ];

        let current = LatestExpiration.select(&deposits);

        assert_eq!(current.map(|deposit| deposit.kind), Some(DepositType::Grant15To17));

        Ok(())
    }

    #[test]
    fn never_expiring_deposit_is_current() -> TestResult {
        let deposits = [
            deposit(DepositType::Grant18, Timestamp::UNIX_EPOCH)
                .with_expiration(Timestamp::UNIX_EPOCH.checked_add(10.hours())?),
            deposit(DepositType::GrantFree, Timestamp::UNIX_EPOCH),
        ];

        let current = LatestExpiration.select(&deposits);

        assert_eq!(current.map(|deposit| deposit.kind), Some(DepositType::GrantFree));

        Ok(())
    }

    #[test]
    fn no_deposit_means_no_current_deposit() {
        assert!(LatestExpiration.select(&[]).is_none());
    }
}
