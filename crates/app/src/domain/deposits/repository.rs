//! Deposits Repository

use jiff::Timestamp;
use passbook::{
    bookings::Booking,
    deposits::{self, Balance, BalanceScope, Deposit, Recredit},
    ids::{DepositUuid, UserUuid},
    incidents::FinanceIncident,
    money::MoneyError,
    policy::CurrentDepositPolicy,
};

use crate::database::Transaction;

#[derive(Debug, Clone, Default)]
pub(crate) struct MemDepositsRepository;

impl MemDepositsRepository {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self
    }

    pub(crate) async fn get_deposit(
        &self,
        tx: &Transaction,
        deposit: DepositUuid,
    ) -> Option<Deposit> {
        tx.get(deposit).await
    }

    pub(crate) fn put_deposit(&self, tx: &mut Transaction, deposit: Deposit) {
        tx.put(deposit);
    }

    pub(crate) fn put_recredit(&self, tx: &mut Transaction, recredit: Recredit) {
        tx.put(recredit);
    }

    pub(crate) async fn deposits_for_user(&self, tx: &Transaction, user: UserUuid) -> Vec<Deposit> {
        tx.select(|deposit: &Deposit| deposit.user == user).await
    }

    /// The deposit `policy` picks among the user's deposits.
    pub(crate) async fn current_deposit(
        &self,
        tx: &Transaction,
        policy: &dyn CurrentDepositPolicy,
        user: UserUuid,
    ) -> Option<Deposit> {
        let deposits = self.deposits_for_user(tx, user).await;

        policy.select(&deposits).cloned()
    }

    /// Balance of `deposit` as seen by the transaction.
    pub(crate) async fn balance(
        &self,
        tx: &Transaction,
        deposit: &Deposit,
        scope: BalanceScope,
        now: Timestamp,
    ) -> Result<Balance, MoneyError> {
        let uuid = deposit.uuid;
        let user = deposit.user;

        let recredits = tx
            .select(|recredit: &Recredit| recredit.deposit == uuid)
            .await;
        let bookings = tx
            .select(|booking: &Booking| booking.deposit == Some(uuid))
            .await;
        let incidents = tx
            .select(|incident: &FinanceIncident| {
                incident
                    .bookings
                    .iter()
                    .any(|line| line.beneficiary == user)
            })
            .await;

        deposits::balance(deposit, &recredits, &bookings, &incidents, scope, now)
    }
}
