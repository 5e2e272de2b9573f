//! Deposits Service

use async_trait::async_trait;
use mockall::automock;
use passbook::{
    deposits::{self, BalanceScope, Deposit, Recredit, RecreditType},
    ids::{DepositUuid, RecreditUuid, UserUuid},
    money::Amount,
};
use tracing::{Span, info};

use crate::{
    database::RowKey,
    domain::deposits::{DepositsServiceError, MemDepositsRepository},
    engine::Engine,
};

#[derive(Debug, Clone)]
pub struct MemDepositsService {
    engine: Engine,
    deposits: MemDepositsRepository,
}

impl MemDepositsService {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            deposits: MemDepositsRepository::new(),
        }
    }

    async fn try_create_deposit(&self, deposit: &Deposit) -> Result<Deposit, DepositsServiceError> {
        let mut tx = self
            .engine
            .db
            .begin([RowKey::User(deposit.user), RowKey::Deposit(deposit.uuid)])
            .await?;

        if self.deposits.get_deposit(&tx, deposit.uuid).await.is_some() {
            return Err(DepositsServiceError::AlreadyExists);
        }

        let existing = self.deposits.deposits_for_user(&tx, deposit.user).await;

        deposits::check_new_grant(
            &existing,
            deposit.kind,
            deposit.amount,
            self.engine.clock.now(),
        )?;

        self.deposits.put_deposit(&mut tx, deposit.clone());

        tx.commit().await;

        info!(
            deposit = %deposit.uuid,
            user = %deposit.user,
            kind = %deposit.kind,
            amount = %deposit.amount,
            "granted deposit"
        );

        Ok(deposit.clone())
    }

    async fn try_add_recredit(
        &self,
        uuid: DepositUuid,
        amount: Amount,
        kind: RecreditType,
        comment: Option<&str>,
    ) -> Result<Recredit, DepositsServiceError> {
        let mut tx = self.engine.db.begin([RowKey::Deposit(uuid)]).await?;

        let deposit = self
            .deposits
            .get_deposit(&tx, uuid)
            .await
            .ok_or(DepositsServiceError::NotFound)?;

        let recredit = deposit.recredit(
            RecreditUuid::now_v7(),
            amount,
            kind,
            comment.map(str::to_owned),
            self.engine.clock.now(),
        )?;

        self.deposits.put_recredit(&mut tx, recredit.clone());

        tx.commit().await;

        info!(deposit = %uuid, recredit = %recredit.uuid, %amount, "recredited deposit");

        Ok(recredit)
    }

    async fn try_expire_current_deposit(
        &self,
        user: UserUuid,
    ) -> Result<Deposit, DepositsServiceError> {
        let mut tx = self.engine.db.begin([RowKey::User(user)]).await?;

        let mut deposit = self
            .deposits
            .current_deposit(&tx, self.engine.policy.as_ref(), user)
            .await
            .ok_or(DepositsServiceError::NotFound)?;

        tx.lock(RowKey::Deposit(deposit.uuid)).await?;

        deposit.expire(self.engine.clock.now())?;

        self.deposits.put_deposit(&mut tx, deposit.clone());

        tx.commit().await;

        info!(deposit = %deposit.uuid, %user, "expired deposit");

        Ok(deposit)
    }

    async fn try_get_wallet_balance(
        &self,
        user: UserUuid,
        only_used_and_reimbursed: bool,
    ) -> Result<Amount, DepositsServiceError> {
        let tx = self.engine.db.begin([RowKey::User(user)]).await?;

        let deposit = self
            .deposits
            .current_deposit(&tx, self.engine.policy.as_ref(), user)
            .await
            .ok_or(DepositsServiceError::NotFound)?;

        Span::current().record("deposit", tracing::field::display(deposit.uuid));

        let scope = BalanceScope::from_only_used_and_reimbursed(only_used_and_reimbursed);
        let balance = self
            .deposits
            .balance(&tx, &deposit, scope, self.engine.clock.now())
            .await?;

        tx.commit().await;

        Ok(balance.reported()?)
    }
}

#[async_trait]
impl DepositsService for MemDepositsService {
    #[tracing::instrument(
        name = "deposits.service.create_deposit",
        skip_all,
        fields(deposit = %deposit.uuid, user = %deposit.user),
        err(level = "warn")
    )]
    async fn create_deposit(&self, deposit: Deposit) -> Result<Deposit, DepositsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_create_deposit(&deposit))
            .await
    }

    #[tracing::instrument(
        name = "deposits.service.add_recredit",
        skip(self, comment),
        fields(deposit = %uuid, amount = %amount),
        err(level = "warn")
    )]
    async fn add_recredit(
        &self,
        uuid: DepositUuid,
        amount: Amount,
        kind: RecreditType,
        comment: Option<String>,
    ) -> Result<Recredit, DepositsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_add_recredit(uuid, amount, kind, comment.as_deref()))
            .await
    }

    #[tracing::instrument(
        name = "deposits.service.expire_current_deposit",
        skip(self),
        fields(user = %user),
        err
    )]
    async fn expire_current_deposit(&self, user: UserUuid) -> Result<Deposit, DepositsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_expire_current_deposit(user))
            .await
    }

    async fn current_deposit(&self, user: UserUuid) -> Result<Deposit, DepositsServiceError> {
        let tx = self.engine.db.begin([]).await?;

        let deposit = self
            .deposits
            .current_deposit(&tx, self.engine.policy.as_ref(), user)
            .await
            .ok_or(DepositsServiceError::NotFound)?;

        tx.commit().await;

        Ok(deposit)
    }

    #[tracing::instrument(
        name = "deposits.service.get_wallet_balance",
        skip(self),
        fields(user = %user, deposit = tracing::field::Empty),
        err
    )]
    async fn get_wallet_balance(
        &self,
        user: UserUuid,
        only_used_and_reimbursed: bool,
    ) -> Result<Amount, DepositsServiceError> {
        self.engine
            .config
            .retry
            .retry(|| self.try_get_wallet_balance(user, only_used_and_reimbursed))
            .await
    }
}

#[automock]
#[async_trait]
pub trait DepositsService: Send + Sync {
    /// Grant a deposit. A user holds at most one deposit of each kind and no
    /// new grant is made while an earlier one is active.
    async fn create_deposit(&self, deposit: Deposit) -> Result<Deposit, DepositsServiceError>;

    /// Append a recredit to a deposit. Existing bookings are not re-evaluated.
    async fn add_recredit(
        &self,
        uuid: DepositUuid,
        amount: Amount,
        kind: RecreditType,
        comment: Option<String>,
    ) -> Result<Recredit, DepositsServiceError>;

    /// Expire the user's current deposit now. Past consumption is kept.
    async fn expire_current_deposit(&self, user: UserUuid) -> Result<Deposit, DepositsServiceError>;

    /// The deposit new bookings are paid from.
    async fn current_deposit(&self, user: UserUuid) -> Result<Deposit, DepositsServiceError>;

    /// Wallet balance of the current deposit, never below zero. With
    /// `only_used_and_reimbursed` only collected bookings count as spent.
    async fn get_wallet_balance(
        &self,
        user: UserUuid,
        only_used_and_reimbursed: bool,
    ) -> Result<Amount, DepositsServiceError>;
}
