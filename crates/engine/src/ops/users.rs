use rust_decimal::Decimal;

use super::Engine;
use crate::{CurrencyCode, ResultEngine, UserId, money::validate_amount};

impl Engine {
    /// Registers a user entering amounts in `currency`, unless known.
    ///
    /// Returns `true` when the user is new.
    #[tracing::instrument(skip(self))]
    pub async fn register_user(
        &self,
        user_id: UserId,
        currency: CurrencyCode,
    ) -> ResultEngine<bool> {
        self.profiles.create_user_if_not_exists(user_id, currency).await
    }

    /// Changes the currency the user enters and reads amounts in.
    ///
    /// Stored amounts stay in base currency; the user's cached reports, which
    /// are in the old currency, are dropped.
    #[tracing::instrument(skip(self))]
    pub async fn change_currency(
        &self,
        user_id: UserId,
        currency: CurrencyCode,
    ) -> ResultEngine<()> {
        self.profiles.change_currency(user_id, currency).await?;
        self.forget_reports(user_id).await;
        Ok(())
    }

    /// Sets the monthly limit of the user, in base currency. `None` lifts it.
    #[tracing::instrument(skip(self))]
    pub async fn set_monthly_limit(
        &self,
        user_id: UserId,
        limit: Option<Decimal>,
    ) -> ResultEngine<()> {
        if let Some(limit) = limit {
            validate_amount(limit, "monthly limit")?;
        }
        self.profiles.set_monthly_limit(user_id, limit).await
    }
}
