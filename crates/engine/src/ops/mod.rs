use std::sync::Arc;

use crate::{
    Clock, CurrencyCode, EngineError, ExchangeRates, ExpenseLedger, NoopReportCache, ReportCache,
    ResultEngine, SystemClock, UserId, UserProfiles,
};

mod expenses;
mod reports;
mod users;

/// Records expenses under each user's monthly limit and answers reports in
/// the user's currency.
pub struct Engine {
    base_currency: CurrencyCode,
    ledger: Arc<dyn ExpenseLedger>,
    profiles: Arc<dyn UserProfiles>,
    rates: Arc<dyn ExchangeRates>,
    reports: Arc<dyn ReportCache>,
    clock: Arc<dyn Clock>,
}

impl Engine {
    /// Return a builder for `Engine`. Help to build the struct.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn base_currency(&self) -> &CurrencyCode {
        &self.base_currency
    }

    /// Currency the user reads amounts in, `None` when it is the base one.
    async fn display_currency(&self, user_id: UserId) -> ResultEngine<Option<CurrencyCode>> {
        let currency = self.profiles.currency(user_id).await?;
        Ok((currency != self.base_currency).then_some(currency))
    }

    /// Drops the user's cached reports. Called after a committed write, so a
    /// failure is only logged.
    async fn forget_reports(&self, user_id: UserId) {
        if let Err(err) = self.reports.drop_user(user_id).await {
            tracing::warn!(user_id, error = %err, "cached reports not dropped");
        }
    }
}

impl core::fmt::Debug for Engine {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Engine")
            .field("base_currency", &self.base_currency)
            .finish_non_exhaustive()
    }
}

/// The builder for `Engine`
#[derive(Default)]
pub struct EngineBuilder {
    base_currency: Option<CurrencyCode>,
    ledger: Option<Arc<dyn ExpenseLedger>>,
    profiles: Option<Arc<dyn UserProfiles>>,
    rates: Option<Arc<dyn ExchangeRates>>,
    reports: Option<Arc<dyn ReportCache>>,
    clock: Option<Arc<dyn Clock>>,
}

impl EngineBuilder {
    /// Currency every stored amount is expressed in
    pub fn base_currency(mut self, currency: CurrencyCode) -> EngineBuilder {
        self.base_currency = Some(currency);
        self
    }

    /// Pass the required ledger
    pub fn ledger(mut self, ledger: Arc<dyn ExpenseLedger>) -> EngineBuilder {
        self.ledger = Some(ledger);
        self
    }

    /// Pass the required user profiles
    pub fn profiles(mut self, profiles: Arc<dyn UserProfiles>) -> EngineBuilder {
        self.profiles = Some(profiles);
        self
    }

    /// Pass the required exchange rates
    pub fn rates(mut self, rates: Arc<dyn ExchangeRates>) -> EngineBuilder {
        self.rates = Some(rates);
        self
    }

    /// Report cache, none by default
    pub fn reports(mut self, reports: Arc<dyn ReportCache>) -> EngineBuilder {
        self.reports = Some(reports);
        self
    }

    /// Clock deciding the current month, the system one by default
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> EngineBuilder {
        self.clock = Some(clock);
        self
    }

    /// Construct `Engine`
    pub fn build(self) -> ResultEngine<Engine> {
        Ok(Engine {
            base_currency: self
                .base_currency
                .ok_or(EngineError::MissingDependency("base_currency"))?,
            ledger: self.ledger.ok_or(EngineError::MissingDependency("ledger"))?,
            profiles: self
                .profiles
                .ok_or(EngineError::MissingDependency("profiles"))?,
            rates: self.rates.ok_or(EngineError::MissingDependency("rates"))?,
            reports: self
                .reports
                .unwrap_or_else(|| Arc::new(NoopReportCache)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}
