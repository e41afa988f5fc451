//! Exchange rate lookup.
//!
//! [`ExchangeRates`] answers "what was the rate of X on day D". The
//! [`RateService`] answers from a local store and falls back to a
//! [`RateProvider`] on a miss, saving whatever the provider returns into a
//! [`RateStore`]: [`MemoryRates`] or the `exchange_rates` table through
//! [`SqlRates`].

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sea_orm::{ActiveValue, DatabaseConnection, entity::prelude::*, sea_query::OnConflict};
use tokio::{
    sync::{RwLock, oneshot},
    task::JoinHandle,
};

use crate::{Clock, CurrencyCode, EngineError, ExchangeRate, ResultEngine};

#[async_trait]
pub trait ExchangeRates: Send + Sync {
    async fn rate(&self, currency: &CurrencyCode, date: NaiveDate) -> ResultEngine<ExchangeRate>;
}

/// Upstream source of daily rates.
#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn fetch_rates(&self, date: NaiveDate) -> ResultEngine<Vec<ExchangeRate>>;
}

/// Local store of daily rates.
#[async_trait]
pub trait RateStore: ExchangeRates {
    /// Inserts the given rates, replacing those already stored for the same
    /// currency and day.
    async fn save_rates(&self, rates: Vec<ExchangeRate>) -> ResultEngine<()>;
}

/// Rates keyed by currency and day.
#[derive(Debug, Default)]
pub struct MemoryRates {
    rates: RwLock<HashMap<(CurrencyCode, NaiveDate), ExchangeRate>>,
}

impl MemoryRates {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the given rates, replacing those already stored for the same
    /// currency and day.
    pub async fn add_or_update_rates(&self, rates: impl IntoIterator<Item = ExchangeRate>) {
        let mut stored = self.rates.write().await;
        for rate in rates {
            stored.insert((rate.currency.clone(), rate.date), rate);
        }
    }
}

#[async_trait]
impl ExchangeRates for MemoryRates {
    async fn rate(&self, currency: &CurrencyCode, date: NaiveDate) -> ResultEngine<ExchangeRate> {
        self.rates
            .read()
            .await
            .get(&(currency.clone(), date))
            .cloned()
            .ok_or_else(|| unknown_rate(currency, date))
    }
}

#[async_trait]
impl RateStore for MemoryRates {
    async fn save_rates(&self, rates: Vec<ExchangeRate>) -> ResultEngine<()> {
        self.add_or_update_rates(rates).await;
        Ok(())
    }
}

fn unknown_rate(currency: &CurrencyCode, date: NaiveDate) -> EngineError {
    EngineError::NotFound(format!("exchange rate {currency} on {date}"))
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "exchange_rates")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub currency: String,
    #[sea_orm(primary_key, auto_increment = false)]
    pub date: Date,
    /// Decimal text.
    pub rate: String,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl From<ExchangeRate> for ActiveModel {
    fn from(rate: ExchangeRate) -> Self {
        Self {
            currency: ActiveValue::Set(rate.currency.into()),
            date: ActiveValue::Set(rate.date),
            rate: ActiveValue::Set(rate.rate.to_string()),
        }
    }
}

impl TryFrom<Model> for ExchangeRate {
    type Error = EngineError;

    fn try_from(model: Model) -> ResultEngine<Self> {
        let invalid = |what: String| {
            EngineError::Database(DbErr::Custom(format!(
                "invalid exchange rate stored for {} on {}: {what}",
                model.currency, model.date
            )))
        };
        let currency =
            CurrencyCode::try_from(model.currency.as_str()).map_err(|err| invalid(err.to_string()))?;
        let rate = Decimal::from_str(&model.rate).map_err(|err| invalid(err.to_string()))?;
        ExchangeRate::new(currency, rate, model.date).map_err(|err| invalid(err.to_string()))
    }
}

/// Rates kept in the `exchange_rates` table.
#[derive(Debug, Clone)]
pub struct SqlRates {
    database: DatabaseConnection,
}

impl SqlRates {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }
}

#[async_trait]
impl ExchangeRates for SqlRates {
    async fn rate(&self, currency: &CurrencyCode, date: NaiveDate) -> ResultEngine<ExchangeRate> {
        Entity::find_by_id((currency.code().to_string(), date))
            .one(&self.database)
            .await?
            .ok_or_else(|| unknown_rate(currency, date))
            .and_then(ExchangeRate::try_from)
    }
}

#[async_trait]
impl RateStore for SqlRates {
    async fn save_rates(&self, rates: Vec<ExchangeRate>) -> ResultEngine<()> {
        if rates.is_empty() {
            return Ok(());
        }
        Entity::insert_many(rates.into_iter().map(ActiveModel::from))
            .on_conflict(
                OnConflict::columns([Column::Currency, Column::Date])
                    .update_column(Column::Rate)
                    .to_owned(),
            )
            .exec_without_returning(&self.database)
            .await?;
        Ok(())
    }
}

/// Provider returning the same fixed rates for every day.
#[derive(Clone, Debug, Default)]
pub struct StaticRateProvider {
    rates: Vec<(CurrencyCode, Decimal)>,
}

impl StaticRateProvider {
    pub fn new(rates: impl IntoIterator<Item = (CurrencyCode, Decimal)>) -> ResultEngine<Self> {
        let rates: Vec<_> = rates.into_iter().collect();
        if let Some((currency, rate)) = rates.iter().find(|(_, rate)| *rate <= Decimal::ZERO) {
            return Err(EngineError::Validation(format!(
                "exchange rate for {currency} must be > 0, got {rate}"
            )));
        }
        Ok(Self { rates })
    }
}

#[async_trait]
impl RateProvider for StaticRateProvider {
    async fn fetch_rates(&self, date: NaiveDate) -> ResultEngine<Vec<ExchangeRate>> {
        self.rates
            .iter()
            .map(|(currency, rate)| ExchangeRate::new(currency.clone(), *rate, date))
            .collect()
    }
}

pub struct RateService {
    store: Arc<dyn RateStore>,
    provider: Arc<dyn RateProvider>,
}

impl RateService {
    pub fn new(store: Arc<dyn RateStore>, provider: Arc<dyn RateProvider>) -> Self {
        Self { store, provider }
    }

    /// Fetches the rates of `date` from the provider and stores them.
    ///
    /// Returns how many rates were stored.
    pub async fn refresh(&self, date: NaiveDate) -> ResultEngine<usize> {
        let rates = self.provider.fetch_rates(date).await?;
        let count = rates.len();
        self.store.save_rates(rates).await?;
        Ok(count)
    }

    /// Spawns a task refreshing today's rates every `every`, starting now.
    ///
    /// Failures are logged and retried on the next tick.
    pub fn spawn_updater(self: Arc<Self>, clock: Arc<dyn Clock>, every: Duration) -> RateUpdater {
        let (stop, mut stopped) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        let today = clock.today();
                        match self.refresh(today).await {
                            Ok(count) => tracing::debug!(%today, count, "exchange rates refreshed"),
                            Err(err) => tracing::warn!(%today, error = %err, "exchange rates refresh failed"),
                        }
                    }
                }
            }
            tracing::debug!("exchange rates updater stopped");
        });
        RateUpdater { stop, handle }
    }
}

#[async_trait]
impl ExchangeRates for RateService {
    async fn rate(&self, currency: &CurrencyCode, date: NaiveDate) -> ResultEngine<ExchangeRate> {
        match self.store.rate(currency, date).await {
            Err(EngineError::NotFound(_)) => {
                self.refresh(date).await?;
                self.store.rate(currency, date).await
            }
            other => other,
        }
    }
}

/// Handle of a running rate updater.
pub struct RateUpdater {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RateUpdater {
    /// Signals the updater to stop and waits for it.
    pub async fn stop(self) {
        let _ = self.stop.send(());
        if let Err(err) = self.handle.await {
            tracing::warn!(error = %err, "exchange rates updater panicked");
        }
    }
}
