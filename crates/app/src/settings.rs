//! Handles settings for the application. Configuration is written in
//! `config/tally.toml` (or the file passed with `--config`) and can be
//! overridden by `TALLY__*` environment variables, e.g.
//! `TALLY__BASE_CURRENCY=EUR`.
use std::collections::HashMap;

use config::{Config, ConfigError, Environment, File};
use engine::CurrencyCode;
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Storage {
    Memory,
    Sqlite { path: String },
}

impl Default for Storage {
    fn default() -> Self {
        Self::Sqlite {
            path: String::from("tally.db"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
    pub currency: CurrencyCode,
    pub monthly_limit: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_level")]
    pub level: String,
    pub base_currency: CurrencyCode,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub users: Vec<User>,
    /// Units of each currency per unit of base currency.
    #[serde(default)]
    pub rates: HashMap<String, Decimal>,
    #[serde(default = "default_rates_refresh_secs")]
    pub rates_refresh_secs: u64,
    #[serde(default = "default_report_cache_capacity")]
    pub report_cache_capacity: usize,
}

fn default_level() -> String {
    String::from("info")
}

fn default_rates_refresh_secs() -> u64 {
    3600
}

fn default_report_cache_capacity() -> usize {
    128
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("TALLY").separator("__"))
            .build()?;

        settings.try_deserialize()
    }

    /// Static rate table with validated currency codes.
    pub fn rate_table(&self) -> Result<Vec<(CurrencyCode, Decimal)>, engine::EngineError> {
        self.rates
            .iter()
            .map(|(code, rate)| Ok((CurrencyCode::try_from(code.as_str())?, *rate)))
            .collect()
    }
}
