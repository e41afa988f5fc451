use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::Engine;
use crate::{
    CurrencyCode, ExchangeRate, ExchangeRates, Expense, ResultEngine, SummaryReport,
    UserId, money::checked_sum,
};

impl Engine {
    /// Spend per category over `[since, till]`, in the user's currency.
    ///
    /// Each expense is converted with the rate of its own day.
    #[tracing::instrument(skip(self))]
    pub async fn expenses_summary_by_category(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
    ) -> ResultEngine<SummaryReport> {
        let generation = self.reports.generation(user_id).await?;
        if let Some(cached) = self.reports.get(user_id, since, till).await? {
            tracing::debug!("summary served from cache");
            return Ok(cached);
        }
        let currency = self.display_currency(user_id).await?;

        // Base totals per day, so that each day is converted once after the
        // ledger lock is released.
        let mut daily: BTreeMap<NaiveDate, BTreeMap<String, Decimal>> = BTreeMap::new();
        let mut failure = None;
        self.ledger
            .expenses_ascend_since_till(user_id, since, till, &mut |expense: &Expense| {
                let total = daily
                    .entry(expense.date)
                    .or_default()
                    .entry(expense.category.clone())
                    .or_insert(Decimal::ZERO);
                match checked_sum(*total, expense.amount) {
                    Ok(sum) => {
                        *total = sum;
                        true
                    }
                    Err(err) => {
                        failure = Some(err);
                        false
                    }
                }
            })
            .await?;
        if let Some(err) = failure {
            return Err(err);
        }

        let mut converter = FromBase::new(self.rates.as_ref(), currency.as_ref());
        let mut report = SummaryReport::new();
        for (date, categories) in daily {
            for (category, amount) in categories {
                report.add(&category, converter.convert(amount, date).await?)?;
            }
        }

        self.reports
            .put(user_id, since, till, generation, report.clone())
            .await?;
        Ok(report)
    }

    /// At most `max` expenses of `[since, till]`, oldest first, with amounts
    /// in the user's currency. `max == 0` returns nothing.
    #[tracing::instrument(skip(self))]
    pub async fn expenses_ascend_since_till(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
        max: usize,
    ) -> ResultEngine<Vec<Expense>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let currency = self.display_currency(user_id).await?;

        let mut out = Vec::new();
        self.ledger
            .expenses_ascend_since_till(user_id, since, till, &mut |expense: &Expense| {
                out.push(expense.clone());
                out.len() < max
            })
            .await?;

        let mut converter = FromBase::new(self.rates.as_ref(), currency.as_ref());
        for expense in &mut out {
            expense.amount = converter.convert(expense.amount, expense.date).await?;
        }
        Ok(out)
    }
}

/// Base to user currency conversion, looking each day's rate up once.
struct FromBase<'a> {
    rates: &'a dyn ExchangeRates,
    currency: Option<&'a CurrencyCode>,
    seen: HashMap<NaiveDate, ExchangeRate>,
}

impl<'a> FromBase<'a> {
    fn new(rates: &'a dyn ExchangeRates, currency: Option<&'a CurrencyCode>) -> Self {
        Self {
            rates,
            currency,
            seen: HashMap::new(),
        }
    }

    async fn convert(&mut self, amount: Decimal, date: NaiveDate) -> ResultEngine<Decimal> {
        let Some(currency) = self.currency else {
            return Ok(amount);
        };
        if let Some(rate) = self.seen.get(&date) {
            return rate.convert_from_base(amount);
        }
        let rate = self.rates.rate(currency, date).await?;
        let converted = rate.convert_from_base(amount)?;
        self.seen.insert(date, rate);
        Ok(converted)
    }
}
