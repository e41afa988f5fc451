use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use super::Engine;
use crate::{
    EngineError, Expense, ExpenseId, NewExpense, ResultEngine, UserId,
    ledger::isolated,
    money::{checked_sum, validate_amount},
};

impl Engine {
    /// Records an expense entered in the user's currency.
    ///
    /// The amount is stored in base currency. Expenses dated in the current
    /// (UTC) month are checked against the user's monthly limit while the
    /// user's ledger is locked; other months are never checked.
    #[tracing::instrument(skip(self, expense), fields(category = %expense.category, date = %expense.date))]
    pub async fn add_expense(&self, user_id: UserId, mut expense: NewExpense) -> ResultEngine<Expense> {
        validate_amount(expense.amount, "amount")?;

        if let Some(currency) = self.display_currency(user_id).await? {
            let rate = self.rates.rate(&currency, expense.date).await?;
            expense.amount = rate.convert_to_base(expense.amount)?;
        }

        let today = self.clock.today();
        let stored = if (expense.date.year(), expense.date.month()) == (today.year(), today.month()) {
            self.add_within_limit(user_id, expense).await?
        } else {
            self.ledger.add_expense(user_id, expense).await?
        };

        self.forget_reports(user_id).await;
        tracing::debug!(expense_id = stored.id, amount = %stored.amount, "expense added");
        Ok(stored)
    }

    /// Point lookup, with the amount in the user's currency.
    #[tracing::instrument(skip(self))]
    pub async fn expense(&self, user_id: UserId, id: ExpenseId) -> ResultEngine<Expense> {
        let mut expense = self.ledger.expense(user_id, id).await?;
        if let Some(currency) = self.display_currency(user_id).await? {
            let rate = self.rates.rate(&currency, expense.date).await?;
            expense.amount = rate.convert_from_base(expense.amount)?;
        }
        Ok(expense)
    }

    async fn add_within_limit(&self, user_id: UserId, expense: NewExpense) -> ResultEngine<Expense> {
        let (first, last) = month_bounds(expense.date)?;
        let profiles = Arc::clone(&self.profiles);

        isolated(self.ledger.as_ref(), user_id, move |scope| {
            Box::pin(async move {
                let Some(limit) = profiles.monthly_limit(user_id).await? else {
                    return scope.add_expense(expense).await;
                };

                let mut spent = Decimal::ZERO;
                let mut overflow = false;
                scope
                    .expenses_ascend_since_till(first, last, &mut |stored: &Expense| {
                        match spent.checked_add(stored.amount) {
                            Some(sum) => {
                                spent = sum;
                                true
                            }
                            None => {
                                overflow = true;
                                false
                            }
                        }
                    })
                    .await?;
                if overflow {
                    return Err(EngineError::Validation("amount sum overflow".to_string()));
                }

                if checked_sum(spent, expense.amount)? > limit {
                    tracing::info!(%limit, %spent, attempted = %expense.amount, "monthly limit exceeded");
                    return Err(EngineError::LimitExceeded {
                        limit,
                        spent,
                        attempted: expense.amount,
                    });
                }
                scope.add_expense(expense).await
            })
        })
        .await
    }
}

/// First and last day of the month of `date`.
pub(crate) fn month_bounds(date: NaiveDate) -> ResultEngine<(NaiveDate, NaiveDate)> {
    let first = date.with_day(1);
    let next = match date.month() {
        12 => NaiveDate::from_ymd_opt(date.year() + 1, 1, 1),
        month => NaiveDate::from_ymd_opt(date.year(), month + 1, 1),
    };
    match (first, next.and_then(|next| next.pred_opt())) {
        (Some(first), Some(last)) => Ok((first, last)),
        _ => Err(EngineError::Validation(format!("date out of range: {date}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_bounds_cover_whole_month() {
        assert_eq!(
            month_bounds(date(2026, 2, 14)).unwrap(),
            (date(2026, 2, 1), date(2026, 2, 28))
        );
        assert_eq!(
            month_bounds(date(2028, 2, 29)).unwrap(),
            (date(2028, 2, 1), date(2028, 2, 29))
        );
        assert_eq!(
            month_bounds(date(2026, 12, 31)).unwrap(),
            (date(2026, 12, 1), date(2026, 12, 31))
        );
    }

    #[test]
    fn month_bounds_fail_at_the_end_of_time() {
        assert!(month_bounds(NaiveDate::MAX).is_err());
    }
}
