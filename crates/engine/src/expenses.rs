//! Expense primitives.
//!
//! An `Expense` is a dated, categorized amount stored in the base currency.
//! A `NewExpense` is what callers submit: it has no identity until the ledger
//! stores it.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveValue, entity::prelude::*};
use serde::{Deserialize, Serialize};

use crate::{EngineError, ResultEngine, UserId};

pub type ExpenseId = i64;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub category: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub comment: Option<String>,
}

/// A candidate expense, not yet stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewExpense {
    pub category: String,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub comment: Option<String>,
}

impl NewExpense {
    #[must_use]
    pub fn new(category: impl Into<String>, amount: Decimal, date: NaiveDate) -> Self {
        Self {
            category: category.into(),
            amount,
            date,
            comment: None,
        }
    }

    /// Same as [`NewExpense::new`], dropping the time of day of `at` (UTC).
    #[must_use]
    pub fn at(category: impl Into<String>, amount: Decimal, at: DateTime<Utc>) -> Self {
        Self::new(category, amount, at.date_naive())
    }

    #[must_use]
    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub(crate) fn into_expense(self, id: ExpenseId) -> Expense {
        Expense {
            id,
            category: self.category,
            amount: self.amount,
            date: self.date,
            comment: self.comment,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "expenses")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub category: String,
    /// Decimal text, so that no backend rounds it through a float.
    pub amount: String,
    pub date: Date,
    pub comment: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl ActiveModel {
    pub(crate) fn from_new(user_id: UserId, expense: &NewExpense) -> Self {
        Self {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            category: ActiveValue::Set(expense.category.clone()),
            amount: ActiveValue::Set(expense.amount.to_string()),
            date: ActiveValue::Set(expense.date),
            comment: ActiveValue::Set(expense.comment.clone()),
        }
    }
}

impl TryFrom<Model> for Expense {
    type Error = EngineError;

    fn try_from(model: Model) -> ResultEngine<Self> {
        let amount = Decimal::from_str(&model.amount).map_err(|err| {
            EngineError::Database(DbErr::Custom(format!(
                "invalid amount {:?} stored for expense {}: {err}",
                model.amount, model.id
            )))
        })?;
        Ok(Self {
            id: model.id,
            category: model.category,
            amount,
            date: model.date,
            comment: model.comment,
        })
    }
}
