//! Per-user, date-ordered expense storage.
//!
//! Every backend offers the same two surfaces:
//!
//! - [`ExpenseLedger`], direct single-operation access, each call taking the
//!   user's lock for its own duration;
//! - [`LedgerScope`], an isolation scope holding the user's lock until it is
//!   committed, rolled back or dropped. Scopes nest: a nested scope sees the
//!   writes of its parent, and its own writes are undone with the parent's.
//!
//! Use [`isolated`] and [`isolated_nested`] rather than driving scopes by
//! hand: they commit on `Ok` and roll back on `Err`.

use async_trait::async_trait;
use chrono::NaiveDate;
use futures::future::BoxFuture;

use crate::{EngineError, Expense, ExpenseId, NewExpense, ResultEngine, UserId};

mod memory;
mod sql;

pub use memory::{MemoryLedger, MemoryScope};
pub use sql::{SqlLedger, SqlScope};

/// Range visitor. Returning `false` stops the iteration.
pub type Visit<'a> = dyn FnMut(&Expense) -> bool + Send + 'a;

#[async_trait]
pub trait ExpenseLedger: Send + Sync {
    /// Opens a root isolation scope for `user_id`.
    ///
    /// Calling the direct methods below for the same user while the scope is
    /// alive waits for the scope to finish.
    async fn begin<'a>(&'a self, user_id: UserId) -> ResultEngine<Box<dyn LedgerScope + 'a>>;

    /// Stores the expense and returns it with its identity. No validation.
    async fn add_expense(&self, user_id: UserId, expense: NewExpense) -> ResultEngine<Expense>;

    async fn expense(&self, user_id: UserId, id: ExpenseId) -> ResultEngine<Expense>;

    async fn expenses_by_date(&self, user_id: UserId, date: NaiveDate)
    -> ResultEngine<Vec<Expense>>;

    /// Visits the expenses dated in `[since, till]`, by date then insertion
    /// order. `since > till` visits nothing.
    async fn expenses_ascend_since_till(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()>;
}

#[async_trait]
pub trait LedgerScope: Send {
    fn user_id(&self) -> UserId;

    /// `0` for a root scope, parent depth plus one for a nested one.
    fn depth(&self) -> usize;

    /// Opens a scope nested in this one. The parent is unusable until the
    /// nested scope is finished.
    async fn nested<'a>(&'a mut self) -> ResultEngine<Box<dyn LedgerScope + 'a>>;

    async fn add_expense(&mut self, expense: NewExpense) -> ResultEngine<Expense>;

    async fn expenses_by_date(&mut self, date: NaiveDate) -> ResultEngine<Vec<Expense>>;

    async fn expenses_ascend_since_till(
        &mut self,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()>;

    async fn commit(self: Box<Self>) -> ResultEngine<()>;

    async fn rollback(self: Box<Self>) -> ResultEngine<()>;
}

/// Runs `f` inside a root scope of `user_id`.
///
/// The scope commits when `f` returns `Ok` and rolls back otherwise. The
/// error of `f` is returned as is, unless the rollback fails too: then both
/// come back as [`EngineError::Rollback`].
///
/// ```ignore
/// let stored = isolated(ledger, user_id, move |scope| {
///     Box::pin(async move { scope.add_expense(expense).await })
/// })
/// .await?;
/// ```
pub async fn isolated<T, F>(ledger: &dyn ExpenseLedger, user_id: UserId, f: F) -> ResultEngine<T>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut dyn LedgerScope) -> BoxFuture<'s, ResultEngine<T>> + Send,
{
    let scope = ledger.begin(user_id).await?;
    run_scoped(scope, f).await
}

/// Same as [`isolated`], inside a scope nested in `parent`.
pub async fn isolated_nested<T, F>(parent: &mut dyn LedgerScope, f: F) -> ResultEngine<T>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut dyn LedgerScope) -> BoxFuture<'s, ResultEngine<T>> + Send,
{
    let scope = parent.nested().await?;
    run_scoped(scope, f).await
}

async fn run_scoped<T, F>(mut scope: Box<dyn LedgerScope + '_>, f: F) -> ResultEngine<T>
where
    T: Send,
    F: for<'s> FnOnce(&'s mut dyn LedgerScope) -> BoxFuture<'s, ResultEngine<T>> + Send,
{
    let user_id = scope.user_id();
    let depth = scope.depth();
    let outcome = {
        let inner: &mut dyn LedgerScope = scope.as_mut();
        f(inner).await
    };
    match outcome {
        Ok(value) => {
            scope.commit().await?;
            Ok(value)
        }
        Err(err) => match scope.rollback().await {
            Ok(()) => Err(err),
            Err(rollback) => {
                tracing::error!(user_id, depth, error = %rollback, "scope rollback failed");
                Err(EngineError::Rollback {
                    source: Box::new(err),
                    rollback: Box::new(rollback),
                })
            }
        },
    }
}
