use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use futures::TryStreamExt;
use sea_orm::{
    ActiveValue, ConnectionTrait, DatabaseConnection, DatabaseTransaction, QueryFilter, QueryOrder,
    StreamTrait, TransactionTrait, prelude::*, sea_query::OnConflict,
};
use uuid::Uuid;

use super::{ExpenseLedger, LedgerScope, Visit};
use crate::{
    EngineError, Expense, ExpenseId, NewExpense, ResultEngine, UserId, expenses, ledger_locks,
};

/// Ledger backed by the `expenses` table.
///
/// A root scope is a database transaction that starts by writing the
/// user's `ledger_locks` row; nested scopes are savepoints inside it.
#[derive(Debug, Clone)]
pub struct SqlLedger {
    database: DatabaseConnection,
}

impl SqlLedger {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }
}

#[async_trait]
impl ExpenseLedger for SqlLedger {
    async fn begin<'a>(&'a self, user_id: UserId) -> ResultEngine<Box<dyn LedgerScope + 'a>> {
        let tx = self.database.begin().await?;
        lock_user(&tx, user_id).await?;
        Ok(Box::new(SqlScope {
            user_id,
            kind: SqlScopeKind::Root(RootTx {
                tx,
                abandoned: Mutex::new(Vec::new()),
            }),
        }))
    }

    async fn add_expense(&self, user_id: UserId, expense: NewExpense) -> ResultEngine<Expense> {
        let mut scope = self.begin(user_id).await?;
        let stored = scope.add_expense(expense).await?;
        scope.commit().await?;
        Ok(stored)
    }

    async fn expense(&self, user_id: UserId, id: ExpenseId) -> ResultEngine<Expense> {
        let model = expenses::Entity::find_by_id(id)
            .filter(expenses::Column::UserId.eq(user_id))
            .one(&self.database)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("expense {id}")))?;
        Expense::try_from(model)
    }

    async fn expenses_by_date(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> ResultEngine<Vec<Expense>> {
        by_date(&self.database, user_id, date).await
    }

    async fn expenses_ascend_since_till(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()> {
        ascend(&self.database, user_id, since, till, visit).await
    }
}

/// Transaction of a root scope.
struct RootTx {
    tx: DatabaseTransaction,
    /// Savepoints of nested scopes dropped unfinished, innermost first.
    abandoned: Mutex<Vec<String>>,
}

impl RootTx {
    /// Rolls back the savepoints of abandoned nested scopes. Runs before
    /// any statement of a live scope, so their writes are never seen nor
    /// committed.
    async fn settle(&self) -> ResultEngine<()> {
        let abandoned = std::mem::take(
            &mut *self
                .abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for savepoint in abandoned {
            tracing::debug!(savepoint, "rolling back abandoned savepoint");
            rollback_to(&self.tx, &savepoint).await?;
        }
        Ok(())
    }
}

/// A savepoint that, dropped before being resolved, is handed back to the
/// root transaction to be rolled back.
struct Savepoint<'a> {
    root: &'a RootTx,
    name: String,
    resolved: bool,
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.root
                .abandoned
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(std::mem::take(&mut self.name));
        }
    }
}

enum SqlScopeKind<'a> {
    Root(RootTx),
    Nested {
        savepoint: Savepoint<'a>,
        depth: usize,
    },
}

/// Isolation scope of a [`SqlLedger`].
///
/// Dropping an unfinished root scope rolls the transaction back. Dropping an
/// unfinished nested scope rolls its savepoint back before the parent's
/// next statement.
pub struct SqlScope<'a> {
    user_id: UserId,
    kind: SqlScopeKind<'a>,
}

impl SqlScope<'_> {
    fn root(&self) -> &RootTx {
        match &self.kind {
            SqlScopeKind::Root(root) => root,
            SqlScopeKind::Nested { savepoint, .. } => savepoint.root,
        }
    }

    /// Transaction to run the next statement on, once abandoned nested
    /// scopes are rolled back.
    async fn connection(&self) -> ResultEngine<&DatabaseTransaction> {
        let root = self.root();
        root.settle().await?;
        Ok(&root.tx)
    }
}

#[async_trait]
impl LedgerScope for SqlScope<'_> {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn depth(&self) -> usize {
        match self.kind {
            SqlScopeKind::Root(_) => 0,
            SqlScopeKind::Nested { depth, .. } => depth,
        }
    }

    async fn nested<'b>(&'b mut self) -> ResultEngine<Box<dyn LedgerScope + 'b>> {
        let user_id = self.user_id;
        let depth = self.depth() + 1;
        let root = self.root();
        root.settle().await?;
        let name = format!("sp_{}", Uuid::new_v4().simple());
        root.tx.execute_unprepared(&format!("SAVEPOINT {name}")).await?;
        Ok(Box::new(SqlScope {
            user_id,
            kind: SqlScopeKind::Nested {
                savepoint: Savepoint {
                    root,
                    name,
                    resolved: false,
                },
                depth,
            },
        }))
    }

    async fn add_expense(&mut self, expense: NewExpense) -> ResultEngine<Expense> {
        let model = expenses::ActiveModel::from_new(self.user_id, &expense)
            .insert(self.connection().await?)
            .await?;
        Expense::try_from(model)
    }

    async fn expenses_by_date(&mut self, date: NaiveDate) -> ResultEngine<Vec<Expense>> {
        by_date(self.connection().await?, self.user_id, date).await
    }

    async fn expenses_ascend_since_till(
        &mut self,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()> {
        ascend(self.connection().await?, self.user_id, since, till, visit).await
    }

    async fn commit(self: Box<Self>) -> ResultEngine<()> {
        match self.kind {
            SqlScopeKind::Root(root) => {
                root.settle().await?;
                root.tx.commit().await?;
            }
            SqlScopeKind::Nested { mut savepoint, .. } => {
                savepoint.root.settle().await?;
                savepoint
                    .root
                    .tx
                    .execute_unprepared(&format!("RELEASE SAVEPOINT {}", savepoint.name))
                    .await?;
                savepoint.resolved = true;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> ResultEngine<()> {
        match self.kind {
            SqlScopeKind::Root(root) => root.tx.rollback().await?,
            SqlScopeKind::Nested { mut savepoint, .. } => {
                savepoint.root.settle().await?;
                rollback_to(&savepoint.root.tx, &savepoint.name).await?;
                savepoint.resolved = true;
            }
        }
        Ok(())
    }
}

async fn rollback_to(tx: &DatabaseTransaction, savepoint: &str) -> ResultEngine<()> {
    tx.execute_unprepared(&format!("ROLLBACK TO SAVEPOINT {savepoint}"))
        .await?;
    tx.execute_unprepared(&format!("RELEASE SAVEPOINT {savepoint}"))
        .await?;
    Ok(())
}

/// Upserts the user's lock row, holding a write lock on it until the
/// transaction ends.
async fn lock_user(tx: &DatabaseTransaction, user_id: UserId) -> ResultEngine<()> {
    ledger_locks::Entity::insert(ledger_locks::ActiveModel {
        user_id: ActiveValue::Set(user_id),
        locked_at: ActiveValue::Set(Utc::now()),
    })
    .on_conflict(
        OnConflict::column(ledger_locks::Column::UserId)
            .update_column(ledger_locks::Column::LockedAt)
            .to_owned(),
    )
    .exec_without_returning(tx)
    .await?;
    Ok(())
}

async fn by_date<C>(conn: &C, user_id: UserId, date: NaiveDate) -> ResultEngine<Vec<Expense>>
where
    C: ConnectionTrait,
{
    expenses::Entity::find()
        .filter(expenses::Column::UserId.eq(user_id))
        .filter(expenses::Column::Date.eq(date))
        .order_by_asc(expenses::Column::Id)
        .all(conn)
        .await?
        .into_iter()
        .map(Expense::try_from)
        .collect()
}

async fn ascend<C>(
    conn: &C,
    user_id: UserId,
    since: NaiveDate,
    till: NaiveDate,
    visit: &mut Visit<'_>,
) -> ResultEngine<()>
where
    C: ConnectionTrait + StreamTrait + Send,
{
    if since > till {
        return Ok(());
    }
    let rows = expenses::Entity::find()
        .filter(expenses::Column::UserId.eq(user_id))
        .filter(expenses::Column::Date.between(since, till))
        .order_by_asc(expenses::Column::Date)
        .order_by_asc(expenses::Column::Id)
        .stream(conn)
        .await?;
    let mut rows = std::pin::pin!(rows);
    while let Some(model) = rows.try_next().await? {
        let expense = Expense::try_from(model)?;
        if !visit(&expense) {
            break;
        }
    }
    Ok(())
}
