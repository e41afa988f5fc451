use std::{
    collections::{BTreeMap, HashMap, btree_map::Entry},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{ExpenseLedger, LedgerScope, Visit};
use crate::{EngineError, Expense, ExpenseId, NewExpense, ResultEngine, UserId};

/// Ledger kept in process memory.
///
/// Each user owns an ordered day index guarded by its own async mutex, so
/// users never contend with each other.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    users: RwLock<HashMap<UserId, Arc<Mutex<UserExpenses>>>>,
    last_id: AtomicI64,
}

#[derive(Debug, Default)]
struct UserExpenses {
    by_date: BTreeMap<NaiveDate, Vec<Expense>>,
    by_id: HashMap<ExpenseId, (NaiveDate, usize)>,
    /// Ids written since the root scope opened, oldest first.
    journal: Vec<ExpenseId>,
}

impl UserExpenses {
    fn insert(&mut self, expense: Expense) {
        let bucket = self.by_date.entry(expense.date).or_default();
        self.by_id.insert(expense.id, (expense.date, bucket.len()));
        bucket.push(expense);
    }

    fn get(&self, id: ExpenseId) -> Option<&Expense> {
        let (date, slot) = self.by_id.get(&id)?;
        self.by_date.get(date)?.get(*slot)
    }

    fn by_date(&self, date: NaiveDate) -> Vec<Expense> {
        self.by_date.get(&date).cloned().unwrap_or_default()
    }

    fn ascend(&self, since: NaiveDate, till: NaiveDate, visit: &mut Visit<'_>) {
        if since > till {
            return;
        }
        for bucket in self.by_date.range(since..=till).map(|(_, bucket)| bucket) {
            for expense in bucket {
                if !visit(expense) {
                    return;
                }
            }
        }
    }

    /// Removes the journaled writes past `mark`, newest first.
    ///
    /// Writes are only appended while the lock is held, so the newest
    /// journaled id is always the last one of its day.
    fn undo_to(&mut self, mark: usize) {
        while self.journal.len() > mark {
            let Some(id) = self.journal.pop() else {
                break;
            };
            let Some((date, _)) = self.by_id.remove(&id) else {
                continue;
            };
            if let Entry::Occupied(mut bucket) = self.by_date.entry(date) {
                bucket.get_mut().pop();
                if bucket.get().is_empty() {
                    bucket.remove();
                }
            }
        }
    }
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The user's section, created on first access. Known users only take
    /// the read lock.
    async fn section(&self, user_id: UserId) -> Arc<Mutex<UserExpenses>> {
        if let Some(section) = self.users.read().await.get(&user_id) {
            return Arc::clone(section);
        }
        Arc::clone(self.users.write().await.entry(user_id).or_default())
    }

    fn next_id(&self) -> ExpenseId {
        self.last_id.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[async_trait]
impl ExpenseLedger for MemoryLedger {
    async fn begin<'a>(&'a self, user_id: UserId) -> ResultEngine<Box<dyn LedgerScope + 'a>> {
        let guard = self.section(user_id).await.lock_owned().await;
        Ok(Box::new(MemoryScope {
            ledger: self,
            user_id,
            mark: guard.journal.len(),
            kind: ScopeKind::Root(guard),
            finished: false,
        }))
    }

    async fn add_expense(&self, user_id: UserId, expense: NewExpense) -> ResultEngine<Expense> {
        let section = self.section(user_id).await;
        let mut expenses = section.lock().await;
        let stored = expense.into_expense(self.next_id());
        expenses.insert(stored.clone());
        Ok(stored)
    }

    async fn expense(&self, user_id: UserId, id: ExpenseId) -> ResultEngine<Expense> {
        let section = self.section(user_id).await;
        let expenses = section.lock().await;
        expenses
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("expense {id}")))
    }

    async fn expenses_by_date(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> ResultEngine<Vec<Expense>> {
        let section = self.section(user_id).await;
        let expenses = section.lock().await;
        Ok(expenses.by_date(date))
    }

    async fn expenses_ascend_since_till(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()> {
        let section = self.section(user_id).await;
        let expenses = section.lock().await;
        expenses.ascend(since, till, visit);
        Ok(())
    }
}

enum ScopeKind<'a> {
    Root(OwnedMutexGuard<UserExpenses>),
    Nested {
        expenses: &'a mut UserExpenses,
        depth: usize,
    },
}

/// Isolation scope of a [`MemoryLedger`].
///
/// A scope that is dropped before `commit` or `rollback` undoes its writes.
pub struct MemoryScope<'a> {
    ledger: &'a MemoryLedger,
    user_id: UserId,
    mark: usize,
    kind: ScopeKind<'a>,
    finished: bool,
}

impl MemoryScope<'_> {
    fn expenses(&mut self) -> &mut UserExpenses {
        match &mut self.kind {
            ScopeKind::Root(guard) => &mut **guard,
            ScopeKind::Nested { expenses, .. } => &mut **expenses,
        }
    }

    fn expenses_ref(&self) -> &UserExpenses {
        match &self.kind {
            ScopeKind::Root(guard) => &**guard,
            ScopeKind::Nested { expenses, .. } => &**expenses,
        }
    }

    fn finish(&mut self, keep: bool) {
        let mark = self.mark;
        let root = matches!(self.kind, ScopeKind::Root(_));
        let expenses = self.expenses();
        if !keep {
            expenses.undo_to(mark);
        } else if root {
            expenses.journal.clear();
        }
        self.finished = true;
    }
}

#[async_trait]
impl LedgerScope for MemoryScope<'_> {
    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn depth(&self) -> usize {
        match self.kind {
            ScopeKind::Root(_) => 0,
            ScopeKind::Nested { depth, .. } => depth,
        }
    }

    async fn nested<'b>(&'b mut self) -> ResultEngine<Box<dyn LedgerScope + 'b>> {
        let ledger = self.ledger;
        let user_id = self.user_id;
        let depth = self.depth() + 1;
        let expenses = self.expenses();
        Ok(Box::new(MemoryScope {
            ledger,
            user_id,
            mark: expenses.journal.len(),
            kind: ScopeKind::Nested { expenses, depth },
            finished: false,
        }))
    }

    async fn add_expense(&mut self, expense: NewExpense) -> ResultEngine<Expense> {
        let stored = expense.into_expense(self.ledger.next_id());
        let expenses = self.expenses();
        expenses.insert(stored.clone());
        expenses.journal.push(stored.id);
        Ok(stored)
    }

    async fn expenses_by_date(&mut self, date: NaiveDate) -> ResultEngine<Vec<Expense>> {
        Ok(self.expenses_ref().by_date(date))
    }

    async fn expenses_ascend_since_till(
        &mut self,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()> {
        self.expenses_ref().ascend(since, till, visit);
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> ResultEngine<()> {
        self.finish(true);
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> ResultEngine<()> {
        self.finish(false);
        Ok(())
    }
}

impl Drop for MemoryScope<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(
                user_id = self.user_id,
                depth = self.depth(),
                "scope dropped unfinished, undoing writes"
            );
            self.finish(false);
        }
    }
}
