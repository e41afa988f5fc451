//! Category summaries and their cache.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, PoisonError},
};

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    ResultEngine, UserId,
    cache::{Cache, LruCache, Synchronized},
    money::checked_sum,
};

/// Spend per category, in the currency the report was requested in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryReport(BTreeMap<String, Decimal>);

impl SummaryReport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, category: &str, amount: Decimal) -> ResultEngine<()> {
        match self.0.get_mut(category) {
            Some(total) => *total = checked_sum(*total, amount)?,
            None => {
                self.0.insert(category.to_string(), amount);
            }
        }
        Ok(())
    }

    pub fn get(&self, category: &str) -> Option<Decimal> {
        self.0.get(category).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.0.iter().map(|(category, amount)| (category.as_str(), *amount))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// One `category=amount` line per category, sorted by category.
    pub fn text(&self) -> String {
        self.0
            .iter()
            .map(|(category, amount)| format!("{category}={amount}\n"))
            .collect()
    }
}

/// Cache of summary reports keyed by `(user, since, till)`.
///
/// Every `drop_user` starts a new generation of the user's reports. A
/// report computed while the user's reports were dropped is stale, and
/// `put` refuses it.
#[async_trait]
pub trait ReportCache: Send + Sync {
    async fn get(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
    ) -> ResultEngine<Option<SummaryReport>>;

    /// Current generation of the user's reports. Read it before computing a
    /// report that is going to be `put`.
    async fn generation(&self, user_id: UserId) -> ResultEngine<u64>;

    /// Stores `report` unless the user's reports were dropped since
    /// `generation` was read.
    async fn put(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
        generation: u64,
        report: SummaryReport,
    ) -> ResultEngine<()>;

    /// Forgets every report of the user.
    async fn drop_user(&self, user_id: UserId) -> ResultEngine<()>;
}

/// Cache that never stores anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopReportCache;

#[async_trait]
impl ReportCache for NoopReportCache {
    async fn get(&self, _: UserId, _: NaiveDate, _: NaiveDate) -> ResultEngine<Option<SummaryReport>> {
        Ok(None)
    }

    async fn generation(&self, _: UserId) -> ResultEngine<u64> {
        Ok(0)
    }

    async fn put(
        &self,
        _: UserId,
        _: NaiveDate,
        _: NaiveDate,
        _: u64,
        _: SummaryReport,
    ) -> ResultEngine<()> {
        Ok(())
    }

    async fn drop_user(&self, _: UserId) -> ResultEngine<()> {
        Ok(())
    }
}

type UserReports = HashMap<(NaiveDate, NaiveDate), SummaryReport>;

/// In-process cache holding the reports of at most `capacity` users.
#[derive(Debug)]
pub struct LruReportCache {
    users: Synchronized<LruCache<UserId, UserReports>>,
    /// Outlives eviction, so an evicted user cannot go back to an older
    /// generation.
    generations: Mutex<HashMap<UserId, u64>>,
}

impl LruReportCache {
    pub fn new(capacity: usize) -> ResultEngine<Self> {
        Ok(Self {
            users: Synchronized::new(LruCache::new(capacity)?),
            generations: Mutex::new(HashMap::new()),
        })
    }

    fn generations(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, u64>> {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ReportCache for LruReportCache {
    async fn get(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
    ) -> ResultEngine<Option<SummaryReport>> {
        let mut users = self.users.lock();
        Ok(users
            .get(&user_id)
            .and_then(|reports| reports.get(&(since, till)))
            .cloned())
    }

    async fn generation(&self, user_id: UserId) -> ResultEngine<u64> {
        Ok(self.generations().get(&user_id).copied().unwrap_or_default())
    }

    async fn put(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
        generation: u64,
        report: SummaryReport,
    ) -> ResultEngine<()> {
        // Held across the insert; `drop_user` takes it first too.
        let generations = self.generations();
        if generations.get(&user_id).copied().unwrap_or_default() != generation {
            tracing::debug!(user_id, "stale report not cached");
            return Ok(());
        }
        let mut users = self.users.lock();
        match users.get_mut(&user_id) {
            Some(reports) => {
                reports.insert((since, till), report);
            }
            None => users.set(user_id, HashMap::from([((since, till), report)])),
        }
        Ok(())
    }

    async fn drop_user(&self, user_id: UserId) -> ResultEngine<()> {
        let mut generations = self.generations();
        *generations.entry(user_id).or_default() += 1;
        self.users.remove::<_, UserReports>(&user_id);
        Ok(())
    }
}
