use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use migration::MigratorTrait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ConnectOptions, Database, DbErr};
use tempfile::TempDir;
use tokio::sync::Notify;

use engine::{
    CurrencyCode, Engine, EngineError, ExchangeRate, Expense, ExpenseId, ExpenseLedger,
    FixedClock, LedgerScope, LruReportCache, MAX_AMOUNT, MemoryLedger, MemoryProfiles,
    MemoryRates, NewExpense, RateStore, ReportCache, ResultEngine, SqlLedger, SqlProfiles,
    SqlRates, SummaryReport, UserId, UserProfiles, Visit,
};

const LIMITED: i64 = 1;
const UNLIMITED: i64 = 2;
const DOLLARS: i64 = 3;

struct Fixture {
    engine: Arc<Engine>,
    ledger: Arc<dyn ExpenseLedger>,
    profiles: Arc<dyn UserProfiles>,
    rates: Arc<dyn RateStore>,
}

fn code(raw: &str) -> CurrencyCode {
    CurrencyCode::try_from(raw).unwrap()
}

/// "Now" is 2026-05-15.
fn may(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 5, d).unwrap()
}

fn april(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 4, d).unwrap()
}

async fn fixture(ledger: Arc<dyn ExpenseLedger>) -> Fixture {
    stores_fixture(
        ledger,
        Arc::new(MemoryProfiles::new()),
        Arc::new(MemoryRates::new()),
        Arc::new(LruReportCache::new(8).unwrap()),
    )
    .await
}

async fn stores_fixture(
    ledger: Arc<dyn ExpenseLedger>,
    profiles: Arc<dyn UserProfiles>,
    rates: Arc<dyn RateStore>,
    reports: Arc<dyn ReportCache>,
) -> Fixture {
    for (user_id, currency) in [(LIMITED, "RUB"), (UNLIMITED, "RUB"), (DOLLARS, "USD")] {
        assert!(
            profiles
                .create_user_if_not_exists(user_id, code(currency))
                .await
                .unwrap()
        );
    }
    profiles
        .set_monthly_limit(LIMITED, Some(dec!(100)))
        .await
        .unwrap();

    rates
        .save_rates(vec![
            ExchangeRate::new(code("USD"), dec!(0.01), may(14)).unwrap(),
            ExchangeRate::new(code("USD"), dec!(0.02), may(15)).unwrap(),
        ])
        .await
        .unwrap();

    let engine = Engine::builder()
        .base_currency(code("RUB"))
        .ledger(ledger.clone())
        .profiles(profiles.clone())
        .rates(rates.clone())
        .reports(reports)
        .clock(Arc::new(FixedClock(
            Utc.with_ymd_and_hms(2026, 5, 15, 12, 0, 0).unwrap(),
        )))
        .build()
        .unwrap();

    Fixture {
        engine: Arc::new(engine),
        ledger,
        profiles,
        rates,
    }
}

async fn memory_fixture() -> Fixture {
    fixture(Arc::new(MemoryLedger::new())).await
}

async fn sql_fixture() -> Fixture {
    let db = Database::connect("sqlite::memory:").await.unwrap();
    migration::Migrator::up(&db, None).await.unwrap();
    fixture(Arc::new(SqlLedger::new(db))).await
}

/// Everything in one sqlite file. The ledger pool has several connections,
/// profiles and rates are read through a pool of their own.
async fn sql_file_fixture(dir: &TempDir) -> Fixture {
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("tally.db").display());
    let ledger_db = Database::connect(ConnectOptions::new(url.clone()).max_connections(8).to_owned())
        .await
        .unwrap();
    migration::Migrator::up(&ledger_db, None).await.unwrap();
    let lookups = Database::connect(url).await.unwrap();
    stores_fixture(
        Arc::new(SqlLedger::new(ledger_db)),
        Arc::new(SqlProfiles::new(lookups.clone())),
        Arc::new(SqlRates::new(lookups)),
        Arc::new(LruReportCache::new(8).unwrap()),
    )
    .await
}

async fn month_total(fixture: &Fixture, user_id: i64) -> Decimal {
    fixture
        .engine
        .expenses_ascend_since_till(user_id, may(1), may(31), usize::MAX)
        .await
        .unwrap()
        .iter()
        .map(|e| e.amount)
        .sum()
}

/// One-shot pause of a direct range scan, right after it read the ledger.
#[derive(Debug, Default)]
struct ScanGate {
    armed: AtomicBool,
    scanned: Notify,
    release: Notify,
}

/// Memory ledger counting range scans, the ones of its scopes included.
#[derive(Debug, Default)]
struct WatchedLedger {
    inner: MemoryLedger,
    scans: AtomicUsize,
    gate: ScanGate,
}

impl WatchedLedger {
    fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExpenseLedger for WatchedLedger {
    async fn begin<'a>(&'a self, user_id: UserId) -> ResultEngine<Box<dyn LedgerScope + 'a>> {
        let inner = self.inner.begin(user_id).await?;
        Ok(Box::new(WatchedScope {
            inner,
            scans: &self.scans,
        }))
    }

    async fn add_expense(&self, user_id: UserId, expense: NewExpense) -> ResultEngine<Expense> {
        self.inner.add_expense(user_id, expense).await
    }

    async fn expense(&self, user_id: UserId, id: ExpenseId) -> ResultEngine<Expense> {
        self.inner.expense(user_id, id).await
    }

    async fn expenses_by_date(
        &self,
        user_id: UserId,
        date: NaiveDate,
    ) -> ResultEngine<Vec<Expense>> {
        self.inner.expenses_by_date(user_id, date).await
    }

    async fn expenses_ascend_since_till(
        &self,
        user_id: UserId,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner
            .expenses_ascend_since_till(user_id, since, till, visit)
            .await?;
        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.scanned.notify_one();
            self.gate.release.notified().await;
        }
        Ok(())
    }
}

struct WatchedScope<'a> {
    inner: Box<dyn LedgerScope + 'a>,
    scans: &'a AtomicUsize,
}

#[async_trait]
impl LedgerScope for WatchedScope<'_> {
    fn user_id(&self) -> UserId {
        self.inner.user_id()
    }

    fn depth(&self) -> usize {
        self.inner.depth()
    }

    async fn nested<'b>(&'b mut self) -> ResultEngine<Box<dyn LedgerScope + 'b>> {
        let inner = self.inner.nested().await?;
        Ok(Box::new(WatchedScope {
            inner,
            scans: self.scans,
        }))
    }

    async fn add_expense(&mut self, expense: NewExpense) -> ResultEngine<Expense> {
        self.inner.add_expense(expense).await
    }

    async fn expenses_by_date(&mut self, date: NaiveDate) -> ResultEngine<Vec<Expense>> {
        self.inner.expenses_by_date(date).await
    }

    async fn expenses_ascend_since_till(
        &mut self,
        since: NaiveDate,
        till: NaiveDate,
        visit: &mut Visit<'_>,
    ) -> ResultEngine<()> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.expenses_ascend_since_till(since, till, visit).await
    }

    async fn commit(self: Box<Self>) -> ResultEngine<()> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> ResultEngine<()> {
        self.inner.rollback().await
    }
}

/// Report cache that cannot drop anything.
struct StuckReportCache;

#[async_trait]
impl ReportCache for StuckReportCache {
    async fn get(
        &self,
        _: UserId,
        _: NaiveDate,
        _: NaiveDate,
    ) -> ResultEngine<Option<SummaryReport>> {
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
        Err(EngineError::Database(DbErr::Custom(
            "report cache unreachable".to_string(),
        )))
    }
}

async fn limit_scenario(fixture: Fixture) {
    let engine = &fixture.engine;

    let stored = engine
        .add_expense(LIMITED, NewExpense::new("food", dec!(60), may(15)))
        .await
        .unwrap();
    assert_eq!(stored.amount, dec!(60));

    let err = engine
        .add_expense(LIMITED, NewExpense::new("food", dec!(50), may(15)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::LimitExceeded {
            limit: dec!(100),
            spent: dec!(60),
            attempted: dec!(50),
        }
    );
    assert!(err.is_limit_exceeded());
    // Nothing was written by the rejected add.
    assert_eq!(month_total(&fixture, LIMITED).await, dec!(60));

    engine
        .add_expense(LIMITED, NewExpense::new("food", dec!(30), april(30)))
        .await
        .unwrap();

    // Exactly reaching the limit is allowed.
    engine
        .add_expense(LIMITED, NewExpense::new("taxi", dec!(40), may(1)))
        .await
        .unwrap();
    assert_eq!(month_total(&fixture, LIMITED).await, dec!(100));
    assert!(
        engine
            .add_expense(LIMITED, NewExpense::new("taxi", dec!(0.01), may(31)))
            .await
            .unwrap_err()
            .is_limit_exceeded()
    );
}

#[tokio::test]
async fn memory_limit_scenario() {
    limit_scenario(memory_fixture().await).await;
}

#[tokio::test]
async fn sql_limit_scenario() {
    limit_scenario(sql_fixture().await).await;
}

#[tokio::test]
async fn sql_file_limit_scenario() {
    let dir = tempfile::tempdir().unwrap();
    limit_scenario(sql_file_fixture(&dir).await).await;
}

#[tokio::test]
async fn backfill_ignores_limit() {
    let fixture = memory_fixture().await;
    fixture
        .engine
        .add_expense(LIMITED, NewExpense::new("rent", dec!(5000), april(2)))
        .await
        .unwrap();
    fixture
        .engine
        .add_expense(LIMITED, NewExpense::new("food", dec!(100), may(2)))
        .await
        .unwrap();
}

#[tokio::test]
async fn no_limit_never_rejects() {
    let ledger = Arc::new(WatchedLedger::default());
    let fixture = fixture(ledger.clone()).await;
    for _ in 0..3 {
        fixture
            .engine
            .add_expense(UNLIMITED, NewExpense::new("car", dec!(1000000), may(15)))
            .await
            .unwrap();
    }
    // Without a limit the month is never summed.
    assert_eq!(ledger.scans(), 0);
    assert_eq!(month_total(&fixture, UNLIMITED).await, dec!(3000000));

    fixture
        .engine
        .add_expense(LIMITED, NewExpense::new("car", dec!(1), may(15)))
        .await
        .unwrap();
    assert_eq!(ledger.scans(), 2);
}

#[tokio::test]
async fn limit_can_be_lifted() {
    let fixture = memory_fixture().await;
    let big = || NewExpense::new("car", dec!(500), may(15));
    assert!(fixture.engine.add_expense(LIMITED, big()).await.is_err());

    fixture
        .profiles
        .set_monthly_limit(LIMITED, None)
        .await
        .unwrap();
    fixture.engine.add_expense(LIMITED, big()).await.unwrap();
}

async fn concurrent_adds(fixture: Fixture) {
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let engine = Arc::clone(&fixture.engine);
        tasks.spawn(async move {
            engine
                .add_expense(LIMITED, NewExpense::new("coffee", dec!(20), may(15)))
                .await
        });
    }

    let mut accepted = 0;
    let mut rejected = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(_) => accepted += 1,
            Err(err) if err.is_limit_exceeded() => rejected += 1,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
    assert_eq!((accepted, rejected), (5, 5));
    assert_eq!(month_total(&fixture, LIMITED).await, dec!(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_concurrent_adds() {
    concurrent_adds(memory_fixture().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sql_concurrent_adds() {
    concurrent_adds(sql_fixture().await).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sql_file_concurrent_adds() {
    let dir = tempfile::tempdir().unwrap();
    concurrent_adds(sql_file_fixture(&dir).await).await;
}

#[tokio::test]
async fn amounts_are_validated() {
    let fixture = memory_fixture().await;
    for amount in [Decimal::ZERO, dec!(-3), MAX_AMOUNT] {
        let err = fixture
            .engine
            .add_expense(UNLIMITED, NewExpense::new("food", amount, may(15)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{amount}: {err}");
        assert!(err.is_user_facing());
    }
    assert_eq!(month_total(&fixture, UNLIMITED).await, Decimal::ZERO);
}

#[tokio::test]
async fn unknown_user_is_not_found() {
    let fixture = memory_fixture().await;
    assert!(matches!(
        fixture
            .engine
            .add_expense(42, NewExpense::new("food", dec!(1), may(15)))
            .await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn foreign_currency_is_stored_in_base_and_read_back() {
    let fixture = memory_fixture().await;
    let engine = &fixture.engine;

    let first = engine
        .add_expense(DOLLARS, NewExpense::new("books", dec!(1), may(14)))
        .await
        .unwrap();
    assert_eq!(first.amount, dec!(100));
    let second = engine
        .add_expense(DOLLARS, NewExpense::new("books", dec!(3), may(15)))
        .await
        .unwrap();
    assert_eq!(second.amount, dec!(150));

    // Stored in base currency.
    let stored = fixture
        .ledger
        .expenses_by_date(DOLLARS, may(14))
        .await
        .unwrap();
    assert_eq!(stored[0].amount, dec!(100));

    // Read back with each day's own rate.
    let listed = engine
        .expenses_ascend_since_till(DOLLARS, may(1), may(31), 10)
        .await
        .unwrap();
    assert_eq!(
        listed.iter().map(|e| e.amount).collect::<Vec<_>>(),
        vec![dec!(1), dec!(3)]
    );
    assert_eq!(engine.expense(DOLLARS, first.id).await.unwrap().amount, dec!(1));

    let summary = engine
        .expenses_summary_by_category(DOLLARS, may(1), may(31))
        .await
        .unwrap();
    assert_eq!(summary.get("books"), Some(dec!(4)));
}

#[tokio::test]
async fn missing_rate_fails_without_writing() {
    let fixture = memory_fixture().await;
    let err = fixture
        .engine
        .add_expense(DOLLARS, NewExpense::new("books", dec!(1), may(3)))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(
        fixture
            .ledger
            .expenses_by_date(DOLLARS, may(3))
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn summary_is_cached_until_next_add() {
    let fixture = memory_fixture().await;
    let engine = &fixture.engine;
    for (category, amount) in [("food", dec!(10)), ("taxi", dec!(5)), ("food", dec!(2.5))] {
        engine
            .add_expense(UNLIMITED, NewExpense::new(category, amount, may(10)))
            .await
            .unwrap();
    }

    let summary = engine
        .expenses_summary_by_category(UNLIMITED, may(1), may(31))
        .await
        .unwrap();
    assert_eq!(summary.text(), "food=12.5\ntaxi=5\n");

    // Written behind the engine's back: the cached report is served.
    fixture
        .ledger
        .add_expense(UNLIMITED, NewExpense::new("gift", dec!(1), may(11)))
        .await
        .unwrap();
    assert_eq!(
        engine
            .expenses_summary_by_category(UNLIMITED, may(1), may(31))
            .await
            .unwrap(),
        summary
    );

    // An add through the engine drops the user's reports.
    engine
        .add_expense(UNLIMITED, NewExpense::new("food", dec!(1), may(12)))
        .await
        .unwrap();
    let summary = engine
        .expenses_summary_by_category(UNLIMITED, may(1), may(31))
        .await
        .unwrap();
    assert_eq!(summary.text(), "food=13.5\ngift=1\ntaxi=5\n");
}

#[tokio::test]
async fn listing_honours_max_and_order() {
    let fixture = memory_fixture().await;
    let engine = &fixture.engine;
    for (category, d) in [("c", 20), ("a", 2), ("b", 2)] {
        engine
            .add_expense(UNLIMITED, NewExpense::new(category, dec!(1), may(d)))
            .await
            .unwrap();
    }

    let two = engine
        .expenses_ascend_since_till(UNLIMITED, may(1), may(31), 2)
        .await
        .unwrap();
    assert_eq!(
        two.iter().map(|e| e.category.as_str()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );
    assert!(
        engine
            .expenses_ascend_since_till(UNLIMITED, may(1), may(31), 0)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(
        engine
            .expenses_ascend_since_till(UNLIMITED, may(31), may(1), 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn builder_requires_collaborators() {
    let err = Engine::builder()
        .base_currency(code("RUB"))
        .ledger(Arc::new(MemoryLedger::new()))
        .build()
        .unwrap_err();
    assert_eq!(err, EngineError::MissingDependency("profiles"));
}

#[tokio::test]
async fn rate_changes_apply_to_later_reads() {
    let fixture = memory_fixture().await;
    fixture
        .engine
        .add_expense(DOLLARS, NewExpense::new("books", dec!(2), may(14)))
        .await
        .unwrap();

    fixture
        .rates
        .save_rates(vec![
            ExchangeRate::new(code("USD"), dec!(0.03), may(14)).unwrap(),
        ])
        .await
        .unwrap();
    let listed = fixture
        .engine
        .expenses_ascend_since_till(DOLLARS, may(14), may(14), 1)
        .await
        .unwrap();
    assert_eq!(listed[0].amount, dec!(6));
}

#[tokio::test]
async fn sql_file_rate_changes_apply_to_later_reads() {
    let dir = tempfile::tempdir().unwrap();
    let fixture = sql_file_fixture(&dir).await;
    fixture
        .engine
        .add_expense(DOLLARS, NewExpense::new("books", dec!(2), may(14)))
        .await
        .unwrap();
    assert_eq!(month_total(&fixture, DOLLARS).await, dec!(2));

    fixture
        .rates
        .save_rates(vec![
            ExchangeRate::new(code("USD"), dec!(0.04), may(14)).unwrap(),
        ])
        .await
        .unwrap();
    assert_eq!(month_total(&fixture, DOLLARS).await, dec!(8));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn summary_computed_across_an_add_is_not_cached() {
    let ledger = Arc::new(WatchedLedger::default());
    let fixture = fixture(ledger.clone()).await;
    let engine = &fixture.engine;
    engine
        .add_expense(UNLIMITED, NewExpense::new("food", dec!(10), may(10)))
        .await
        .unwrap();

    ledger.gate.armed.store(true, Ordering::SeqCst);
    let summary = tokio::spawn({
        let engine = Arc::clone(engine);
        async move {
            engine
                .expenses_summary_by_category(UNLIMITED, may(1), may(31))
                .await
        }
    });
    ledger.gate.scanned.notified().await;
    engine
        .add_expense(UNLIMITED, NewExpense::new("food", dec!(5), may(11)))
        .await
        .unwrap();
    ledger.gate.release.notify_one();

    // Read before the add finished, so it misses it.
    let stale = summary.await.unwrap().unwrap();
    assert_eq!(stale.get("food"), Some(dec!(10)));

    let fresh = engine
        .expenses_summary_by_category(UNLIMITED, may(1), may(31))
        .await
        .unwrap();
    assert_eq!(fresh.get("food"), Some(dec!(15)));
}

#[tokio::test]
async fn cache_failure_after_commit_keeps_the_expense() {
    let ledger: Arc<dyn ExpenseLedger> = Arc::new(MemoryLedger::new());
    let fixture = stores_fixture(
        ledger,
        Arc::new(MemoryProfiles::new()),
        Arc::new(MemoryRates::new()),
        Arc::new(StuckReportCache),
    )
    .await;

    let stored = fixture
        .engine
        .add_expense(LIMITED, NewExpense::new("food", dec!(7), may(15)))
        .await
        .unwrap();
    assert_eq!(
        fixture.ledger.expense(LIMITED, stored.id).await.unwrap(),
        stored
    );
    fixture
        .engine
        .add_expense(UNLIMITED, NewExpense::new("rent", dec!(70), april(3)))
        .await
        .unwrap();
}

#[tokio::test]
async fn currency_change_drops_cached_reports() {
    let fixture = memory_fixture().await;
    let engine = &fixture.engine;
    engine
        .add_expense(DOLLARS, NewExpense::new("books", dec!(2), may(15)))
        .await
        .unwrap();
    let in_dollars = engine
        .expenses_summary_by_category(DOLLARS, may(1), may(31))
        .await
        .unwrap();
    assert_eq!(in_dollars.get("books"), Some(dec!(2)));

    engine.change_currency(DOLLARS, code("RUB")).await.unwrap();
    let in_rubles = engine
        .expenses_summary_by_category(DOLLARS, may(1), may(31))
        .await
        .unwrap();
    assert_eq!(in_rubles.get("books"), Some(dec!(100)));
    assert_eq!(
        fixture.profiles.currency(DOLLARS).await.unwrap(),
        code("RUB")
    );
}

#[tokio::test]
async fn limit_set_through_the_engine_is_validated() {
    let fixture = memory_fixture().await;
    let engine = &fixture.engine;
    assert!(matches!(
        engine.set_monthly_limit(UNLIMITED, Some(Decimal::ZERO)).await,
        Err(EngineError::Validation(_))
    ));
    assert!(matches!(
        engine.set_monthly_limit(42, Some(dec!(10))).await,
        Err(EngineError::NotFound(_))
    ));

    engine
        .set_monthly_limit(UNLIMITED, Some(dec!(10)))
        .await
        .unwrap();
    assert!(
        engine
            .add_expense(UNLIMITED, NewExpense::new("food", dec!(11), may(15)))
            .await
            .unwrap_err()
            .is_limit_exceeded()
    );

    assert!(!engine.register_user(UNLIMITED, code("USD")).await.unwrap());
    assert_eq!(
        fixture.profiles.monthly_limit(UNLIMITED).await.unwrap(),
        Some(dec!(10))
    );
}
