pub use clock::{Clock, FixedClock, SystemClock};
pub use currency::{CurrencyCode, ExchangeRate};
pub use error::EngineError;
pub use expenses::{Expense, ExpenseId, NewExpense};
pub use ledger::{
    ExpenseLedger, LedgerScope, MemoryLedger, SqlLedger, Visit, isolated, isolated_nested,
};
pub use money::{MAX_AMOUNT, validate_amount};
pub use ops::{Engine, EngineBuilder};
pub use rates::{
    ExchangeRates, MemoryRates, RateProvider, RateService, RateStore, RateUpdater, SqlRates,
    StaticRateProvider,
};
pub use reports::{LruReportCache, NoopReportCache, ReportCache, SummaryReport};
pub use users::{MemoryProfiles, Profile, SqlProfiles, UserId, UserProfiles};

pub mod cache;
mod clock;
mod currency;
mod error;
mod expenses;
pub mod ledger;
mod ledger_locks;
mod money;
mod ops;
mod rates;
mod reports;
mod users;

pub type ResultEngine<T> = Result<T, EngineError>;
