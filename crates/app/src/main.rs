use std::{process::ExitCode, sync::Arc, time::Duration};

use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use engine::{
    CurrencyCode, Engine, EngineError, ExpenseLedger, LruReportCache, MemoryLedger,
    MemoryProfiles, MemoryRates, NewExpense, NoopReportCache, RateService, RateStore, ReportCache,
    SqlLedger, SqlProfiles, SqlRates, StaticRateProvider, SystemClock, UserProfiles,
};
use migration::{Migrator, MigratorTrait};
use rust_decimal::Decimal;
use settings::{Settings, Storage};
use thiserror::Error;

mod settings;

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Personal expense ledger with monthly limits")]
struct Cli {
    /// Configuration file.
    #[arg(long, env = "TALLY_CONFIG", default_value = "config/tally.toml")]
    config: String,

    /// Log level, overrides the configured one.
    #[arg(long)]
    level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record an expense, in the user's currency.
    Add(AddArgs),
    /// Spend per category over a date range.
    Summary(RangeArgs),
    /// Expenses of a date range, oldest first.
    List(ListArgs),
    /// A single expense.
    Show(ShowArgs),
    /// Change the currency a user enters amounts in.
    SetCurrency(CurrencyArgs),
    /// Set or lift the monthly limit of a user.
    SetLimit(LimitArgs),
}

#[derive(Args, Debug)]
struct AddArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    category: String,
    #[arg(long)]
    amount: Decimal,
    /// Day of the expense (YYYY-MM-DD), today (UTC) by default.
    #[arg(long)]
    date: Option<NaiveDate>,
    #[arg(long)]
    comment: Option<String>,
}

#[derive(Args, Debug)]
struct RangeArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    since: NaiveDate,
    #[arg(long)]
    till: NaiveDate,
}

#[derive(Args, Debug)]
struct ListArgs {
    #[command(flatten)]
    range: RangeArgs,
    #[arg(long, default_value_t = 50)]
    max: usize,
}

#[derive(Args, Debug)]
struct ShowArgs {
    #[arg(long)]
    user: i64,
    #[arg(long)]
    id: i64,
}

#[derive(Args, Debug)]
struct CurrencyArgs {
    #[arg(long)]
    user: i64,
    /// ISO 4217 code, like EUR.
    #[arg(long)]
    currency: String,
}

#[derive(Args, Debug)]
struct LimitArgs {
    #[arg(long)]
    user: i64,
    /// New limit, in base currency.
    #[arg(long, required_unless_present = "lift", conflicts_with = "lift")]
    amount: Option<Decimal>,
    /// Remove the limit.
    #[arg(long)]
    lift: bool,
}

#[derive(Debug, Error)]
enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl AppError {
    /// Text shown to the user. Faults of the system get a generic message,
    /// their detail goes to the log.
    fn user_message(&self, base: &CurrencyCode) -> String {
        match self {
            AppError::Engine(err) => engine_message(err, base).unwrap_or_else(|| {
                tracing::error!(error = %err, "command failed");
                String::from("Something went wrong, please try again later.")
            }),
            AppError::Config(err) => err.to_string(),
            AppError::Database(err) => {
                tracing::error!(error = %err, "database failure");
                String::from("Something went wrong, please try again later.")
            }
        }
    }
}

fn engine_message(err: &EngineError, base: &CurrencyCode) -> Option<String> {
    match err {
        EngineError::LimitExceeded {
            limit,
            spent,
            attempted,
        } => Some(format!(
            "Monthly limit exceeded: {spent} {base} of {limit} {base} already spent, \
             {attempted} {base} more would go over it."
        )),
        EngineError::Validation(msg) => Some(format!("Invalid input: {msg}")),
        EngineError::NotFound(what) => Some(format!("Not found: {what}")),
        EngineError::Rollback { source, rollback } => {
            tracing::error!(error = %rollback, "rollback failed");
            engine_message(source, base)
        }
        _ => None,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::new(&cli.config) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", AppError::from(err));
            return ExitCode::FAILURE;
        }
    };

    let level = cli.level.as_deref().unwrap_or(&settings.level);
    tracing_subscriber::fmt()
        .with_env_filter(format!(
            "tally={level},engine={level},migration={level}"
        ))
        .with_writer(std::io::stderr)
        .init();

    let base = settings.base_currency.clone();
    match run(cli.command, settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err.user_message(&base));
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, settings: Settings) -> Result<(), AppError> {
    let stores = Stores::open(&settings.storage).await?;

    let provider = StaticRateProvider::new(settings.rate_table()?)?;
    let rates = Arc::new(RateService::new(stores.rates, Arc::new(provider)));
    let updater = Arc::clone(&rates).spawn_updater(
        Arc::new(SystemClock),
        Duration::from_secs(settings.rates_refresh_secs.max(1)),
    );

    let reports: Arc<dyn ReportCache> = match settings.report_cache_capacity {
        0 => Arc::new(NoopReportCache),
        capacity => Arc::new(LruReportCache::new(capacity)?),
    };

    let engine = Engine::builder()
        .base_currency(settings.base_currency.clone())
        .ledger(stores.ledger)
        .profiles(stores.profiles)
        .rates(rates)
        .reports(reports)
        .build()?;

    let result = async {
        seed_users(&engine, &settings).await?;
        execute(&engine, command).await
    }
    .await;
    updater.stop().await;
    result
}

/// Registers the configured users. The configured limit only applies to a
/// user seen for the first time, so limits set from the command line stick.
async fn seed_users(engine: &Engine, settings: &Settings) -> Result<(), AppError> {
    for user in &settings.users {
        let created = engine.register_user(user.id, user.currency.clone()).await?;
        if created && user.monthly_limit.is_some() {
            engine.set_monthly_limit(user.id, user.monthly_limit).await?;
        }
    }
    Ok(())
}

async fn execute(engine: &Engine, command: Command) -> Result<(), AppError> {
    match command {
        Command::Add(args) => {
            let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
            let mut expense = NewExpense::new(args.category, args.amount, date);
            if let Some(comment) = args.comment {
                expense = expense.comment(comment);
            }
            let stored = engine.add_expense(args.user, expense).await?;
            println!(
                "Recorded #{}: {} {} {} on {}",
                stored.id,
                stored.category,
                stored.amount,
                engine.base_currency(),
                stored.date
            );
        }
        Command::Summary(args) => {
            let report = engine
                .expenses_summary_by_category(args.user, args.since, args.till)
                .await?;
            if report.is_empty() {
                println!("No expenses between {} and {}.", args.since, args.till);
            } else {
                print!("{}", report.text());
            }
        }
        Command::List(args) => {
            let range = args.range;
            let expenses = engine
                .expenses_ascend_since_till(range.user, range.since, range.till, args.max)
                .await?;
            for expense in expenses {
                println!(
                    "#{} {} {} {}{}",
                    expense.id,
                    expense.date,
                    expense.category,
                    expense.amount,
                    expense
                        .comment
                        .map(|comment| format!(" ({comment})"))
                        .unwrap_or_default()
                );
            }
        }
        Command::Show(args) => {
            let expense = engine.expense(args.user, args.id).await?;
            println!(
                "#{} {} {} {}",
                expense.id, expense.date, expense.category, expense.amount
            );
        }
        Command::SetCurrency(args) => {
            let currency = CurrencyCode::try_from(args.currency)?;
            engine.change_currency(args.user, currency.clone()).await?;
            println!("User {} now enters amounts in {currency}.", args.user);
        }
        Command::SetLimit(args) => {
            let limit = if args.lift { None } else { args.amount };
            engine.set_monthly_limit(args.user, limit).await?;
            match limit {
                Some(limit) => println!(
                    "Monthly limit of user {} set to {limit} {}.",
                    args.user,
                    engine.base_currency()
                ),
                None => println!("User {} has no monthly limit.", args.user),
            }
        }
    }
    Ok(())
}

/// Ledger, profiles and rates of one storage backend.
struct Stores {
    ledger: Arc<dyn ExpenseLedger>,
    profiles: Arc<dyn UserProfiles>,
    rates: Arc<dyn RateStore>,
}

impl Stores {
    async fn open(storage: &Storage) -> Result<Self, AppError> {
        match storage {
            Storage::Memory => Ok(Self {
                ledger: Arc::new(MemoryLedger::new()),
                profiles: Arc::new(MemoryProfiles::new()),
                rates: Arc::new(MemoryRates::new()),
            }),
            Storage::Sqlite { path } => {
                let url = format!("sqlite:{path}?mode=rwc");
                let database = sea_orm::Database::connect(&url).await?;
                Migrator::up(&database, None).await?;
                // Profiles are read while a ledger scope holds a connection,
                // so they get a pool of their own.
                let lookups = sea_orm::Database::connect(&url).await?;
                tracing::debug!(path, "sqlite storage ready");
                Ok(Self {
                    ledger: Arc::new(SqlLedger::new(database)),
                    profiles: Arc::new(SqlProfiles::new(lookups.clone())),
                    rates: Arc::new(SqlRates::new(lookups)),
                })
            }
        }
    }
}
