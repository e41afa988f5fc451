//! User profiles.
//!
//! The engine only needs two facts about a user: the currency they enter
//! amounts in and their optional monthly spending limit (in base currency).
//! [`MemoryProfiles`] keeps them in the process, [`SqlProfiles`] in the
//! `users` table.

use std::{collections::HashMap, str::FromStr};

use async_trait::async_trait;
use rust_decimal::Decimal;
use sea_orm::{ActiveValue, DatabaseConnection, entity::prelude::*, sea_query::OnConflict};
use tokio::sync::RwLock;

use crate::{CurrencyCode, EngineError, ResultEngine, money::validate_amount};

pub type UserId = i64;

#[async_trait]
pub trait UserProfiles: Send + Sync {
    /// Currency the user enters and reads amounts in.
    async fn currency(&self, user_id: UserId) -> ResultEngine<CurrencyCode>;

    /// Monthly limit in base currency, `None` when the user has none.
    async fn monthly_limit(&self, user_id: UserId) -> ResultEngine<Option<Decimal>>;

    /// Creates the user with `currency` and no limit, unless it is already
    /// known. Returns `true` when a new profile was created.
    async fn create_user_if_not_exists(
        &self,
        user_id: UserId,
        currency: CurrencyCode,
    ) -> ResultEngine<bool>;

    async fn change_currency(&self, user_id: UserId, currency: CurrencyCode) -> ResultEngine<()>;

    /// Sets (or clears, with `None`) the monthly limit of a user.
    async fn set_monthly_limit(&self, user_id: UserId, limit: Option<Decimal>)
    -> ResultEngine<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Profile {
    pub currency: CurrencyCode,
    pub monthly_limit: Option<Decimal>,
}

impl Profile {
    fn new(currency: CurrencyCode) -> Self {
        Self {
            currency,
            monthly_limit: None,
        }
    }
}

fn unknown_user(user_id: UserId) -> EngineError {
    EngineError::NotFound(format!("user {user_id}"))
}

fn check_limit(limit: Option<Decimal>) -> ResultEngine<()> {
    match limit {
        Some(limit) => validate_amount(limit, "monthly limit"),
        None => Ok(()),
    }
}

/// Process-local profile store.
#[derive(Debug, Default)]
pub struct MemoryProfiles {
    profiles: RwLock<HashMap<UserId, Profile>>,
}

impl MemoryProfiles {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_user(&self, user_id: UserId, currency: CurrencyCode) -> ResultEngine<()> {
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&user_id) {
            return Err(EngineError::Validation(format!(
                "user {user_id} already exists"
            )));
        }
        profiles.insert(user_id, Profile::new(currency));
        Ok(())
    }

    pub async fn user_exists(&self, user_id: UserId) -> bool {
        self.profiles.read().await.contains_key(&user_id)
    }

    async fn profile(&self, user_id: UserId) -> ResultEngine<Profile> {
        self.profiles
            .read()
            .await
            .get(&user_id)
            .cloned()
            .ok_or_else(|| unknown_user(user_id))
    }
}

#[async_trait]
impl UserProfiles for MemoryProfiles {
    async fn currency(&self, user_id: UserId) -> ResultEngine<CurrencyCode> {
        Ok(self.profile(user_id).await?.currency)
    }

    async fn monthly_limit(&self, user_id: UserId) -> ResultEngine<Option<Decimal>> {
        Ok(self.profile(user_id).await?.monthly_limit)
    }

    async fn create_user_if_not_exists(
        &self,
        user_id: UserId,
        currency: CurrencyCode,
    ) -> ResultEngine<bool> {
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&user_id) {
            return Ok(false);
        }
        profiles.insert(user_id, Profile::new(currency));
        Ok(true)
    }

    async fn change_currency(&self, user_id: UserId, currency: CurrencyCode) -> ResultEngine<()> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(&user_id)
            .ok_or_else(|| unknown_user(user_id))?;
        profile.currency = currency;
        Ok(())
    }

    async fn set_monthly_limit(
        &self,
        user_id: UserId,
        limit: Option<Decimal>,
    ) -> ResultEngine<()> {
        check_limit(limit)?;
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .get_mut(&user_id)
            .ok_or_else(|| unknown_user(user_id))?;
        profile.monthly_limit = limit;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: i64,
    pub currency: String,
    /// Decimal text, like expense amounts.
    pub monthly_limit: Option<String>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl TryFrom<Model> for Profile {
    type Error = EngineError;

    fn try_from(model: Model) -> ResultEngine<Self> {
        let currency = CurrencyCode::try_from(model.currency.as_str()).map_err(|err| {
            EngineError::Database(DbErr::Custom(format!(
                "invalid currency stored for user {}: {err}",
                model.id
            )))
        })?;
        let monthly_limit = model
            .monthly_limit
            .as_deref()
            .map(Decimal::from_str)
            .transpose()
            .map_err(|err| {
                EngineError::Database(DbErr::Custom(format!(
                    "invalid monthly limit stored for user {}: {err}",
                    model.id
                )))
            })?;
        Ok(Self {
            currency,
            monthly_limit,
        })
    }
}

/// Profiles kept in the `users` table.
///
/// The monthly limit is read while the user's ledger scope is open, so
/// when the ledger lives in the same database give this store its own
/// connection pool.
#[derive(Debug, Clone)]
pub struct SqlProfiles {
    database: DatabaseConnection,
}

impl SqlProfiles {
    pub fn new(database: DatabaseConnection) -> Self {
        Self { database }
    }

    async fn profile(&self, user_id: UserId) -> ResultEngine<Profile> {
        Entity::find_by_id(user_id)
            .one(&self.database)
            .await?
            .ok_or_else(|| unknown_user(user_id))
            .and_then(Profile::try_from)
    }

    async fn update(&self, user_id: UserId, active: ActiveModel) -> ResultEngine<()> {
        match active.update(&self.database).await {
            Ok(_) => Ok(()),
            Err(DbErr::RecordNotUpdated) => Err(unknown_user(user_id)),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl UserProfiles for SqlProfiles {
    async fn currency(&self, user_id: UserId) -> ResultEngine<CurrencyCode> {
        Ok(self.profile(user_id).await?.currency)
    }

    async fn monthly_limit(&self, user_id: UserId) -> ResultEngine<Option<Decimal>> {
        Ok(self.profile(user_id).await?.monthly_limit)
    }

    async fn create_user_if_not_exists(
        &self,
        user_id: UserId,
        currency: CurrencyCode,
    ) -> ResultEngine<bool> {
        let inserted = Entity::insert(ActiveModel {
            id: ActiveValue::Set(user_id),
            currency: ActiveValue::Set(currency.into()),
            monthly_limit: ActiveValue::Set(None),
        })
        .on_conflict(OnConflict::column(Column::Id).do_nothing().to_owned())
        .exec_without_returning(&self.database)
        .await?;
        Ok(inserted > 0)
    }

    async fn change_currency(&self, user_id: UserId, currency: CurrencyCode) -> ResultEngine<()> {
        let active = ActiveModel {
            id: ActiveValue::Set(user_id),
            currency: ActiveValue::Set(currency.into()),
            ..Default::default()
        };
        self.update(user_id, active).await
    }

    async fn set_monthly_limit(
        &self,
        user_id: UserId,
        limit: Option<Decimal>,
    ) -> ResultEngine<()> {
        check_limit(limit)?;
        let active = ActiveModel {
            id: ActiveValue::Set(user_id),
            monthly_limit: ActiveValue::Set(limit.map(|limit| limit.to_string())),
            ..Default::default()
        };
        self.update(user_id, active).await
    }
}
