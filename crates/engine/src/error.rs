//! The module contains the error the engine can throw.
//!
//! The errors are:
//!
//! - [`Validation`] thrown when an input (amount, limit, currency code) is
//!   out of bounds.
//! - [`LimitExceeded`] thrown when an expense would push the month-to-date
//!   spend of a user over the configured monthly limit.
//! - [`NotFound`] thrown when a user, an exchange rate or an expense are not
//!   found.
//! - [`Rollback`] thrown when an isolation scope failed and rolling it back
//!   failed too.
//!
//!  [`Validation`]: EngineError::Validation
//!  [`LimitExceeded`]: EngineError::LimitExceeded
//!  [`NotFound`]: EngineError::NotFound
//!  [`Rollback`]: EngineError::Rollback
use rust_decimal::Decimal;
use sea_orm::DbErr;
use thiserror::Error;

/// Engine custom errors.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Monthly limit exceeded: limit {limit}, spent {spent}, attempted {attempted}")]
    LimitExceeded {
        limit: Decimal,
        spent: Decimal,
        attempted: Decimal,
    },
    #[error("\"{0}\" not found!")]
    NotFound(String),
    #[error("{source} (rollback failed: {rollback})")]
    Rollback {
        source: Box<EngineError>,
        rollback: Box<EngineError>,
    },
    #[error("Missing dependency: {0}")]
    MissingDependency(&'static str),
    #[error(transparent)]
    Database(#[from] DbErr),
}

impl EngineError {
    /// Returns `true` for outcomes caused by the caller's input rather than
    /// by a fault of the system.
    ///
    /// A failed rollback is judged by the error that triggered it.
    #[must_use]
    pub fn is_user_facing(&self) -> bool {
        match self {
            Self::Validation(_) | Self::LimitExceeded { .. } => true,
            Self::Rollback { source, .. } => source.is_user_facing(),
            _ => false,
        }
    }

    /// Returns `true` if this is (or was triggered by) a monthly limit
    /// rejection.
    #[must_use]
    pub fn is_limit_exceeded(&self) -> bool {
        match self {
            Self::LimitExceeded { .. } => true,
            Self::Rollback { source, .. } => source.is_limit_exceeded(),
            _ => false,
        }
    }
}

impl PartialEq for EngineError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Validation(a), Self::Validation(b)) => a == b,
            (
                Self::LimitExceeded {
                    limit: l1,
                    spent: s1,
                    attempted: a1,
                },
                Self::LimitExceeded {
                    limit: l2,
                    spent: s2,
                    attempted: a2,
                },
            ) => l1 == l2 && s1 == s2 && a1 == a2,
            (Self::NotFound(a), Self::NotFound(b)) => a == b,
            (
                Self::Rollback {
                    source: s1,
                    rollback: r1,
                },
                Self::Rollback {
                    source: s2,
                    rollback: r2,
                },
            ) => s1 == s2 && r1 == r2,
            (Self::MissingDependency(a), Self::MissingDependency(b)) => a == b,
            (Self::Database(a), Self::Database(b)) => a.to_string() == b.to_string(),
            _ => false,
        }
    }
}
