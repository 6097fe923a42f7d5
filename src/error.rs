use std::error::Error;
use std::fmt;
use std::time::Duration;
use tokio_postgres::error::SqlState;

use crate::entitlement::Plan;

/// failures of the metering core; domain rejections are returned as outcomes, not as errors
#[derive(Debug)]
pub enum MeterError {
    InvalidResource(String), // resource kind name
    InvalidAmount(i64),
    InvalidCharge(String), // charge id
    MissingExpiry(Plan),
    StoreUnavailable(Box<dyn Error + Send + Sync>),
    StoreTimeout(Duration),
    Config(String),
}

impl MeterError {
    /// transient infrastructure failures; the whole operation is safe to retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeterError::StoreUnavailable(_) | MeterError::StoreTimeout(_)
        )
    }

    /// PostgreSQL gave up waiting for a row lock or cancelled the statement
    pub fn is_lock_timeout(&self) -> bool {
        let MeterError::StoreUnavailable(source) = self else {
            return false;
        };
        source
            .downcast_ref::<tokio_postgres::Error>()
            .and_then(|err| err.code())
            .map(|code| *code == SqlState::LOCK_NOT_AVAILABLE || *code == SqlState::QUERY_CANCELED)
            .unwrap_or(false)
    }
}

impl fmt::Display for MeterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeterError::InvalidResource(kind) => write!(f, "Unknown resource kind: {}", kind),
            MeterError::InvalidAmount(amount) => {
                write!(f, "Amount must be positive, got {}", amount)
            }
            MeterError::InvalidCharge(charge_id) => {
                write!(f, "Invalid payment charge id: '{}'", charge_id)
            }
            MeterError::MissingExpiry(plan) => {
                write!(f, "Paid plan {} needs an expiry", plan)
            }
            MeterError::StoreUnavailable(e) => write!(f, "Store unavailable: {}", e),
            MeterError::StoreTimeout(limit) => {
                write!(f, "Store did not answer within {}ms", limit.as_millis())
            }
            MeterError::Config(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl Error for MeterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MeterError::StoreUnavailable(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<tokio_postgres::Error> for MeterError {
    fn from(err: tokio_postgres::Error) -> Self {
        MeterError::StoreUnavailable(Box::new(err))
    }
}

impl From<deadpool_postgres::PoolError> for MeterError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        MeterError::StoreUnavailable(Box::new(err))
    }
}

impl From<deadpool_postgres::CreatePoolError> for MeterError {
    fn from(err: deadpool_postgres::CreatePoolError) -> Self {
        MeterError::StoreUnavailable(Box::new(err))
    }
}

pub type MeterResult<T> = Result<T, MeterError>;
