//! The public error taxonomy (§6). Internal wire, compression, and codec
//! errors are wrapped with their cause preserved, but their own enum names
//! never escape into this type other than inside a diagnostic string (§7).

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not connected")]
    NotConnected,

    #[error("connection failed: {cause}")]
    ConnectionFailed { cause: String },

    #[error("reconnection failed after {attempts} attempts")]
    ReconnectFailed { attempts: u32 },

    #[error("reducer {name:?} failed: {message}")]
    ReducerCallFailed { name: String, message: String },

    #[error("reducer {name:?} timed out after {seconds}s")]
    ReducerTimeout { name: String, seconds: u64 },

    #[error("reducer {name:?} ran out of energy")]
    ReducerOutOfEnergy { name: String },

    #[error("subscription failed: {message}")]
    SubscriptionFailed { message: String },

    #[error("builder is missing required configuration: {field}")]
    BuilderMissingConfiguration { field: String },

    #[error("connection closed{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    ConnectionClosed { reason: Option<String> },

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn connection_failed(cause: impl std::fmt::Display) -> Self {
        Error::ConnectionFailed { cause: cause.to_string() }
    }

    pub fn reducer_timeout(name: impl Into<String>, timeout: Duration) -> Self {
        Error::ReducerTimeout { name: name.into(), seconds: timeout.as_secs() }
    }

    pub fn connection_closed(reason: Option<impl Into<String>>) -> Self {
        Error::ConnectionClosed { reason: reason.map(Into::into) }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
