//! Error types for the seams of the copier: signal source, broker, tags, setup.
//!
//! Per-signal and per-pair failures are contained by the driver; only
//! [`SetupError`] ends an account's driver.

use std::time::Duration;

use thiserror::Error;

/// Failure to fetch or decode a signal batch for one (source, trader) pair.
#[derive(Debug, Clone, Error)]
pub enum SourceFetchError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },

    #[error("signal api returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode signal payload from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("signal fetch from {url} timed out after {after:?}")]
    Timeout { url: String, after: Duration },

    #[error("trader {trader_id} missing from batched response of {url}")]
    MissingTrader { url: String, trader_id: String },
}

/// Convenience alias for gateway results.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by a broker gateway call (not order rejections, which are results).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("broker call `{call}` timed out after {after:?}")]
    Timeout { call: &'static str, after: Duration },

    #[error("broker protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("broker session is not connected")]
    NotConnected,
}

/// Errors composing or validating a correlation tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
    #[error("{field} is empty")]
    Empty { field: &'static str },

    #[error("{field} `{value}` is not a digit string")]
    NotNumeric { field: &'static str, value: String },

    #[error("trader id `{0}` has a leading zero")]
    LeadingZero(String),

    #[error("trader id `{trader_id}` makes separator `{separator}` ambiguous")]
    AmbiguousSeparator { trader_id: String, separator: String },

    #[error("tag `{digits}` does not fit in 64 bits")]
    Overflow { digits: String },
}

/// A signal record rejected at the fetch boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed signal `{signal_id}`: {reason}")]
pub struct MalformedSignal {
    pub signal_id: String,
    pub reason: String,
}

/// Invalid settings detected while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no accounts configured")]
    NoAccounts,

    #[error("account {login} has no master traders")]
    NoTraders { login: u64 },

    #[error("account {login}, trader `{trader_id}`: {source}")]
    InvalidTrader {
        login: u64,
        trader_id: String,
        #[source]
        source: TagError,
    },

    #[error("invalid separator: {0}")]
    InvalidSeparator(#[source] TagError),

    #[error("account {login}: {field} {message}")]
    InvalidValue {
        login: u64,
        field: &'static str,
        message: String,
    },
}

/// Fatal failure initializing one account's driver.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("account {login}: could not connect to broker: {source}")]
    Connect {
        login: u64,
        #[source]
        source: BrokerError,
    },

    #[error("account {login}: {message}")]
    Client { login: u64, message: String },
}
