//! Error types for the fetch pipeline.
//!
//! # Design
//! Each pipeline stage reports one `FetchError` variant, so the orchestrator
//! can tell where a fetch stopped without any structured detail crossing the
//! boolean boundary (`Fetcher::fetch_ok`, `picofetch_fetch`). Stack-level
//! codes are carried as the `source` where one exists.

use std::net::IpAddr;

use thiserror::Error;

use crate::stack::StackError;

/// Pipeline stage a `FetchError` belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Configuration,
    Resolve,
    Channel,
    Transmit,
}

/// Errors returned by `Fetcher::fetch`.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The lookup finished and the name has no address.
    #[error("{host} has no address")]
    Resolve { host: String },

    /// The stack refused to start the lookup.
    #[error("failed to start lookup of {host}: {source}")]
    ResolveStart {
        host: String,
        #[source]
        source: StackError,
    },

    /// The trust anchor could not be turned into a TLS configuration.
    #[error("failed to create TLS configuration from the trust anchor")]
    Config,

    #[error("failed to allocate a connection")]
    Allocate,

    #[error("failed to bind server identity {host}: {source}")]
    Identity {
        host: String,
        #[source]
        source: StackError,
    },

    #[error("failed to start connecting to {addr}:{port}: {source}")]
    Connect {
        addr: IpAddr,
        port: u16,
        #[source]
        source: StackError,
    },

    #[error("failed to queue request: {0}")]
    Write(#[source] StackError),

    #[error("failed to flush request: {0}")]
    Output(#[source] StackError),

    /// The acknowledged total settled on a value other than the request size.
    #[error("peer acknowledged {acknowledged} of {expected} request bytes")]
    SendMismatch { acknowledged: u32, expected: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FetchError {
    pub fn stage(&self) -> Stage {
        match self {
            FetchError::Resolve { .. } | FetchError::ResolveStart { .. } => Stage::Resolve,
            FetchError::Config
            | FetchError::Allocate
            | FetchError::Identity { .. }
            | FetchError::Connect { .. } => Stage::Channel,
            FetchError::Write(_) | FetchError::Output(_) | FetchError::SendMismatch { .. } => {
                Stage::Transmit
            }
            FetchError::Io(_) | FetchError::Json(_) => Stage::Configuration,
        }
    }
}

/// Errors from splitting a raw response into status, headers and body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("response has no blank line after the headers")]
    MissingSeparator,

    #[error("malformed status line")]
    StatusLine,

    #[error("malformed header line")]
    HeaderLine,
}
