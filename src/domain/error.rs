//! Typed errors at component boundaries (§7 of the design).
//!
//! Orchestration code (C4-C9 loops) works in `anyhow::Result` and logs at
//! the point of catch; these types exist where a caller needs to branch on
//! *which* kind of failure occurred (retry vs. abort vs. skip-user).

use thiserror::Error;

/// Errors raised by [`crate::device::DeviceController`] implementations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("transient HTTP failure: {0}")]
    TransientHttp(String),

    #[error("authentication expired and refresh failed: {0}")]
    AuthExpired(String),

    #[error("client error: {0}")]
    ClientError(String),

    #[error("upstream reported failure: {0}")]
    UpstreamLogicalFailure(String),

    #[error("could not parse upstream response: {0}")]
    ParseError(String),
}

/// Errors raised by [`crate::tariff_builder`].
#[derive(Debug, Error, PartialEq)]
pub enum TariffError {
    #[error("{missing} of 96 buckets are unfilled after the rolling-window fallback (limit 10)")]
    InsufficientData { missing: usize },
}

/// Errors raised by [`crate::price_source`] producers.
#[derive(Debug, Error)]
pub enum PriceSourceError {
    #[error("transient HTTP failure: {0}")]
    TransientHttp(String),

    #[error("client error: {0}")]
    ClientError(String),

    #[error("could not parse upstream response: {0}")]
    ParseError(String),

    #[error("websocket connection lost: {0}")]
    WsConnectionLost(String),
}
