//! Error types for the realtime layer

use thiserror::Error;

use crate::channel::ChannelKey;

/// Realtime error types
#[derive(Debug, Error)]
pub enum Error {
    /// The transport could not be opened; drives reconnection backoff
    #[error("Transport open failure: {0}")]
    TransportOpenFailure(String),

    /// A subscription for this key is already registered
    #[error("Duplicate channel: {0}")]
    DuplicateChannel(ChannelKey),

    /// No subscription is registered for this key
    #[error("Channel not found: {0}")]
    ChannelNotFound(ChannelKey),

    /// A table watch carries a row filter that cannot be evaluated
    #[error("Invalid row filter {filter:?} on table {table}")]
    InvalidFilter { table: String, filter: String },

    /// Automatic reconnection stopped after this many consecutive failures
    #[error("Max reconnection attempts ({attempts}) exceeded")]
    MaxRetriesExceeded { attempts: u32 },

    /// A broadcast, presence or receipt write was rejected
    #[error("Write failure: {0}")]
    WriteFailure(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The realtime client has been shut down
    #[error("Realtime client shut down")]
    Shutdown,
}

/// Result type for realtime operations
pub type Result<T> = std::result::Result<T, Error>;
