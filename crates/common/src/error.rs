//! Error types for Carelink.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CarelinkError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    SessionMissing(String),

    #[error("Provider failure: {0}")]
    Provider(String),

    #[error("Dispatch failure: {0}")]
    Dispatch(String),

    #[error("Agent timeout: {0}")]
    AgentTimeout(String),

    #[error("Store outage: {0}")]
    StoreOutage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CarelinkError {
    /// Stable machine-readable code surfaced alongside every client-visible
    /// failure.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION",
            Self::SessionMissing(_) => "SESSION_MISSING",
            Self::Provider(_) => "PROVIDER_FAILURE",
            Self::Dispatch(_) => "DISPATCH_FAILURE",
            Self::AgentTimeout(_) => "AGENT_TIMEOUT",
            Self::StoreOutage(_) => "STORE_OUTAGE",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CarelinkError>;
