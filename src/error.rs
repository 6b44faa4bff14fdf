//! Error types for the Gatewarden bot.
//!
//! All errors are explicitly typed using thiserror. Failures inside the
//! anti-raid engine are contained at the per-member or per-guild boundary;
//! nothing here is allowed to crash the host process.

use thiserror::Error;

/// Central error type for all Gatewarden operations.
#[derive(Debug, Error)]
pub enum GatewardenError {
    /// Configuration error (missing env vars, invalid values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A per-guild settings write was rejected at validation time.
    #[error("Invalid setting: {0}")]
    Validation(String),

    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Discord API error from serenity.
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<serenity::Error>),

    /// Action attempted without the required capability.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The member left the guild before the operation could run.
    #[error("Member {0} not found")]
    MemberNotFound(u64),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal state error (invalid transitions, missing wiring).
    #[error("Internal state error: {0}")]
    InternalState(String),
}

impl GatewardenError {
    /// Short machine-readable reason for per-member remediation records.
    pub fn remediation_reason(&self) -> String {
        match self {
            Self::PermissionDenied(_) => "no_permission".to_string(),
            Self::MemberNotFound(_) => "member_not_found".to_string(),
            Self::DiscordApi(_) => "transport_error".to_string(),
            other => other.to_string(),
        }
    }

    /// User-friendly error message for command replies (hides internals).
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Config(_) => "Service configuration error",
            Self::Validation(_) => "That value is not valid here",
            Self::Database(_) => "Storage temporarily unavailable",
            Self::DiscordApi(_) => "Discord service temporarily unavailable",
            Self::PermissionDenied(_) => "The bot is missing a required permission",
            Self::MemberNotFound(_) => "That member is no longer in the server",
            Self::Json(_) => "Data format error",
            Self::InternalState(_) => "Internal service error",
        }
    }
}

/// Result type alias for Gatewarden operations.
pub type Result<T> = std::result::Result<T, GatewardenError>;
