//! Configuration loading from environment.
//!
//! Process-level settings only. Per-guild anti-raid settings live in the
//! datastore and are managed through slash commands.

use std::env;

use crate::error::{GatewardenError, Result};

/// Default path for the SQLite datastore.
pub const DEFAULT_DATABASE_PATH: &str = "gatewarden.db";

/// Main configuration for the Gatewarden bot.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Discord bot token.
    pub discord_token: String,
    /// Path to the SQLite datastore.
    pub database_path: String,
}

impl BotConfig {
    /// Load configuration from environment variables.
    ///
    /// Required environment variables:
    /// - `DISCORD_TOKEN`: Discord bot token
    ///
    /// Optional environment variables:
    /// - `DATABASE_PATH`: SQLite file path (default: `gatewarden.db`)
    pub fn from_env() -> Result<Self> {
        let discord_token = env::var("DISCORD_TOKEN")
            .map_err(|_| GatewardenError::Config("DISCORD_TOKEN not set".to_string()))?;

        if discord_token.trim().is_empty() {
            return Err(GatewardenError::Config("DISCORD_TOKEN is empty".to_string()));
        }

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());

        Ok(Self {
            discord_token,
            database_path,
        })
    }
}
