//! Gatewarden: join-rate anti-raid protection for Discord guilds.
//!
//! Tracks member joins per guild in a rolling window, enters a persistent
//! lockdown when the configured threshold is crossed, and remediates flagged
//! members (kick, timeout or quarantine) until an administrator resets the
//! guild to normal.

pub mod commands;
pub mod config;
pub mod error;
pub mod lockdown;
pub mod membership;
pub mod notify;
pub mod remediation;
pub mod settings;
pub mod store;
pub mod tracker;
