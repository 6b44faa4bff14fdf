//! Membership collaborator: the guild-side operations the engine needs.
//!
//! The engine talks to a [`GuildHost`] trait so the tracker, executor and
//! state machine can be exercised against mocks. [`DiscordHost`] is the
//! production implementation over the serenity HTTP client.

use std::sync::Arc;

use chrono::Utc;
use serenity::http::{Http, HttpError, StatusCode};
use serenity::model::id::{GuildId, RoleId, UserId};
use serenity::model::Timestamp;

use crate::error::{GatewardenError, Result};

/// Guild membership operations used by the anti-raid engine.
#[serenity::async_trait]
pub trait GuildHost: Send + Sync {
    /// Fetch a member's current role ids. `None` means the member is no
    /// longer in the guild.
    async fn member_roles(&self, guild_id: u64, user_id: u64) -> Result<Option<Vec<u64>>>;

    /// Remove a member from the guild.
    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()>;

    /// Suspend a member's ability to interact for the given duration.
    async fn timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        duration_secs: u64,
        reason: &str,
    ) -> Result<()>;

    /// Replace the member's role set with exactly the given roles.
    async fn set_roles(
        &self,
        guild_id: u64,
        user_id: u64,
        roles: &[u64],
        reason: &str,
    ) -> Result<()>;

    /// Revoke all active invites for the guild. Returns how many were
    /// deleted.
    async fn revoke_invites(&self, guild_id: u64) -> Result<u32>;
}

/// Production [`GuildHost`] over the Discord REST API.
pub struct DiscordHost {
    http: Arc<Http>,
}

impl DiscordHost {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

/// Map a serenity error to the engine's taxonomy: 403 becomes
/// `PermissionDenied`, 404 becomes `MemberNotFound`.
fn map_discord_error(e: serenity::Error, user_id: u64, operation: &str) -> GatewardenError {
    if let serenity::Error::Http(HttpError::UnsuccessfulRequest(ref resp)) = e {
        if resp.status_code == StatusCode::FORBIDDEN {
            return GatewardenError::PermissionDenied(operation.to_string());
        }
        if resp.status_code == StatusCode::NOT_FOUND {
            return GatewardenError::MemberNotFound(user_id);
        }
    }
    GatewardenError::DiscordApi(Box::new(e))
}

#[serenity::async_trait]
impl GuildHost for DiscordHost {
    async fn member_roles(&self, guild_id: u64, user_id: u64) -> Result<Option<Vec<u64>>> {
        match self
            .http
            .get_member(GuildId::new(guild_id), UserId::new(user_id))
            .await
        {
            Ok(member) => Ok(Some(member.roles.iter().map(|r| r.get()).collect())),
            Err(e) => match map_discord_error(e, user_id, "fetch_member") {
                GatewardenError::MemberNotFound(_) => Ok(None),
                other => Err(other),
            },
        }
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> Result<()> {
        self.http
            .kick_member(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await
            .map_err(|e| map_discord_error(e, user_id, "kick"))?;

        tracing::info!(guild_id, user_id, "Member kicked");
        Ok(())
    }

    async fn timeout(
        &self,
        guild_id: u64,
        user_id: u64,
        duration_secs: u64,
        reason: &str,
    ) -> Result<()> {
        let timeout_until =
            Timestamp::from_unix_timestamp(Utc::now().timestamp() + duration_secs as i64)
                .map_err(|e| GatewardenError::InternalState(format!("Invalid timestamp: {}", e)))?;

        let edit_member = serenity::builder::EditMember::new()
            .disable_communication_until(timeout_until.to_string())
            .audit_log_reason(reason);

        self.http
            .edit_member(
                GuildId::new(guild_id),
                UserId::new(user_id),
                &edit_member,
                Some(reason),
            )
            .await
            .map_err(|e| map_discord_error(e, user_id, "timeout"))?;

        tracing::info!(guild_id, user_id, duration_secs, "Member timed out");
        Ok(())
    }

    async fn set_roles(
        &self,
        guild_id: u64,
        user_id: u64,
        roles: &[u64],
        reason: &str,
    ) -> Result<()> {
        let role_ids: Vec<RoleId> = roles.iter().map(|r| RoleId::new(*r)).collect();

        let edit_member = serenity::builder::EditMember::new()
            .roles(role_ids)
            .audit_log_reason(reason);

        self.http
            .edit_member(
                GuildId::new(guild_id),
                UserId::new(user_id),
                &edit_member,
                Some(reason),
            )
            .await
            .map_err(|e| map_discord_error(e, user_id, "set_roles"))?;

        tracing::info!(guild_id, user_id, roles = ?roles, "Member roles replaced");
        Ok(())
    }

    async fn revoke_invites(&self, guild_id: u64) -> Result<u32> {
        let invites = self
            .http
            .get_guild_invites(GuildId::new(guild_id))
            .await
            .map_err(|e| GatewardenError::DiscordApi(Box::new(e)))?;

        let mut revoked = 0u32;
        for invite in invites {
            match self
                .http
                .delete_invite(&invite.code, Some("Revoked during anti-raid lockdown"))
                .await
            {
                Ok(_) => revoked += 1,
                Err(e) => {
                    // Best effort: one stubborn invite must not stop the rest
                    tracing::warn!(guild_id, code = %invite.code, error = %e, "Failed to delete invite");
                }
            }
        }

        tracing::info!(guild_id, revoked, "Guild invites revoked");
        Ok(revoked)
    }
}
