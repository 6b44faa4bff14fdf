//! Remediation Executor.
//!
//! Applies the configured action to flagged members, one at a time, with a
//! short courtesy delay between actions so a large batch does not hammer the
//! API. Every member gets an outcome record; a failure on one member never
//! aborts the batch.

use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewardenError;
use crate::membership::GuildHost;
use crate::settings::{AntiRaidSettings, RaidAction};

/// Delay after a kick before the next action.
const KICK_DELAY: Duration = Duration::from_millis(500);
/// Delay after a timeout or quarantine before the next action.
const ACTION_DELAY: Duration = Duration::from_millis(300);

/// Audit-log reason attached to every remediation mutation.
const REMEDIATION_REASON: &str = "Anti-raid lockdown";

/// What happened to one member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationOutcome {
    /// Removed from the guild.
    Kicked,
    /// Interaction suspended for the given duration.
    TimedOut { secs: u64 },
    /// Role set replaced with exactly the quarantine role.
    Quarantined { role_id: u64 },
    /// Member holds a whitelisted role; left untouched.
    SkippedWhitelisted,
    /// No action is configured for this guild; nothing was mutated.
    NoActionConfigured,
    /// The action could not be applied. The batch continued.
    Failed { reason: String },
}

impl RemediationOutcome {
    /// True when a mutation was actually applied.
    pub fn is_applied(&self) -> bool {
        matches!(
            self,
            Self::Kicked | Self::TimedOut { .. } | Self::Quarantined { .. }
        )
    }

    /// Human-readable line for the summary notification.
    pub fn describe(&self) -> String {
        match self {
            Self::Kicked => "kicked".to_string(),
            Self::TimedOut { secs } => format!("timed out {}s", secs),
            Self::Quarantined { role_id } => format!("quarantined <@&{}>", role_id),
            Self::SkippedWhitelisted => "skipped (whitelisted)".to_string(),
            Self::NoActionConfigured => "no action configured".to_string(),
            Self::Failed { reason } => format!("failed ({})", reason),
        }
    }
}

/// Outcome record for one member, in batch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberOutcome {
    pub member_id: u64,
    pub outcome: RemediationOutcome,
}

/// Ordered result of remediating one batch.
#[derive(Debug, Clone)]
pub struct RemediationReport {
    pub guild_id: u64,
    pub action: RaidAction,
    pub outcomes: Vec<MemberOutcome>,
}

impl RemediationReport {
    /// Members with an actually applied mutation.
    pub fn applied_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome.is_applied())
            .count()
    }

    /// Members whose action failed.
    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, RemediationOutcome::Failed { .. }))
            .count()
    }
}

/// Sequential, rate-limited remediation executor.
pub struct RemediationExecutor {
    host: Arc<dyn GuildHost>,
}

impl RemediationExecutor {
    pub fn new(host: Arc<dyn GuildHost>) -> Self {
        Self { host }
    }

    /// Remediate a batch of members, in order, with per-member isolation.
    pub async fn remediate_batch(
        &self,
        guild_id: u64,
        members: &[u64],
        settings: &AntiRaidSettings,
    ) -> RemediationReport {
        let mut outcomes = Vec::with_capacity(members.len());

        for member_id in members {
            let outcome = self.remediate_member(guild_id, *member_id, settings).await;

            if outcome.is_applied() {
                let delay = match settings.action {
                    RaidAction::Kick => KICK_DELAY,
                    _ => ACTION_DELAY,
                };
                tokio::time::sleep(delay).await;
            }

            outcomes.push(MemberOutcome {
                member_id: *member_id,
                outcome,
            });
        }

        let report = RemediationReport {
            guild_id,
            action: settings.action,
            outcomes,
        };

        tracing::info!(
            guild_id,
            batch = members.len(),
            applied = report.applied_count(),
            failed = report.failed_count(),
            action = settings.action.as_str(),
            "Remediation batch complete"
        );

        report
    }

    /// Fast path for a single join arriving while already locked down.
    pub async fn remediate_one(
        &self,
        guild_id: u64,
        member_id: u64,
        settings: &AntiRaidSettings,
    ) -> RemediationReport {
        self.remediate_batch(guild_id, &[member_id], settings).await
    }

    async fn remediate_member(
        &self,
        guild_id: u64,
        member_id: u64,
        settings: &AntiRaidSettings,
    ) -> RemediationOutcome {
        // Whitelist is re-checked at execution time: roles may have changed
        // since the join was recorded.
        let roles = match self.host.member_roles(guild_id, member_id).await {
            Ok(Some(roles)) => roles,
            Ok(None) => {
                return RemediationOutcome::Failed {
                    reason: "member_not_found".to_string(),
                }
            }
            Err(e) => {
                tracing::warn!(guild_id, member_id, error = %e, "Member fetch failed");
                return RemediationOutcome::Failed {
                    reason: e.remediation_reason(),
                };
            }
        };

        if settings.is_whitelisted(&roles) {
            return RemediationOutcome::SkippedWhitelisted;
        }

        match settings.action {
            RaidAction::None => RemediationOutcome::NoActionConfigured,
            RaidAction::Kick => match self
                .host
                .kick(guild_id, member_id, REMEDIATION_REASON)
                .await
            {
                Ok(()) => RemediationOutcome::Kicked,
                Err(e) => self.failed(guild_id, member_id, "kick", e),
            },
            RaidAction::Timeout => {
                let Some(secs) = settings.timeout_secs else {
                    return RemediationOutcome::Failed {
                        reason: "no_duration_configured".to_string(),
                    };
                };
                match self
                    .host
                    .timeout(guild_id, member_id, secs, REMEDIATION_REASON)
                    .await
                {
                    Ok(()) => RemediationOutcome::TimedOut { secs },
                    Err(e) => self.failed(guild_id, member_id, "timeout", e),
                }
            }
            RaidAction::Quarantine => {
                let Some(role_id) = settings.quarantine_role_id else {
                    return RemediationOutcome::Failed {
                        reason: "no_role_configured".to_string(),
                    };
                };
                match self
                    .host
                    .set_roles(guild_id, member_id, &[role_id], REMEDIATION_REASON)
                    .await
                {
                    Ok(()) => RemediationOutcome::Quarantined { role_id },
                    Err(e) => self.failed(guild_id, member_id, "quarantine", e),
                }
            }
        }
    }

    fn failed(
        &self,
        guild_id: u64,
        member_id: u64,
        operation: &str,
        e: GatewardenError,
    ) -> RemediationOutcome {
        tracing::warn!(guild_id, member_id, operation, error = %e, "Remediation action failed");
        RemediationOutcome::Failed {
            reason: e.remediation_reason(),
        }
    }
}
