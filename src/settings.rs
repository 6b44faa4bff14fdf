//! Per-guild anti-raid settings.
//!
//! Settings are persisted field-by-field in the key-value store under
//! `antiRaid_<guildId>.<field>` and cached in memory. Administrative writes
//! are validated here, before anything is stored: unknown action names and
//! zero thresholds/intervals are rejected at configuration time rather than
//! falling through at remediation time.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{GatewardenError, Result};
use crate::store::KvStore;

/// Default join threshold when none has been configured.
pub const DEFAULT_THRESHOLD: u32 = 5;
/// Default rolling window length in seconds.
pub const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Build a storage key for a guild's anti-raid field.
pub fn raid_key(guild_id: u64, field: &str) -> String {
    format!("antiRaid_{}.{}", guild_id, field)
}

/// Remediation action applied to flagged members.
///
/// Closed set: unknown values are rejected when an admin writes the
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaidAction {
    Kick,
    Timeout,
    Quarantine,
    None,
}

impl RaidAction {
    /// Storage / display string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kick => "kick",
            Self::Timeout => "timeout",
            Self::Quarantine => "quarantine",
            Self::None => "none",
        }
    }

    /// Parse from the stored string. Unknown values yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kick" => Some(Self::Kick),
            "timeout" => Some(Self::Timeout),
            "quarantine" => Some(Self::Quarantine),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Anti-raid configuration for one guild.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AntiRaidSettings {
    pub guild_id: u64,
    /// Whether join tracking is active at all.
    pub enabled: bool,
    /// Non-whitelisted joins within the window that trigger lockdown.
    pub threshold: u32,
    /// Rolling window length in seconds.
    pub interval_secs: u64,
    /// Action applied to flagged members.
    pub action: RaidAction,
    /// Timeout duration; consulted only when `action` is `Timeout`.
    pub timeout_secs: Option<u64>,
    /// Quarantine role; consulted only when `action` is `Quarantine`.
    pub quarantine_role_id: Option<u64>,
    /// Channel receiving lockdown summaries.
    pub log_channel_id: Option<u64>,
    /// Members holding any of these roles are exempt from remediation.
    pub whitelist_roles: Vec<u64>,
    /// Revoke all active invites when entering lockdown.
    pub revoke_invites_on_lockdown: bool,
    /// Current lockdown state. Persisted; only a manual reset clears it.
    pub lockdown_active: bool,
}

impl AntiRaidSettings {
    /// Defaults for a guild that has never been configured.
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            enabled: false,
            threshold: DEFAULT_THRESHOLD,
            interval_secs: DEFAULT_INTERVAL_SECS,
            action: RaidAction::None,
            timeout_secs: None,
            quarantine_role_id: None,
            log_channel_id: None,
            whitelist_roles: Vec::new(),
            revoke_invites_on_lockdown: false,
            lockdown_active: false,
        }
    }

    /// True when the member's role set intersects the whitelist.
    pub fn is_whitelisted(&self, member_roles: &[u64]) -> bool {
        member_roles
            .iter()
            .any(|r| self.whitelist_roles.contains(r))
    }
}

/// Settings store: persistence plus an explicit per-guild cache.
///
/// The cache is owned here, not global; the administrative surface calls
/// [`SettingsStore::invalidate`] after every configuration write so the
/// engine never acts on stale settings.
pub struct SettingsStore {
    store: KvStore,
    cache: Arc<RwLock<HashMap<u64, AntiRaidSettings>>>,
}

impl SettingsStore {
    pub fn new(store: KvStore) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &KvStore {
        &self.store
    }

    /// Load a guild's settings, using the cache when warm.
    pub async fn load(&self, guild_id: u64) -> Result<AntiRaidSettings> {
        {
            let cache = self.cache.read().await;
            if let Some(settings) = cache.get(&guild_id) {
                return Ok(settings.clone());
            }
        }

        let settings = self.read_from_store(guild_id).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(guild_id, settings.clone());
        }

        Ok(settings)
    }

    /// Load settings, falling back to defaults on a storage failure.
    ///
    /// Keeps the detector live rather than wedging it when the store is
    /// briefly unavailable.
    pub async fn load_or_default(&self, guild_id: u64) -> AntiRaidSettings {
        match self.load(guild_id).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(guild_id, error = %e, "Settings read failed, assuming defaults");
                AntiRaidSettings::new(guild_id)
            }
        }
    }

    /// Drop the cached settings for a guild.
    pub async fn invalidate(&self, guild_id: u64) {
        let mut cache = self.cache.write().await;
        cache.remove(&guild_id);
    }

    async fn read_from_store(&self, guild_id: u64) -> Result<AntiRaidSettings> {
        let mut settings = AntiRaidSettings::new(guild_id);

        if let Some(enabled) = self.store.get_json(&raid_key(guild_id, "enabled")).await? {
            settings.enabled = enabled;
        }
        if let Some(threshold) = self.store.get_json(&raid_key(guild_id, "threshold")).await? {
            settings.threshold = threshold;
        }
        if let Some(interval) = self.store.get_json(&raid_key(guild_id, "interval")).await? {
            settings.interval_secs = interval;
        }
        if let Some(action) = self
            .store
            .get_json::<String>(&raid_key(guild_id, "action"))
            .await?
        {
            match RaidAction::parse(&action) {
                Some(parsed) => settings.action = parsed,
                None => {
                    tracing::warn!(guild_id, action = %action, "Ignoring unknown stored action");
                }
            }
        }
        settings.timeout_secs = self
            .store
            .get_json(&raid_key(guild_id, "timeoutDuration"))
            .await?;
        settings.quarantine_role_id = self
            .store
            .get_json(&raid_key(guild_id, "quarantineRoleId"))
            .await?;
        settings.log_channel_id = self
            .store
            .get_json(&raid_key(guild_id, "logChannelId"))
            .await?;
        if let Some(roles) = self
            .store
            .get_json(&raid_key(guild_id, "whitelistRoles"))
            .await?
        {
            settings.whitelist_roles = roles;
        }
        if let Some(revoke) = self
            .store
            .get_json(&raid_key(guild_id, "revokeInvitesOnLockdown"))
            .await?
        {
            settings.revoke_invites_on_lockdown = revoke;
        }
        if let Some(lockdown) = self.store.get_json(&raid_key(guild_id, "lockdown")).await? {
            settings.lockdown_active = lockdown;
        }

        Ok(settings)
    }

    // ========== Administrative writes (validated) ==========

    /// Enable or disable join tracking.
    pub async fn set_enabled(&self, guild_id: u64, enabled: bool) -> Result<()> {
        if enabled {
            let settings = self.load(guild_id).await?;
            if settings.threshold == 0 || settings.interval_secs == 0 {
                return Err(GatewardenError::Validation(
                    "threshold and interval must be at least 1 before enabling".to_string(),
                ));
            }
        }
        self.store
            .set_json(&raid_key(guild_id, "enabled"), &enabled)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Set the join threshold. Zero is rejected, never "immediate trigger".
    pub async fn set_threshold(&self, guild_id: u64, threshold: u32) -> Result<()> {
        if threshold == 0 {
            return Err(GatewardenError::Validation(
                "threshold must be at least 1".to_string(),
            ));
        }
        self.store
            .set_json(&raid_key(guild_id, "threshold"), &threshold)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Set the rolling window length in seconds. Zero is rejected.
    pub async fn set_interval_secs(&self, guild_id: u64, interval_secs: u64) -> Result<()> {
        if interval_secs == 0 {
            return Err(GatewardenError::Validation(
                "interval must be at least 1 second".to_string(),
            ));
        }
        self.store
            .set_json(&raid_key(guild_id, "interval"), &interval_secs)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Set the remediation action from its string form.
    pub async fn set_action(&self, guild_id: u64, action: &str) -> Result<()> {
        let Some(parsed) = RaidAction::parse(action) else {
            return Err(GatewardenError::Validation(format!(
                "unknown action '{}' (expected kick, timeout, quarantine or none)",
                action
            )));
        };
        self.store
            .set_json(&raid_key(guild_id, "action"), &parsed.as_str())
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Set the timeout duration used by the `Timeout` action.
    pub async fn set_timeout_secs(&self, guild_id: u64, timeout_secs: u64) -> Result<()> {
        if timeout_secs == 0 {
            return Err(GatewardenError::Validation(
                "timeout duration must be at least 1 second".to_string(),
            ));
        }
        self.store
            .set_json(&raid_key(guild_id, "timeoutDuration"), &timeout_secs)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Set the quarantine role used by the `Quarantine` action.
    pub async fn set_quarantine_role(&self, guild_id: u64, role_id: u64) -> Result<()> {
        self.store
            .set_json(&raid_key(guild_id, "quarantineRoleId"), &role_id)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Set the log channel receiving lockdown summaries.
    pub async fn set_log_channel(&self, guild_id: u64, channel_id: u64) -> Result<()> {
        self.store
            .set_json(&raid_key(guild_id, "logChannelId"), &channel_id)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Toggle invite revocation on lockdown entry.
    pub async fn set_revoke_invites(&self, guild_id: u64, revoke: bool) -> Result<()> {
        self.store
            .set_json(&raid_key(guild_id, "revokeInvitesOnLockdown"), &revoke)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Add a role to the whitelist. Adding twice is a no-op.
    pub async fn whitelist_add(&self, guild_id: u64, role_id: u64) -> Result<()> {
        let mut settings = self.load(guild_id).await?;
        if !settings.whitelist_roles.contains(&role_id) {
            settings.whitelist_roles.push(role_id);
            self.store
                .set_json(
                    &raid_key(guild_id, "whitelistRoles"),
                    &settings.whitelist_roles,
                )
                .await?;
        }
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Remove a role from the whitelist.
    pub async fn whitelist_remove(&self, guild_id: u64, role_id: u64) -> Result<()> {
        let mut settings = self.load(guild_id).await?;
        settings.whitelist_roles.retain(|r| *r != role_id);
        self.store
            .set_json(
                &raid_key(guild_id, "whitelistRoles"),
                &settings.whitelist_roles,
            )
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    /// Persist the lockdown flag. Used only by the state machine.
    pub async fn set_lockdown_active(&self, guild_id: u64, active: bool) -> Result<()> {
        self.store
            .set_json(&raid_key(guild_id, "lockdown"), &active)
            .await?;
        self.invalidate(guild_id).await;
        Ok(())
    }
}
