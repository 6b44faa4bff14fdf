//! Lockdown state machine.
//!
//! Per-guild states `Normal` and `Lockdown`, cyclic. Crossing the join
//! threshold enters lockdown (persist flag, optionally revoke invites,
//! remediate the triggering batch, emit one summary). While locked down
//! every join is remediated immediately without re-evaluation. The only way
//! back to `Normal` is an explicit administrative reset; no amount of time
//! exits lockdown on its own.
//!
//! The whole evaluate-then-transition sequence is serialized per guild so
//! two near-simultaneous joins cannot both run the entry side effects.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::membership::GuildHost;
use crate::notify::{RaidNotice, RaidNotifier};
use crate::remediation::RemediationExecutor;
use crate::settings::{AntiRaidSettings, SettingsStore};
use crate::tracker::{JoinRecord, JoinTracker, TrackerDecision};

/// The anti-raid engine: tracker, state machine and executor behind one
/// per-guild critical section.
pub struct LockdownEngine {
    settings: Arc<SettingsStore>,
    tracker: JoinTracker,
    executor: RemediationExecutor,
    host: Arc<dyn GuildHost>,
    notifier: Arc<dyn RaidNotifier>,
    guild_locks: DashMap<u64, Arc<Mutex<()>>>,
}

impl LockdownEngine {
    pub fn new(
        settings: Arc<SettingsStore>,
        host: Arc<dyn GuildHost>,
        notifier: Arc<dyn RaidNotifier>,
    ) -> Self {
        Self {
            tracker: JoinTracker::new(settings.clone()),
            executor: RemediationExecutor::new(host.clone()),
            settings,
            host,
            notifier,
            guild_locks: DashMap::new(),
        }
    }

    /// Handle a member-join gateway event.
    pub async fn handle_join(&self, guild_id: u64, user_id: u64) {
        self.handle_join_at(guild_id, user_id, Utc::now().timestamp_millis())
            .await;
    }

    /// Evaluate one join at an explicit timestamp.
    async fn handle_join_at(&self, guild_id: u64, user_id: u64, now_ms: i64) {
        // One join at a time per guild: the tracker read-modify-write and
        // the lockdown transition form a single critical section.
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        let settings = self.settings.load_or_default(guild_id).await;

        match self
            .tracker
            .record_join(guild_id, user_id, now_ms, self.host.as_ref())
            .await
        {
            TrackerDecision::Disabled => {}
            TrackerDecision::BelowThreshold { counted } => {
                tracing::debug!(guild_id, user_id, counted, "Join tracked, below threshold");
            }
            TrackerDecision::AlreadyLockedDown => {
                tracing::info!(guild_id, user_id, "Join during lockdown, remediating");
                let report = self
                    .executor
                    .remediate_one(guild_id, user_id, &settings)
                    .await;
                self.send_notice(&settings, RaidNotice::lockdown_join(&report))
                    .await;
            }
            TrackerDecision::ThresholdCrossed { joins } => {
                self.enter_lockdown(&settings, joins).await;
            }
        }
    }

    /// Lockdown-entry transition: flag, invites, batch remediation, one
    /// summary notification.
    async fn enter_lockdown(&self, settings: &AntiRaidSettings, joins: Vec<JoinRecord>) {
        let guild_id = settings.guild_id;
        tracing::warn!(
            guild_id,
            joins = joins.len(),
            action = settings.action.as_str(),
            "Join threshold crossed, entering lockdown"
        );

        // Persist first so a crash mid-remediation still leaves the guild
        // locked down after restart.
        if let Err(e) = self.settings.set_lockdown_active(guild_id, true).await {
            tracing::error!(guild_id, error = %e, "Failed to persist lockdown flag");
        }

        if settings.revoke_invites_on_lockdown {
            if let Err(e) = self.host.revoke_invites(guild_id).await {
                tracing::warn!(guild_id, error = %e, "Invite revocation failed");
            }
        }

        let batch = distinct_in_order(&joins);
        let report = self
            .executor
            .remediate_batch(guild_id, &batch, settings)
            .await;

        self.send_notice(settings, RaidNotice::lockdown_engaged(&report, joins.len()))
            .await;
    }

    /// Administrative reset: clear tracked joins and return to `Normal`.
    /// Safe to call repeatedly, including when not locked down.
    pub async fn reset(&self, guild_id: u64) -> crate::error::Result<()> {
        let lock = self.guild_lock(guild_id);
        let _guard = lock.lock().await;

        self.tracker.clear(guild_id).await;
        self.settings.set_lockdown_active(guild_id, false).await?;

        tracing::info!(guild_id, "Lockdown reset, state is normal");
        Ok(())
    }

    /// Drop cached settings after an administrative reconfiguration.
    pub async fn invalidate_settings(&self, guild_id: u64) {
        self.settings.invalidate(guild_id).await;
    }

    fn guild_lock(&self, guild_id: u64) -> Arc<Mutex<()>> {
        self.guild_locks
            .entry(guild_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn send_notice(&self, settings: &AntiRaidSettings, notice: RaidNotice) {
        let Some(channel_id) = settings.log_channel_id else {
            tracing::debug!(guild_id = settings.guild_id, "No log channel configured");
            return;
        };

        if let Err(e) = self.notifier.notify(channel_id, &notice).await {
            tracing::warn!(
                guild_id = settings.guild_id,
                channel_id,
                error = %e,
                "Failed to deliver lockdown notice"
            );
        }
    }
}

/// Deduplicate a join batch by member id, preserving first-join order.
fn distinct_in_order(joins: &[JoinRecord]) -> Vec<u64> {
    let mut seen = std::collections::HashSet::new();
    joins
        .iter()
        .filter(|j| seen.insert(j.id))
        .map(|j| j.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::testing::{HostCall, MockHost};
    use crate::notify::testing::RecordingNotifier;
    use crate::store::KvStore;

    const GUILD: u64 = 12345;
    const LOG_CHANNEL: u64 = 999;
    const WHITELIST_ROLE: u64 = 777;

    struct Rig {
        engine: LockdownEngine,
        settings: Arc<SettingsStore>,
        host: Arc<MockHost>,
        notifier: Arc<RecordingNotifier>,
    }

    async fn rig(threshold: u32, interval_secs: u64) -> Rig {
        let settings = Arc::new(SettingsStore::new(
            KvStore::in_memory().await.expect("should create store"),
        ));
        settings.set_threshold(GUILD, threshold).await.expect("set");
        settings
            .set_interval_secs(GUILD, interval_secs)
            .await
            .expect("set");
        settings.set_action(GUILD, "kick").await.expect("set");
        settings.set_log_channel(GUILD, LOG_CHANNEL).await.expect("set");
        settings
            .whitelist_add(GUILD, WHITELIST_ROLE)
            .await
            .expect("set");
        settings.set_enabled(GUILD, true).await.expect("set");

        let host = Arc::new(MockHost::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = LockdownEngine::new(settings.clone(), host.clone(), notifier.clone());

        Rig {
            engine,
            settings,
            host,
            notifier,
        }
    }

    #[tokio::test]
    async fn threshold_crossing_enters_lockdown_and_remediates_batch() {
        let rig = rig(3, 60).await;
        for id in 1..=3u64 {
            rig.host.add_member(id, &[]);
        }

        rig.engine.handle_join_at(GUILD, 1, 0).await;
        rig.engine.handle_join_at(GUILD, 2, 1_000).await;
        rig.engine.handle_join_at(GUILD, 3, 2_000).await;

        let settings = rig.settings.load(GUILD).await.expect("load");
        assert!(settings.lockdown_active);

        // All three were kicked, one summary was sent
        assert_eq!(
            rig.host.calls(),
            vec![HostCall::Kick(1), HostCall::Kick(2), HostCall::Kick(3)]
        );
        let sent = rig.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, LOG_CHANNEL);
        assert!(sent[0].1.title.contains("Lockdown Engaged"));
    }

    #[tokio::test]
    async fn below_threshold_never_triggers() {
        let rig = rig(3, 60).await;
        rig.host.add_member(1, &[]);
        rig.host.add_member(2, &[]);

        rig.engine.handle_join_at(GUILD, 1, 0).await;
        rig.engine.handle_join_at(GUILD, 2, 1_000).await;

        let settings = rig.settings.load(GUILD).await.expect("load");
        assert!(!settings.lockdown_active);
        assert!(rig.host.calls().is_empty());
        assert!(rig.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn joins_during_lockdown_are_remediated_without_recount() {
        let rig = rig(2, 60).await;
        rig.host.add_member(1, &[]);
        rig.host.add_member(2, &[]);

        rig.engine.handle_join_at(GUILD, 1, 0).await;
        rig.engine.handle_join_at(GUILD, 2, 100).await;
        assert!(rig.settings.load(GUILD).await.expect("load").lockdown_active);

        // Hours later, still locked down: the join is remediated immediately
        rig.host.add_member(3, &[]);
        rig.engine
            .handle_join_at(GUILD, 3, 8 * 3600 * 1000)
            .await;

        let calls = rig.host.calls();
        assert!(calls.contains(&HostCall::Kick(3)));

        let sent = rig.notifier.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].1.title.contains("Join During Lockdown"));
    }

    #[tokio::test]
    async fn whitelisted_member_untouched_even_during_lockdown() {
        let rig = rig(2, 60).await;
        rig.host.add_member(1, &[]);
        rig.host.add_member(2, &[]);
        rig.engine.handle_join_at(GUILD, 1, 0).await;
        rig.engine.handle_join_at(GUILD, 2, 100).await;

        rig.host.add_member(3, &[WHITELIST_ROLE]);
        rig.engine.handle_join_at(GUILD, 3, 200).await;

        assert!(!rig.host.calls().contains(&HostCall::Kick(3)));
    }

    #[tokio::test]
    async fn invites_revoked_only_when_configured() {
        let rig = rig(1, 60).await;
        rig.settings.set_revoke_invites(GUILD, true).await.expect("set");
        rig.host.add_member(1, &[]);

        rig.engine.handle_join_at(GUILD, 1, 0).await;

        let calls = rig.host.calls();
        assert_eq!(calls[0], HostCall::RevokeInvites);
        assert_eq!(calls[1], HostCall::Kick(1));
    }

    #[tokio::test]
    async fn concurrent_joins_trigger_lockdown_entry_once() {
        let rig = rig(2, 60).await;
        rig.host.add_member(1, &[]);
        rig.host.add_member(2, &[]);
        rig.host.add_member(3, &[]);

        rig.engine.handle_join_at(GUILD, 1, 0).await;

        // Two joins racing for the same transition: serialization means one
        // crosses the threshold and the other lands in lockdown handling.
        tokio::join!(
            rig.engine.handle_join_at(GUILD, 2, 100),
            rig.engine.handle_join_at(GUILD, 3, 150),
        );

        let engaged = rig
            .notifier
            .sent()
            .iter()
            .filter(|(_, n)| n.title.contains("Lockdown Engaged"))
            .count();
        assert_eq!(engaged, 1);
    }

    #[tokio::test]
    async fn reset_returns_to_normal_and_is_idempotent() {
        let rig = rig(2, 60).await;
        rig.host.add_member(1, &[]);
        rig.host.add_member(2, &[]);
        rig.engine.handle_join_at(GUILD, 1, 0).await;
        rig.engine.handle_join_at(GUILD, 2, 100).await;
        assert!(rig.settings.load(GUILD).await.expect("load").lockdown_active);

        rig.engine.reset(GUILD).await.expect("reset");
        let settings = rig.settings.load(GUILD).await.expect("load");
        assert!(!settings.lockdown_active);

        // Second reset is safe and leaves the same state
        rig.engine.reset(GUILD).await.expect("reset again");
        let settings = rig.settings.load(GUILD).await.expect("load");
        assert!(!settings.lockdown_active);

        // The join window restarts from scratch
        rig.host.add_member(9, &[]);
        rig.engine.handle_join_at(GUILD, 9, 200).await;
        assert!(!rig.settings.load(GUILD).await.expect("load").lockdown_active);
    }

    #[tokio::test]
    async fn no_time_based_exit_from_lockdown() {
        let rig = rig(1, 60).await;
        rig.host.add_member(1, &[]);
        rig.engine.handle_join_at(GUILD, 1, 0).await;

        // A week of silence changes nothing
        rig.host.add_member(2, &[]);
        rig.engine
            .handle_join_at(GUILD, 2, 7 * 24 * 3600 * 1000)
            .await;

        assert!(rig.settings.load(GUILD).await.expect("load").lockdown_active);
        assert!(rig.host.calls().contains(&HostCall::Kick(2)));
    }

    #[tokio::test]
    async fn missing_log_channel_is_not_fatal() {
        let settings = Arc::new(SettingsStore::new(
            KvStore::in_memory().await.expect("should create store"),
        ));
        settings.set_threshold(GUILD, 1).await.expect("set");
        settings.set_action(GUILD, "kick").await.expect("set");
        settings.set_enabled(GUILD, true).await.expect("set");

        let host = Arc::new(MockHost::new());
        host.add_member(1, &[]);
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = LockdownEngine::new(settings.clone(), host.clone(), notifier.clone());

        engine.handle_join_at(GUILD, 1, 0).await;

        assert!(settings.load(GUILD).await.expect("load").lockdown_active);
        assert!(notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn burst_trigger_then_reset_timing_scenario() {
        // threshold=5, interval=60s; joins at t=0,10,20,30,40 trigger on the
        // 5th; a 6th at t=45 is remediated immediately; after a reset at
        // t=50 a join at t=70 starts a fresh count.
        let rig = rig(5, 60).await;
        for id in 1..=7u64 {
            rig.host.add_member(id, &[]);
        }

        for (i, t) in [0i64, 10_000, 20_000, 30_000].iter().enumerate() {
            rig.engine.handle_join_at(GUILD, i as u64 + 1, *t).await;
            assert!(
                !rig.settings.load(GUILD).await.expect("load").lockdown_active,
                "join {} must not trigger",
                i + 1
            );
        }

        rig.engine.handle_join_at(GUILD, 5, 40_000).await;
        assert!(rig.settings.load(GUILD).await.expect("load").lockdown_active);

        rig.engine.handle_join_at(GUILD, 6, 45_000).await;
        assert!(rig.host.calls().contains(&HostCall::Kick(6)));

        rig.engine.reset(GUILD).await.expect("reset");

        rig.engine.handle_join_at(GUILD, 7, 70_000).await;
        let settings = rig.settings.load(GUILD).await.expect("load");
        assert!(!settings.lockdown_active);
        // Member 7 was not remediated: fresh window, count restarted at 1
        assert!(!rig.host.calls().contains(&HostCall::Kick(7)));
    }

    #[test]
    fn distinct_in_order_preserves_first_occurrence() {
        let joins = vec![
            JoinRecord { id: 3, ts: 0 },
            JoinRecord { id: 1, ts: 1 },
            JoinRecord { id: 3, ts: 2 },
            JoinRecord { id: 2, ts: 3 },
        ];
        assert_eq!(distinct_in_order(&joins), vec![3, 1, 2]);
    }
}
