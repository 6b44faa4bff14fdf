//! Join Event Tracker.
//!
//! Records join timestamps per guild in a rolling window and decides whether
//! the configured burst threshold was crossed. The join list is persisted
//! under `antiRaid_<guildId>.lastJoins` so a restart only loses the
//! in-flight window, never the lockdown flag.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::membership::GuildHost;
use crate::settings::{raid_key, AntiRaidSettings, SettingsStore};

/// One tracked join. Field names match the stored `lastJoins` records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRecord {
    /// Member id.
    pub id: u64,
    /// Join timestamp in milliseconds since the epoch.
    pub ts: i64,
}

/// Outcome of evaluating one join event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerDecision {
    /// Anti-raid is disabled for this guild.
    Disabled,
    /// The guild is already in lockdown; remediate this member immediately,
    /// no re-count.
    AlreadyLockedDown,
    /// Below the configured threshold.
    BelowThreshold {
        /// Distinct non-whitelisted members currently in the window.
        counted: u32,
    },
    /// Threshold reached: the caller must run the lockdown-entry transition
    /// over this batch.
    ThresholdCrossed {
        /// Every join currently inside the window, oldest first.
        joins: Vec<JoinRecord>,
    },
}

/// Rolling-window join tracker.
pub struct JoinTracker {
    settings: Arc<SettingsStore>,
}

impl JoinTracker {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }

    /// Record a join and evaluate the threshold.
    ///
    /// Storage failures are contained: an unreadable join list is treated as
    /// empty and a failed persist is logged, so the detector stays live.
    pub async fn record_join(
        &self,
        guild_id: u64,
        user_id: u64,
        now_ms: i64,
        host: &dyn GuildHost,
    ) -> TrackerDecision {
        let settings = self.settings.load_or_default(guild_id).await;
        if !settings.enabled {
            return TrackerDecision::Disabled;
        }

        // Rebuild the window: survivors plus the new record.
        let window_ms = settings.interval_secs as i64 * 1000;
        let mut joins = self.load_joins(guild_id).await;
        joins.retain(|j| now_ms - j.ts <= window_ms);
        joins.push(JoinRecord {
            id: user_id,
            ts: now_ms,
        });

        self.persist_joins(guild_id, &joins).await;

        if settings.lockdown_active {
            return TrackerDecision::AlreadyLockedDown;
        }

        let counted = self
            .count_non_whitelisted(guild_id, &joins, &settings, host)
            .await;

        if counted >= settings.threshold {
            TrackerDecision::ThresholdCrossed { joins }
        } else {
            TrackerDecision::BelowThreshold { counted }
        }
    }

    /// Count distinct members in the window lacking any whitelisted role.
    ///
    /// Roles are resolved now, not at append time, because membership can
    /// change between join and evaluation. Members that cannot be fetched
    /// are not counted.
    async fn count_non_whitelisted(
        &self,
        guild_id: u64,
        joins: &[JoinRecord],
        settings: &AntiRaidSettings,
        host: &dyn GuildHost,
    ) -> u32 {
        let distinct: HashSet<u64> = joins.iter().map(|j| j.id).collect();

        let mut counted = 0u32;
        for member_id in distinct {
            match host.member_roles(guild_id, member_id).await {
                Ok(Some(roles)) => {
                    if !settings.is_whitelisted(&roles) {
                        counted += 1;
                    }
                }
                Ok(None) => {
                    // Member already left; not part of the burst count
                }
                Err(e) => {
                    tracing::debug!(guild_id, member_id, error = %e, "Skipping unfetchable member");
                }
            }
        }

        counted
    }

    /// Drop every tracked join for a guild.
    pub async fn clear(&self, guild_id: u64) {
        if let Err(e) = self
            .settings
            .kv()
            .delete(&raid_key(guild_id, "lastJoins"))
            .await
        {
            tracing::warn!(guild_id, error = %e, "Failed to clear join list");
        }
    }

    async fn load_joins(&self, guild_id: u64) -> Vec<JoinRecord> {
        match self
            .settings
            .kv()
            .get_json(&raid_key(guild_id, "lastJoins"))
            .await
        {
            Ok(Some(joins)) => joins,
            Ok(None) => Vec::new(),
            Err(e) => {
                tracing::warn!(guild_id, error = %e, "Join list read failed, assuming empty");
                Vec::new()
            }
        }
    }

    async fn persist_joins(&self, guild_id: u64, joins: &[JoinRecord]) {
        if let Err(e) = self
            .settings
            .kv()
            .set_json(&raid_key(guild_id, "lastJoins"), &joins)
            .await
        {
            tracing::warn!(guild_id, error = %e, "Failed to persist join list");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::testing::MockHost;
    use crate::store::KvStore;

    const GUILD: u64 = 12345;
    const WHITELIST_ROLE: u64 = 777;

    async fn setup(threshold: u32, interval_secs: u64) -> (JoinTracker, Arc<SettingsStore>) {
        let settings = Arc::new(SettingsStore::new(
            KvStore::in_memory().await.expect("should create store"),
        ));
        settings.set_threshold(GUILD, threshold).await.expect("set");
        settings
            .set_interval_secs(GUILD, interval_secs)
            .await
            .expect("set");
        settings.set_enabled(GUILD, true).await.expect("set");
        settings
            .whitelist_add(GUILD, WHITELIST_ROLE)
            .await
            .expect("set");
        (JoinTracker::new(settings.clone()), settings)
    }

    fn host_with_members(ids: &[u64]) -> MockHost {
        let host = MockHost::new();
        for id in ids {
            host.add_member(*id, &[]);
        }
        host
    }

    #[tokio::test]
    async fn disabled_guild_is_noop() {
        let settings = Arc::new(SettingsStore::new(
            KvStore::in_memory().await.expect("should create store"),
        ));
        let tracker = JoinTracker::new(settings);
        let host = host_with_members(&[1]);

        let decision = tracker.record_join(GUILD, 1, 0, &host).await;
        assert_eq!(decision, TrackerDecision::Disabled);
    }

    #[tokio::test]
    async fn below_threshold_then_exact_threshold_triggers() {
        let (tracker, _settings) = setup(3, 60).await;
        let host = host_with_members(&[1, 2, 3]);

        let d1 = tracker.record_join(GUILD, 1, 0, &host).await;
        let d2 = tracker.record_join(GUILD, 2, 1_000, &host).await;
        assert_eq!(d1, TrackerDecision::BelowThreshold { counted: 1 });
        assert_eq!(d2, TrackerDecision::BelowThreshold { counted: 2 });

        // Exactly threshold, not threshold + 1, is the trigger boundary
        let d3 = tracker.record_join(GUILD, 3, 2_000, &host).await;
        match d3 {
            TrackerDecision::ThresholdCrossed { joins } => {
                assert_eq!(joins.len(), 3);
                assert_eq!(joins[0].id, 1);
                assert_eq!(joins[2].id, 3);
            }
            other => panic!("expected ThresholdCrossed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stale_joins_are_evicted_from_window() {
        let (tracker, _settings) = setup(3, 60).await;
        let host = host_with_members(&[1, 2, 3]);

        let _ = tracker.record_join(GUILD, 1, 0, &host).await;
        let _ = tracker.record_join(GUILD, 2, 10_000, &host).await;

        // 65s in, the join at t=0 has left the 60s window, t=10s has not
        let decision = tracker.record_join(GUILD, 3, 65_000, &host).await;
        assert_eq!(decision, TrackerDecision::BelowThreshold { counted: 2 });
    }

    #[tokio::test]
    async fn whitelisted_members_are_not_counted() {
        let (tracker, _settings) = setup(2, 60).await;
        let host = MockHost::new();
        host.add_member(1, &[WHITELIST_ROLE]);
        host.add_member(2, &[WHITELIST_ROLE]);
        host.add_member(3, &[]);

        let _ = tracker.record_join(GUILD, 1, 0, &host).await;
        let _ = tracker.record_join(GUILD, 2, 100, &host).await;
        let decision = tracker.record_join(GUILD, 3, 200, &host).await;

        // Only member 3 counts; two whitelisted joins never trigger
        assert_eq!(decision, TrackerDecision::BelowThreshold { counted: 1 });
    }

    #[tokio::test]
    async fn same_member_joining_twice_counts_once() {
        let (tracker, _settings) = setup(2, 60).await;
        let host = host_with_members(&[1]);

        let _ = tracker.record_join(GUILD, 1, 0, &host).await;
        let decision = tracker.record_join(GUILD, 1, 1_000, &host).await;

        assert_eq!(decision, TrackerDecision::BelowThreshold { counted: 1 });
    }

    #[tokio::test]
    async fn members_who_left_are_not_counted() {
        let (tracker, _settings) = setup(2, 60).await;
        let host = host_with_members(&[2]);

        // Member 1 is unknown to the host (already gone)
        let _ = tracker.record_join(GUILD, 1, 0, &host).await;
        let decision = tracker.record_join(GUILD, 2, 100, &host).await;

        assert_eq!(decision, TrackerDecision::BelowThreshold { counted: 1 });
    }

    #[tokio::test]
    async fn lockdown_short_circuits_recount() {
        let (tracker, settings) = setup(3, 60).await;
        settings
            .set_lockdown_active(GUILD, true)
            .await
            .expect("set lockdown");
        let host = host_with_members(&[1]);

        let decision = tracker.record_join(GUILD, 1, 0, &host).await;
        assert_eq!(decision, TrackerDecision::AlreadyLockedDown);
    }

    #[tokio::test]
    async fn join_window_survives_tracker_restart() {
        let (tracker, settings) = setup(3, 60).await;
        let host = host_with_members(&[1, 2, 3]);

        let _ = tracker.record_join(GUILD, 1, 0, &host).await;
        let _ = tracker.record_join(GUILD, 2, 100, &host).await;

        // New tracker over the same store picks up the persisted window
        let restarted = JoinTracker::new(settings);
        let decision = restarted.record_join(GUILD, 3, 200, &host).await;
        assert!(matches!(decision, TrackerDecision::ThresholdCrossed { .. }));
    }

    #[tokio::test]
    async fn clear_resets_the_window() {
        let (tracker, _settings) = setup(3, 60).await;
        let host = host_with_members(&[1, 2, 3]);

        let _ = tracker.record_join(GUILD, 1, 0, &host).await;
        let _ = tracker.record_join(GUILD, 2, 100, &host).await;
        tracker.clear(GUILD).await;

        let decision = tracker.record_join(GUILD, 3, 200, &host).await;
        assert_eq!(decision, TrackerDecision::BelowThreshold { counted: 1 });
    }
}

#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use super::*;
    use crate::membership::testing::MockHost;
    use crate::store::KvStore;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        /// The window count is the number of distinct non-whitelisted
        /// members, independent of join order.
        #[test]
        fn prop_count_is_order_independent(
            mut member_ids in prop::collection::vec(1u64..50u64, 1..8),
            seed in 0u64..1000u64,
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let settings = std::sync::Arc::new(SettingsStore::new(
                    KvStore::in_memory().await.expect("should create store"),
                ));
                settings.set_threshold(1, 1000).await.expect("set");
                settings.set_interval_secs(1, 3600).await.expect("set");
                settings.set_enabled(1, true).await.expect("set");

                let tracker = JoinTracker::new(settings);
                let host = MockHost::new();
                for id in &member_ids {
                    host.add_member(*id, &[]);
                }

                // Shuffle deterministically from the seed
                let len = member_ids.len();
                for i in 0..len {
                    let j = ((seed as usize) + i * 7) % len;
                    member_ids.swap(i, j);
                }

                let mut last_counted = 0u32;
                for (i, id) in member_ids.iter().enumerate() {
                    match tracker.record_join(1, *id, i as i64 * 10, &host).await {
                        TrackerDecision::BelowThreshold { counted } => last_counted = counted,
                        other => panic!("unexpected decision {:?}", other),
                    }
                }

                let distinct: std::collections::HashSet<u64> =
                    member_ids.iter().copied().collect();
                assert_eq!(last_counted as usize, distinct.len());
            });
        }

        /// threshold - 1 distinct joins never trigger; threshold joins do.
        #[test]
        fn prop_trigger_boundary_is_exact(threshold in 2u32..8u32) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            rt.block_on(async {
                let settings = std::sync::Arc::new(SettingsStore::new(
                    KvStore::in_memory().await.expect("should create store"),
                ));
                settings.set_threshold(1, threshold).await.expect("set");
                settings.set_interval_secs(1, 3600).await.expect("set");
                settings.set_enabled(1, true).await.expect("set");

                let tracker = JoinTracker::new(settings);
                let host = MockHost::new();
                for id in 1..=threshold as u64 {
                    host.add_member(id, &[]);
                }

                for id in 1..threshold as u64 {
                    let decision = tracker.record_join(1, id, id as i64, &host).await;
                    assert!(
                        matches!(decision, TrackerDecision::BelowThreshold { .. }),
                        "join {} of {} must not trigger",
                        id,
                        threshold
                    );
                }

                let decision = tracker
                    .record_join(1, threshold as u64, threshold as i64, &host)
                    .await;
                assert!(matches!(decision, TrackerDecision::ThresholdCrossed { .. }));
            });
        }
    }
}
