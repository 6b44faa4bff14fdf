//! Notification sink for lockdown events.
//!
//! One consolidated summary per remediation batch goes to the guild's
//! configured log channel. Delivery failure is logged by the caller and is
//! never fatal to the engine.

use std::sync::Arc;

use chrono::Utc;
use serenity::http::Http;
use serenity::model::id::ChannelId;

use crate::error::{GatewardenError, Result};
use crate::remediation::RemediationReport;

/// Discord red, used for lockdown alerts.
const ALERT_COLOR: u32 = 0xED4245;
/// Discord embed field value limit.
const FIELD_VALUE_LIMIT: usize = 1024;

/// A structured notification: title, description, color, fields, timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidNotice {
    pub title: String,
    pub description: String,
    pub color: u32,
    /// (name, value) pairs rendered as embed fields.
    pub fields: Vec<(String, String)>,
}

impl RaidNotice {
    /// Summary sent when lockdown is entered over a triggering batch.
    pub fn lockdown_engaged(report: &RemediationReport, joins_in_window: usize) -> Self {
        Self {
            title: "🚨 Anti-Raid: Lockdown Engaged".to_string(),
            description: format!(
                "Detected {} joins in a short window. Action: {}",
                joins_in_window,
                report.action.as_str()
            ),
            color: ALERT_COLOR,
            fields: vec![
                ("Lockdown".to_string(), "⚠️ Active".to_string()),
                ("Results".to_string(), results_field(report)),
            ],
        }
    }

    /// Summary for a single join remediated while already locked down.
    pub fn lockdown_join(report: &RemediationReport) -> Self {
        Self {
            title: "🚨 Anti-Raid: Join During Lockdown".to_string(),
            description: format!(
                "A member joined while lockdown is active. Action: {}",
                report.action.as_str()
            ),
            color: ALERT_COLOR,
            fields: vec![("Results".to_string(), results_field(report))],
        }
    }
}

/// Render the per-member outcome list, truncated to the embed field limit.
fn results_field(report: &RemediationReport) -> String {
    let details: String = report
        .outcomes
        .iter()
        .map(|o| format!("<@{}>: {}", o.member_id, o.outcome.describe()))
        .collect::<Vec<_>>()
        .join("\n");

    if details.is_empty() {
        return "No action applied.".to_string();
    }

    if details.len() > FIELD_VALUE_LIMIT {
        let mut truncated: String = details.chars().take(FIELD_VALUE_LIMIT - 1).collect();
        truncated.push('…');
        truncated
    } else {
        details
    }
}

/// Delivery seam for lockdown notices.
#[serenity::async_trait]
pub trait RaidNotifier: Send + Sync {
    /// Deliver a notice to the given channel.
    async fn notify(&self, channel_id: u64, notice: &RaidNotice) -> Result<()>;
}

/// Production notifier posting an embed through the Discord REST API.
pub struct DiscordNotifier {
    http: Arc<Http>,
}

impl DiscordNotifier {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

#[serenity::async_trait]
impl RaidNotifier for DiscordNotifier {
    async fn notify(&self, channel_id: u64, notice: &RaidNotice) -> Result<()> {
        let fields: Vec<serde_json::Value> = notice
            .fields
            .iter()
            .map(|(name, value)| {
                serde_json::json!({ "name": name, "value": value, "inline": false })
            })
            .collect();

        let payload = serde_json::json!({
            "embeds": [{
                "title": notice.title,
                "description": notice.description,
                "color": notice.color,
                "fields": fields,
                "timestamp": Utc::now().to_rfc3339(),
            }]
        });

        self.http
            .send_message(ChannelId::new(channel_id), vec![], &payload)
            .await
            .map_err(|e| GatewardenError::DiscordApi(Box::new(e)))?;

        Ok(())
    }
}
