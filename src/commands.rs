//! Slash command handler.
//!
//! Implements the /antiraid command tree: configuration writes, status, and
//! the manual lockdown reset. Every write goes through the validated
//! settings surface and invalidates the engine's cached view.

use std::sync::Arc;

use serenity::all::{
    CommandDataOption, CommandDataOptionValue, CommandInteraction, CommandOptionType, Context,
    CreateCommand, CreateCommandOption, CreateInteractionResponse,
    CreateInteractionResponseMessage, Permissions,
};

use crate::error::{GatewardenError, Result};
use crate::lockdown::LockdownEngine;
use crate::settings::SettingsStore;

/// Slash command handler.
pub struct SlashCommandHandler {
    settings: Arc<SettingsStore>,
    engine: Arc<LockdownEngine>,
}

impl SlashCommandHandler {
    /// Create a new slash command handler.
    pub fn new(settings: Arc<SettingsStore>, engine: Arc<LockdownEngine>) -> Self {
        Self { settings, engine }
    }

    /// Register all slash commands with Discord.
    pub fn register_commands() -> Vec<CreateCommand> {
        vec![Self::create_antiraid_command()]
    }

    /// Create the main /antiraid command with subcommands.
    fn create_antiraid_command() -> CreateCommand {
        CreateCommand::new("antiraid")
            .description("Anti-raid protection commands")
            .default_member_permissions(Permissions::ADMINISTRATOR)
            .add_option(CreateCommandOption::new(
                CommandOptionType::SubCommand,
                "status",
                "View the current anti-raid configuration",
            ))
            .add_option(CreateCommandOption::new(
                CommandOptionType::SubCommand,
                "enable",
                "Enable join tracking",
            ))
            .add_option(CreateCommandOption::new(
                CommandOptionType::SubCommand,
                "disable",
                "Disable join tracking",
            ))
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "threshold",
                    "Set how many joins in the window trigger lockdown",
                )
                .add_sub_option(
                    CreateCommandOption::new(
                        CommandOptionType::Integer,
                        "count",
                        "Join count (minimum 1)",
                    )
                    .min_int_value(1)
                    .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "interval",
                    "Set the rolling window length",
                )
                .add_sub_option(
                    CreateCommandOption::new(
                        CommandOptionType::Integer,
                        "seconds",
                        "Window length in seconds (minimum 1)",
                    )
                    .min_int_value(1)
                    .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "action",
                    "Set the action applied to raiders",
                )
                .add_sub_option(
                    CreateCommandOption::new(
                        CommandOptionType::String,
                        "action",
                        "Action to apply",
                    )
                    .required(true)
                    .add_string_choice("kick", "kick")
                    .add_string_choice("timeout", "timeout")
                    .add_string_choice("quarantine", "quarantine")
                    .add_string_choice("none", "none"),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "timeout",
                    "Set the timeout duration for the timeout action",
                )
                .add_sub_option(
                    CreateCommandOption::new(
                        CommandOptionType::Integer,
                        "seconds",
                        "Timeout duration in seconds (minimum 1)",
                    )
                    .min_int_value(1)
                    .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "quarantine",
                    "Set the role applied by the quarantine action",
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::Role, "role", "Quarantine role")
                        .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "logchannel",
                    "Set the channel receiving lockdown summaries",
                )
                .add_sub_option(
                    CreateCommandOption::new(
                        CommandOptionType::Channel,
                        "channel",
                        "Log channel",
                    )
                    .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "revokeinvites",
                    "Toggle invite revocation when lockdown engages",
                )
                .add_sub_option(
                    CreateCommandOption::new(
                        CommandOptionType::Boolean,
                        "enabled",
                        "Revoke all invites on lockdown entry",
                    )
                    .required(true),
                ),
            )
            .add_option(
                CreateCommandOption::new(
                    CommandOptionType::SubCommand,
                    "whitelist",
                    "Add or remove a role from the whitelist",
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::String, "mode", "Add or remove")
                        .required(true)
                        .add_string_choice("add", "add")
                        .add_string_choice("remove", "remove"),
                )
                .add_sub_option(
                    CreateCommandOption::new(CommandOptionType::Role, "role", "Role to exempt")
                        .required(true),
                ),
            )
            .add_option(CreateCommandOption::new(
                CommandOptionType::SubCommand,
                "reset",
                "End the lockdown and clear tracked joins",
            ))
    }

    /// Handle an incoming slash command interaction.
    pub async fn handle_command(&self, ctx: &Context, command: &CommandInteraction) -> Result<()> {
        // Check permissions
        if !self.check_permissions(ctx, command).await? {
            self.respond_error(
                ctx,
                command,
                "You don't have permission to use this command.",
            )
            .await?;
            return Ok(());
        }

        let guild_id = match command.guild_id {
            Some(id) => id.get(),
            None => {
                return self
                    .respond_error(ctx, command, "This command must be used in a server.")
                    .await;
            }
        };

        // Get the subcommand
        let subcommand = command
            .data
            .options
            .first()
            .map(|o| o.name.as_str())
            .unwrap_or("status");

        let result = match subcommand {
            "status" => self.handle_status(ctx, command, guild_id).await,
            "enable" => self.handle_enable(ctx, command, guild_id, true).await,
            "disable" => self.handle_enable(ctx, command, guild_id, false).await,
            "threshold" => self.handle_threshold(ctx, command, guild_id).await,
            "interval" => self.handle_interval(ctx, command, guild_id).await,
            "action" => self.handle_action(ctx, command, guild_id).await,
            "timeout" => self.handle_timeout(ctx, command, guild_id).await,
            "quarantine" => self.handle_quarantine(ctx, command, guild_id).await,
            "logchannel" => self.handle_log_channel(ctx, command, guild_id).await,
            "revokeinvites" => self.handle_revoke_invites(ctx, command, guild_id).await,
            "whitelist" => self.handle_whitelist(ctx, command, guild_id).await,
            "reset" => self.handle_reset(ctx, command, guild_id).await,
            _ => {
                self.respond_error(ctx, command, "Unknown subcommand.")
                    .await
            }
        };

        match result {
            Ok(()) => Ok(()),
            // Surface validation failures to the admin instead of the logs
            Err(GatewardenError::Validation(message)) => {
                self.respond_error(ctx, command, &message).await
            }
            Err(e) => {
                // Give the admin a sanitized reply, then let the caller log
                self.respond_error(ctx, command, e.user_message()).await?;
                Err(e)
            }
        }
    }

    /// Check if the user has permission to use admin commands.
    async fn check_permissions(
        &self,
        _ctx: &Context,
        command: &CommandInteraction,
    ) -> Result<bool> {
        let Some(member) = &command.member else {
            return Ok(false);
        };

        let permissions = member.permissions.unwrap_or(Permissions::empty());

        Ok(permissions.administrator())
    }

    /// Options nested under the invoked subcommand.
    fn subcommand_options(command: &CommandInteraction) -> &[CommandDataOption] {
        command
            .data
            .options
            .first()
            .and_then(|o| match &o.value {
                CommandDataOptionValue::SubCommand(opts) => Some(opts.as_slice()),
                _ => None,
            })
            .unwrap_or(&[])
    }

    fn integer_option(command: &CommandInteraction, name: &str) -> Option<i64> {
        Self::subcommand_options(command)
            .iter()
            .find(|o| o.name == name)
            .and_then(|o| o.value.as_i64())
    }

    fn string_option<'a>(command: &'a CommandInteraction, name: &str) -> Option<&'a str> {
        Self::subcommand_options(command)
            .iter()
            .find(|o| o.name == name)
            .and_then(|o| o.value.as_str())
    }

    /// Handle /antiraid status.
    async fn handle_status(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let settings = self.settings.load(guild_id).await?;

        let whitelist = if settings.whitelist_roles.is_empty() {
            "None".to_string()
        } else {
            settings
                .whitelist_roles
                .iter()
                .map(|r| format!("<@&{}>", r))
                .collect::<Vec<_>>()
                .join(", ")
        };

        let response = format!(
            "🛡️ **Anti-Raid Configuration**\n\
             • Protection: {}\n\
             • Lockdown: {}\n\
             • Threshold: {} joins\n\
             • Window: {}s\n\
             • Action: {}\n\
             • Timeout Duration: {}\n\
             • Quarantine Role: {}\n\
             • Log Channel: {}\n\
             • Revoke Invites: {}\n\
             • Whitelisted Roles: {}",
            if settings.enabled {
                "✅ Enabled"
            } else {
                "❌ Disabled"
            },
            if settings.lockdown_active {
                "🚨 Active"
            } else {
                "Normal"
            },
            settings.threshold,
            settings.interval_secs,
            settings.action.as_str(),
            settings
                .timeout_secs
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "Not set".to_string()),
            settings
                .quarantine_role_id
                .map(|id| format!("<@&{}>", id))
                .unwrap_or_else(|| "Not set".to_string()),
            settings
                .log_channel_id
                .map(|id| format!("<#{}>", id))
                .unwrap_or_else(|| "Not set".to_string()),
            if settings.revoke_invites_on_lockdown {
                "Yes"
            } else {
                "No"
            },
            whitelist,
        );

        self.respond_message(ctx, command, &response).await
    }

    /// Handle /antiraid enable and /antiraid disable.
    async fn handle_enable(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
        enabled: bool,
    ) -> Result<()> {
        self.settings.set_enabled(guild_id, enabled).await?;
        self.engine.invalidate_settings(guild_id).await;

        let message = if enabled {
            "✅ Anti-raid protection enabled. Joins are now being tracked."
        } else {
            "✅ Anti-raid protection disabled. Joins are no longer tracked."
        };
        self.respond_message(ctx, command, message).await
    }

    /// Handle /antiraid threshold.
    async fn handle_threshold(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let Some(count) = Self::integer_option(command, "count").filter(|c| *c > 0) else {
            return self
                .respond_error(ctx, command, "Provide a join count of at least 1.")
                .await;
        };

        self.settings.set_threshold(guild_id, count as u32).await?;
        self.engine.invalidate_settings(guild_id).await;

        self.respond_message(
            ctx,
            command,
            &format!("✅ Lockdown now triggers at **{}** joins in the window.", count),
        )
        .await
    }

    /// Handle /antiraid interval.
    async fn handle_interval(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let Some(seconds) = Self::integer_option(command, "seconds").filter(|s| *s > 0) else {
            return self
                .respond_error(ctx, command, "Provide a window length of at least 1 second.")
                .await;
        };

        self.settings
            .set_interval_secs(guild_id, seconds as u64)
            .await?;
        self.engine.invalidate_settings(guild_id).await;

        self.respond_message(
            ctx,
            command,
            &format!("✅ Join window set to **{}s**.", seconds),
        )
        .await
    }

    /// Handle /antiraid action.
    async fn handle_action(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let Some(action) = Self::string_option(command, "action") else {
            return self.respond_error(ctx, command, "Provide an action.").await;
        };

        self.settings.set_action(guild_id, action).await?;
        self.engine.invalidate_settings(guild_id).await;

        self.respond_message(
            ctx,
            command,
            &format!("✅ Raid action set to **{}**.", action),
        )
        .await
    }

    /// Handle /antiraid timeout.
    async fn handle_timeout(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let Some(seconds) = Self::integer_option(command, "seconds").filter(|s| *s > 0) else {
            return self
                .respond_error(ctx, command, "Provide a duration of at least 1 second.")
                .await;
        };

        self.settings
            .set_timeout_secs(guild_id, seconds as u64)
            .await?;
        self.engine.invalidate_settings(guild_id).await;

        self.respond_message(
            ctx,
            command,
            &format!("✅ Timeout duration set to **{}s**.", seconds),
        )
        .await
    }

    /// Handle /antiraid quarantine.
    async fn handle_quarantine(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let role_id = Self::subcommand_options(command)
            .iter()
            .find(|o| o.name == "role")
            .and_then(|o| o.value.as_role_id());

        let Some(role_id) = role_id else {
            return self.respond_error(ctx, command, "Provide a role.").await;
        };

        self.settings
            .set_quarantine_role(guild_id, role_id.get())
            .await?;
        self.engine.invalidate_settings(guild_id).await;

        self.respond_message(
            ctx,
            command,
            &format!("✅ Quarantine role set to <@&{}>.", role_id.get()),
        )
        .await
    }

    /// Handle /antiraid logchannel.
    async fn handle_log_channel(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let channel_id = Self::subcommand_options(command)
            .iter()
            .find(|o| o.name == "channel")
            .and_then(|o| o.value.as_channel_id());

        let Some(channel_id) = channel_id else {
            return self.respond_error(ctx, command, "Provide a channel.").await;
        };

        self.settings
            .set_log_channel(guild_id, channel_id.get())
            .await?;
        self.engine.invalidate_settings(guild_id).await;

        self.respond_message(
            ctx,
            command,
            &format!("✅ Lockdown summaries will be posted in <#{}>.", channel_id.get()),
        )
        .await
    }

    /// Handle /antiraid revokeinvites.
    async fn handle_revoke_invites(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let revoke = Self::subcommand_options(command)
            .iter()
            .find(|o| o.name == "enabled")
            .and_then(|o| o.value.as_bool())
            .unwrap_or(false);

        self.settings.set_revoke_invites(guild_id, revoke).await?;
        self.engine.invalidate_settings(guild_id).await;

        let message = if revoke {
            "✅ All active invites will be revoked when lockdown engages."
        } else {
            "✅ Invites will be left alone during lockdown."
        };
        self.respond_message(ctx, command, message).await
    }

    /// Handle /antiraid whitelist.
    async fn handle_whitelist(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        let role_id = Self::subcommand_options(command)
            .iter()
            .find(|o| o.name == "role")
            .and_then(|o| o.value.as_role_id());

        let Some(role_id) = role_id else {
            return self.respond_error(ctx, command, "Provide a role.").await;
        };

        match Self::string_option(command, "mode") {
            Some("add") => {
                self.settings.whitelist_add(guild_id, role_id.get()).await?;
                self.engine.invalidate_settings(guild_id).await;
                self.respond_message(
                    ctx,
                    command,
                    &format!("✅ <@&{}> is now exempt from raid actions.", role_id.get()),
                )
                .await
            }
            Some("remove") => {
                self.settings
                    .whitelist_remove(guild_id, role_id.get())
                    .await?;
                self.engine.invalidate_settings(guild_id).await;
                self.respond_message(
                    ctx,
                    command,
                    &format!("✅ <@&{}> removed from the whitelist.", role_id.get()),
                )
                .await
            }
            _ => {
                self.respond_error(ctx, command, "Mode must be 'add' or 'remove'.")
                    .await
            }
        }
    }

    /// Handle /antiraid reset.
    async fn handle_reset(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        guild_id: u64,
    ) -> Result<()> {
        self.engine.reset(guild_id).await?;

        self.respond_message(
            ctx,
            command,
            "✅ Lockdown ended. Tracked joins cleared; the counter starts fresh.",
        )
        .await
    }

    /// Send a response message.
    async fn respond_message(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        content: &str,
    ) -> Result<()> {
        let response = CreateInteractionResponse::Message(
            CreateInteractionResponseMessage::new()
                .content(content)
                .ephemeral(true),
        );

        match command.create_response(&ctx.http, response).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Discord may timeout or another instance may respond first
                if e.to_string().contains("already been acknowledged") {
                    Ok(())
                } else {
                    Err(GatewardenError::DiscordApi(Box::new(e)))
                }
            }
        }
    }

    /// Send an error response.
    async fn respond_error(
        &self,
        ctx: &Context,
        command: &CommandInteraction,
        message: &str,
    ) -> Result<()> {
        self.respond_message(ctx, command, &format!("❌ {}", message))
            .await
    }
}
