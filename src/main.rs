//! Gatewarden entry point.
//!
//! Wires the anti-raid engine to the Discord gateway: member-join events
//! feed the join tracker, slash command interactions drive configuration
//! and the manual lockdown reset.

use std::sync::Arc;

use serenity::model::application::Interaction;
use serenity::model::gateway::Ready;
use serenity::model::guild::Member;
use serenity::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatewarden::commands::SlashCommandHandler;
use gatewarden::config::BotConfig;
use gatewarden::error::{GatewardenError, Result};
use gatewarden::lockdown::LockdownEngine;
use gatewarden::membership::DiscordHost;
use gatewarden::notify::DiscordNotifier;
use gatewarden::settings::SettingsStore;
use gatewarden::store::KvStore;

/// Shared application state for all handlers.
struct AppState {
    engine: Arc<LockdownEngine>,
    command_handler: Arc<SlashCommandHandler>,
}

/// Main event handler for the bot.
struct GatewardenHandler {
    state: Arc<AppState>,
}

impl GatewardenHandler {
    fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[serenity::async_trait]
impl EventHandler for GatewardenHandler {
    async fn guild_member_addition(&self, _ctx: Context, new_member: Member) {
        let guild_id = new_member.guild_id.get();
        let user_id = new_member.user.id.get();

        // Joining bots count like any other member
        self.state.engine.handle_join(guild_id, user_id).await;
    }

    async fn interaction_create(&self, ctx: Context, interaction: Interaction) {
        if let Interaction::Command(command) = interaction {
            if let Err(e) = self
                .state
                .command_handler
                .handle_command(&ctx, &command)
                .await
            {
                tracing::error!(error = %e, "Failed to handle slash command");
            }
        }
    }

    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(user = %ready.user.name, "Gatewarden connected");

        // Register slash commands globally
        let commands = SlashCommandHandler::register_commands();
        if let Err(e) = serenity::all::Command::set_global_commands(&ctx.http, commands).await {
            tracing::error!(error = %e, "Failed to register slash commands");
        } else {
            tracing::info!("Slash commands registered");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    // Initialize tracing with configurable log levels
    // Supports RUST_LOG environment variable with levels: trace, debug, info, warn, error
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        build = option_env!("BUILD_TIMESTAMP").unwrap_or("unknown"),
        "Gatewarden starting..."
    );

    // Load configuration
    let config = BotConfig::from_env()?;
    tracing::info!("Configuration loaded");

    // Initialize storage
    let store = KvStore::open(&config.database_path).await?;
    store.health_check().await?;
    tracing::info!(path = %config.database_path, "Store initialized");

    let settings = Arc::new(SettingsStore::new(store));

    // Build Discord-facing collaborators
    let http = Arc::new(serenity::http::Http::new(&config.discord_token));
    let host = Arc::new(DiscordHost::new(http.clone()));
    let notifier = Arc::new(DiscordNotifier::new(http.clone()));

    // Build the anti-raid engine
    let engine = Arc::new(LockdownEngine::new(settings.clone(), host, notifier));
    tracing::info!("Anti-raid engine initialized");

    // Build slash command handler
    let command_handler = Arc::new(SlashCommandHandler::new(settings.clone(), engine.clone()));
    tracing::info!("Slash command handler initialized");

    let state = Arc::new(AppState {
        engine,
        command_handler,
    });

    let handler = GatewardenHandler::new(state);

    // Join events require the privileged GUILD_MEMBERS intent
    let intents = GatewayIntents::GUILDS | GatewayIntents::GUILD_MEMBERS;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .await
        .map_err(|e| GatewardenError::DiscordApi(Box::new(e)))?;

    tracing::info!("Starting Discord client...");

    client
        .start()
        .await
        .map_err(|e| GatewardenError::DiscordApi(Box::new(e)))?;

    Ok(())
}
