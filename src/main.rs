//! Lycoris - main entry point.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, Mutex};

use lycoris::discord::gateway::{DiscordGateway, GatewayEvent};
use lycoris::discord::rest::DiscordApi;
use lycoris::lifecycle::InstanceManager;
use lycoris::llm::OllamaClient;
use lycoris::logging::init_logging;
use lycoris::orchestrator::Bot;
use lycoris::registry::SessionRegistry;
use lycoris::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_logging(&config.log_level, &config.log_format);

    tracing::info!("Lycoris v{}", env!("CARGO_PKG_VERSION"));

    let api = Arc::new(DiscordApi::new(config.discord_token.clone()));
    let llm = Arc::new(OllamaClient::new(
        &config.ollama_url,
        config.ollama_model.clone(),
        config.temperature,
    ));

    // Token check doubles as bot-identity lookup.
    let me = api.current_user().await?;
    tracing::info!(bot_id = me.id, name = %me.username, "authenticated");

    let registry = Arc::new(Mutex::new(SessionRegistry::new(
        config.default_persona.clone(),
        config.histo_max,
    )));
    let manager = Arc::new(InstanceManager::new(
        api.clone(),
        registry.clone(),
        config.instance_category_name.clone(),
        me.id,
    ));
    let bot = Arc::new(Bot::new(
        api.clone(),
        llm.clone(),
        manager.clone(),
        registry.clone(),
        config.clone(),
        me.id,
    ));

    let gateway = DiscordGateway::new(config.discord_token.clone());
    let (tx, mut rx) = mpsc::channel::<GatewayEvent>(256);

    let gateway_api = api.clone();
    let gateway_task = tokio::spawn(async move {
        gateway.run_forever(&gateway_api, tx).await;
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
            event = rx.recv() => {
                let Some(event) = event else {
                    tracing::warn!("gateway stream closed");
                    break;
                };
                dispatch(event, &bot, &manager, &llm).await;
            }
        }
    }

    gateway_task.abort();
    Ok(())
}

/// Route one gateway event; message handling is spawned so a slow model
/// call never blocks the event stream.
async fn dispatch(
    event: GatewayEvent,
    bot: &Arc<Bot>,
    manager: &Arc<InstanceManager>,
    llm: &Arc<OllamaClient>,
) {
    match event {
        GatewayEvent::Ready { user } => {
            tracing::info!(bot_id = user.id, name = %user.username, "gateway ready");
            llm.healthcheck().await;
        }
        GatewayEvent::GuildCreate { guild_id, name } => {
            let manager = manager.clone();
            tokio::spawn(async move {
                match manager.rehydrate_guild(guild_id).await {
                    Ok(0) => {}
                    Ok(count) => {
                        tracing::info!(guild_id, guild = %name, count, "instances restored");
                    }
                    Err(error) => {
                        tracing::warn!(guild_id, %error, "rehydration failed");
                    }
                }
            });
        }
        GatewayEvent::MessageCreate(msg) => {
            let bot = bot.clone();
            tokio::spawn(async move {
                if let Err(error) = bot.on_message(&msg).await {
                    // Handler boundary: report, never crash the process.
                    tracing::error!(channel_id = msg.channel_id, %error, "message handler failed");
                    bot.report_failure(msg.channel_id).await;
                }
            });
        }
        GatewayEvent::ChannelDelete { channel_id } => {
            let bot = bot.clone();
            tokio::spawn(async move {
                bot.on_channel_delete(channel_id).await;
            });
        }
    }
}
