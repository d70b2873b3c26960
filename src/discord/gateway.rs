//! Discord Gateway WebSocket client.
//!
//! Connects, identifies with the capability intents the bot needs, keeps
//! the heartbeat alive and forwards the dispatch events the bot consumes
//! (READY, GUILD_CREATE, MESSAGE_CREATE, CHANNEL_DELETE) over an mpsc
//! channel. GUILD_CREATE doubles as the guild-available signal that
//! triggers per-guild rehydration.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::rest::{DiscordApi, User};
use super::{DiscordError, DiscordResult};

/// GUILDS | GUILD_MEMBERS | GUILD_MESSAGES | MESSAGE_CONTENT
const INTENTS: u64 = (1 << 0) | (1 << 1) | (1 << 9) | (1 << 15);

/// First reconnect delay after a dropped connection.
const RECONNECT_MIN: Duration = Duration::from_secs(2);
/// Reconnect delay ceiling.
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Events surfaced to the bot.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Session established; carries the bot identity.
    Ready { user: User },
    /// A guild became available (startup or later reconnection).
    GuildCreate { guild_id: u64, name: String },
    /// A message was posted somewhere the bot can see.
    MessageCreate(IncomingMessage),
    /// A channel was deleted, possibly by hand.
    ChannelDelete { channel_id: u64 },
}

/// The slice of a MESSAGE_CREATE payload the bot acts on.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: u64,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub author_id: u64,
    pub author_is_bot: bool,
    pub content: String,
    /// Ids of the users mentioned in the message.
    pub mentions: Vec<u64>,
}

/// Gateway connection driver.
pub struct DiscordGateway {
    token: String,
}

impl DiscordGateway {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Connect and pump events, reconnecting with capped backoff whenever
    /// the connection drops. Discord cycles gateway connections routinely,
    /// so a dropped websocket is normal operation. Each reconnect replays
    /// GUILD_CREATE per guild, which re-triggers rehydration downstream.
    ///
    /// Returns only once `tx` has no receiver left.
    pub async fn run_forever(&self, api: &DiscordApi, tx: mpsc::Sender<GatewayEvent>) {
        let mut backoff = RECONNECT_MIN;
        loop {
            if tx.is_closed() {
                return;
            }
            let connected_at = tokio::time::Instant::now();
            match self.run(api, tx.clone()).await {
                Ok(()) => tracing::info!("gateway connection ended"),
                Err(error) => tracing::warn!(%error, "gateway connection failed"),
            }
            if tx.is_closed() {
                return;
            }
            // A connection that held for a while resets the backoff.
            if connected_at.elapsed() >= RECONNECT_MAX {
                backoff = RECONNECT_MIN;
            }
            tracing::info!(delay_secs = backoff.as_secs(), "reconnecting to gateway");
            tokio::time::sleep(backoff).await;
            backoff = next_backoff(backoff);
        }
    }

    /// Connect and pump events into `tx` until the connection drops.
    pub async fn run(
        &self,
        api: &DiscordApi,
        tx: mpsc::Sender<GatewayEvent>,
    ) -> DiscordResult<()> {
        let gw_url = self.gateway_url(api).await;
        let ws_url = format!("{gw_url}/?v=10&encoding=json");
        tracing::info!("connecting to gateway");

        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| DiscordError::Connection(format!("websocket connect failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        // Hello (opcode 10) carries the heartbeat interval.
        let hello = read
            .next()
            .await
            .ok_or_else(|| DiscordError::Connection("no hello from gateway".into()))?
            .map_err(|e| DiscordError::Connection(format!("websocket error: {e}")))?;
        let hello_data: serde_json::Value = serde_json::from_str(&hello.to_string())
            .map_err(|e| DiscordError::Connection(format!("invalid hello: {e}")))?;
        let heartbeat_interval = hello_data
            .get("d")
            .and_then(|d| d.get("heartbeat_interval"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(41_250);

        // Identify (opcode 2) with a listening presence.
        let identify = json!({
            "op": 2,
            "d": {
                "token": self.token,
                "intents": INTENTS,
                "properties": {
                    "os": "linux",
                    "browser": "lycoris",
                    "device": "lycoris"
                },
                "presence": {
                    "activities": [{ "name": "@Lycoris", "type": 2 }],
                    "status": "online",
                    "since": null,
                    "afk": false
                }
            }
        });
        write
            .send(Message::Text(identify.to_string()))
            .await
            .map_err(|e| DiscordError::Connection(format!("identify failed: {e}")))?;

        tracing::info!("connected and identified");

        // Heartbeat ticker.
        let (hb_tx, mut hb_rx) = mpsc::channel::<()>(1);
        let hb_task = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_millis(heartbeat_interval));
            loop {
                interval.tick().await;
                if hb_tx.send(()).await.is_err() {
                    break;
                }
            }
        });

        let mut last_seq: Option<u64> = None;

        loop {
            tokio::select! {
                _ = hb_rx.recv() => {
                    let hb = json!({ "op": 1, "d": last_seq });
                    if write.send(Message::Text(hb.to_string())).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(t))) => t,
                        Some(Ok(Message::Close(frame))) => {
                            tracing::warn!(?frame, "gateway closed the connection");
                            break;
                        }
                        None => break,
                        _ => continue,
                    };

                    let event: serde_json::Value = match serde_json::from_str(&text) {
                        Ok(e) => e,
                        Err(_) => continue,
                    };

                    if let Some(seq) = event.get("s").and_then(serde_json::Value::as_u64) {
                        last_seq = Some(seq);
                    }

                    let Some(parsed) = parse_dispatch(&event) else {
                        continue;
                    };
                    if tx.send(parsed).await.is_err() {
                        break;
                    }
                }
            }
        }

        hb_task.abort();
        Ok(())
    }

    /// Resolve the gateway URL, falling back to the public endpoint.
    async fn gateway_url(&self, api: &DiscordApi) -> String {
        match api.gateway_url().await {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%error, "gateway URL lookup failed, using default");
                "wss://gateway.discord.gg".to_string()
            }
        }
    }
}

/// Double the reconnect delay up to the ceiling.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX)
}

fn parse_u64(value: Option<&serde_json::Value>) -> Option<u64> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Turn a raw gateway frame into a [`GatewayEvent`], when it is one of the
/// dispatch types the bot consumes.
fn parse_dispatch(event: &serde_json::Value) -> Option<GatewayEvent> {
    let event_type = event.get("t").and_then(|t| t.as_str())?;
    let d = event.get("d")?;

    match event_type {
        "READY" => {
            let user: User = serde_json::from_value(d.get("user")?.clone()).ok()?;
            Some(GatewayEvent::Ready { user })
        }
        "GUILD_CREATE" => Some(GatewayEvent::GuildCreate {
            guild_id: parse_u64(d.get("id"))?,
            name: d
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("")
                .to_string(),
        }),
        "CHANNEL_DELETE" => Some(GatewayEvent::ChannelDelete {
            channel_id: parse_u64(d.get("id"))?,
        }),
        "MESSAGE_CREATE" => {
            let author = d.get("author")?;
            let mentions = d
                .get("mentions")
                .and_then(|m| m.as_array())
                .map(|users| {
                    users
                        .iter()
                        .filter_map(|u| parse_u64(u.get("id")))
                        .collect()
                })
                .unwrap_or_default();

            Some(GatewayEvent::MessageCreate(IncomingMessage {
                id: parse_u64(d.get("id"))?,
                channel_id: parse_u64(d.get("channel_id"))?,
                guild_id: parse_u64(d.get("guild_id")),
                author_id: parse_u64(author.get("id"))?,
                author_is_bot: author
                    .get("bot")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
                content: d
                    .get("content")
                    .and_then(|c| c.as_str())
                    .unwrap_or("")
                    .to_string(),
                mentions,
            }))
        }
        _ => None,
    }
}
