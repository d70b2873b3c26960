//! Discord REST client.
//!
//! Thin typed layer over the v10 HTTP API: channel CRUD with permission
//! overwrites, message send/list/delete, member and role lookups. The base
//! URL is injectable so tests can point it at a local mock server.

use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::format::{split_chunks, MAX_MESSAGE_LENGTH};
use super::{DiscordError, DiscordResult};

/// Production API base.
pub const API_BASE: &str = "https://discord.com/api/v10";

// Permission bits (subset this bot cares about).
pub const ADMINISTRATOR: u64 = 1 << 3;
pub const MANAGE_CHANNELS: u64 = 1 << 4;
pub const VIEW_CHANNEL: u64 = 1 << 10;
pub const SEND_MESSAGES: u64 = 1 << 11;
pub const MANAGE_MESSAGES: u64 = 1 << 13;
pub const READ_MESSAGE_HISTORY: u64 = 1 << 16;

// Channel kinds.
pub const CHANNEL_TEXT: u8 = 0;
pub const CHANNEL_CATEGORY: u8 = 4;

// Permission overwrite target kinds.
pub const OVERWRITE_ROLE: u8 = 0;
pub const OVERWRITE_MEMBER: u8 = 1;

/// Discord encodes snowflakes and permission bitsets as JSON strings.
mod snowflake {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }

    fn parse<E: serde::de::Error>(raw: Raw) -> Result<u64, E> {
        match raw {
            Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Num(n) => Ok(n),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        parse(Raw::deserialize(d)?)
    }

    pub mod option {
        use super::{parse, Raw};
        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
            match Option::<Raw>::deserialize(d)? {
                Some(raw) => parse(raw).map(Some),
                None => Ok(None),
            }
        }
    }

    pub mod list {
        use super::{parse, Raw};
        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u64>, D::Error> {
            Vec::<Raw>::deserialize(d)?.into_iter().map(parse).collect()
        }
    }
}

/// A Discord user.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub global_name: Option<String>,
    #[serde(default)]
    pub bot: bool,
}

/// A guild member.
#[derive(Debug, Clone, Deserialize)]
pub struct GuildMember {
    pub user: User,
    #[serde(default)]
    pub nick: Option<String>,
    #[serde(default, with = "snowflake::list")]
    pub roles: Vec<u64>,
}

impl GuildMember {
    /// Display name: nickname, then global name, then username.
    pub fn display_name(&self) -> &str {
        self.nick
            .as_deref()
            .or(self.user.global_name.as_deref())
            .unwrap_or(&self.user.username)
    }
}

/// A permission overwrite on a channel.
#[derive(Debug, Clone, Deserialize)]
pub struct PermissionOverwrite {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(with = "snowflake")]
    pub allow: u64,
    #[serde(with = "snowflake")]
    pub deny: u64,
}

/// A guild channel as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelInfo {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, with = "snowflake::option")]
    pub parent_id: Option<u64>,
    #[serde(default, with = "snowflake::option")]
    pub guild_id: Option<u64>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub permission_overwrites: Vec<PermissionOverwrite>,
}

impl ChannelInfo {
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }
}

/// A message as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageInfo {
    #[serde(with = "snowflake")]
    pub id: u64,
    pub author: User,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub pinned: bool,
}

/// A guild role (only the permission bitset matters here).
#[derive(Debug, Clone, Deserialize)]
pub struct Role {
    #[serde(with = "snowflake")]
    pub id: u64,
    #[serde(with = "snowflake")]
    pub permissions: u64,
}

/// A permission overwrite to apply at channel creation.
#[derive(Debug, Clone)]
pub struct OverwriteRequest {
    pub id: u64,
    pub kind: u8,
    pub allow: u64,
    pub deny: u64,
}

impl OverwriteRequest {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.id.to_string(),
            "type": self.kind,
            "allow": self.allow.to_string(),
            "deny": self.deny.to_string(),
        })
    }
}

/// Typed REST client.
pub struct DiscordApi {
    api_base: String,
    token: String,
    client: Client,
}

impl DiscordApi {
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_base(API_BASE, token)
    }

    /// Build against an alternative API base (tests).
    pub fn with_base(api_base: &str, token: impl Into<String>) -> Self {
        Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.into(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    async fn check(response: reqwest::Response) -> DiscordResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(DiscordError::Api {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// The websocket URL to connect the gateway to.
    pub async fn gateway_url(&self) -> DiscordResult<String> {
        let resp = self
            .client
            .get(self.url("/gateway/bot"))
            .header("Authorization", self.auth())
            .send()
            .await?;
        let data: serde_json::Value = Self::check(resp).await?.json().await?;
        data.get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string)
            .ok_or_else(|| DiscordError::InvalidPayload("gateway response has no url".into()))
    }

    /// The bot's own user, also serving as a token check.
    pub async fn current_user(&self) -> DiscordResult<User> {
        let resp = self
            .client
            .get(self.url("/users/@me"))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Fetch one channel.
    pub async fn get_channel(&self, channel_id: u64) -> DiscordResult<ChannelInfo> {
        let resp = self
            .client
            .get(self.url(&format!("/channels/{channel_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// All channels of a guild, categories included.
    pub async fn guild_channels(&self, guild_id: u64) -> DiscordResult<Vec<ChannelInfo>> {
        let resp = self
            .client
            .get(self.url(&format!("/guilds/{guild_id}/channels")))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Create a category channel.
    pub async fn create_category(&self, guild_id: u64, name: &str) -> DiscordResult<ChannelInfo> {
        let body = json!({ "name": name, "type": CHANNEL_CATEGORY });
        let resp = self
            .client
            .post(self.url(&format!("/guilds/{guild_id}/channels")))
            .header("Authorization", self.auth())
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Create a text channel under a category with permission overwrites.
    pub async fn create_text_channel(
        &self,
        guild_id: u64,
        name: &str,
        parent_id: u64,
        overwrites: &[OverwriteRequest],
    ) -> DiscordResult<ChannelInfo> {
        let body = json!({
            "name": name,
            "type": CHANNEL_TEXT,
            "parent_id": parent_id.to_string(),
            "permission_overwrites": overwrites.iter().map(OverwriteRequest::to_json).collect::<Vec<_>>(),
        });
        let resp = self
            .client
            .post(self.url(&format!("/guilds/{guild_id}/channels")))
            .header("Authorization", self.auth())
            .json(&body)
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Set a channel's topic.
    pub async fn set_channel_topic(&self, channel_id: u64, topic: &str) -> DiscordResult<()> {
        let resp = self
            .client
            .patch(self.url(&format!("/channels/{channel_id}")))
            .header("Authorization", self.auth())
            .json(&json!({ "topic": topic }))
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Delete a channel.
    pub async fn delete_channel(&self, channel_id: u64) -> DiscordResult<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/channels/{channel_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Send a single message.
    pub async fn send_message(&self, channel_id: u64, content: &str) -> DiscordResult<MessageInfo> {
        let resp = self
            .client
            .post(self.url(&format!("/channels/{channel_id}/messages")))
            .header("Authorization", self.auth())
            .json(&json!({ "content": content }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Send text of any length, chunked to the per-message size limit,
    /// in order.
    pub async fn send_chunked(&self, channel_id: u64, content: &str) -> DiscordResult<()> {
        for chunk in split_chunks(content, MAX_MESSAGE_LENGTH) {
            self.send_message(channel_id, &chunk).await?;
        }
        Ok(())
    }

    /// Open (or reuse) a DM channel with a user.
    pub async fn create_dm(&self, user_id: u64) -> DiscordResult<ChannelInfo> {
        let resp = self
            .client
            .post(self.url("/users/@me/channels"))
            .header("Authorization", self.auth())
            .json(&json!({ "recipient_id": user_id.to_string() }))
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Recent messages, newest first. `before` pages further back.
    pub async fn channel_messages(
        &self,
        channel_id: u64,
        limit: u8,
        before: Option<u64>,
    ) -> DiscordResult<Vec<MessageInfo>> {
        let mut url = self.url(&format!("/channels/{channel_id}/messages?limit={limit}"));
        if let Some(before) = before {
            url.push_str(&format!("&before={before}"));
        }
        let resp = self
            .client
            .get(url)
            .header("Authorization", self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Delete one message.
    pub async fn delete_message(&self, channel_id: u64, message_id: u64) -> DiscordResult<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/channels/{channel_id}/messages/{message_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Show the typing indicator while a reply is being computed.
    pub async fn trigger_typing(&self, channel_id: u64) -> DiscordResult<()> {
        let resp = self
            .client
            .post(self.url(&format!("/channels/{channel_id}/typing")))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Self::check(resp).await?;
        Ok(())
    }

    /// Fetch one guild member.
    pub async fn guild_member(&self, guild_id: u64, user_id: u64) -> DiscordResult<GuildMember> {
        let resp = self
            .client
            .get(self.url(&format!("/guilds/{guild_id}/members/{user_id}")))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// List guild members (paginated by `after`).
    pub async fn list_guild_members(
        &self,
        guild_id: u64,
        limit: u16,
        after: u64,
    ) -> DiscordResult<Vec<GuildMember>> {
        let resp = self
            .client
            .get(self.url(&format!(
                "/guilds/{guild_id}/members?limit={limit}&after={after}"
            )))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// All roles of a guild.
    pub async fn guild_roles(&self, guild_id: u64) -> DiscordResult<Vec<Role>> {
        let resp = self
            .client
            .get(self.url(&format!("/guilds/{guild_id}/roles")))
            .header("Authorization", self.auth())
            .send()
            .await?;
        Ok(Self::check(resp).await?.json().await?)
    }

    /// Effective guild-level permissions of a member (role union).
    pub async fn member_permissions(
        &self,
        guild_id: u64,
        member: &GuildMember,
    ) -> DiscordResult<u64> {
        let roles = self.guild_roles(guild_id).await?;
        let mut permissions = 0u64;
        for role in &roles {
            // @everyone carries the guild id; every member has it.
            if role.id == guild_id || member.roles.contains(&role.id) {
                permissions |= role.permissions;
            }
        }
        Ok(permissions)
    }

    /// Effective permissions of a member inside one channel, overwrites
    /// included.
    pub async fn member_channel_permissions(
        &self,
        guild_id: u64,
        channel_id: u64,
        member: &GuildMember,
    ) -> DiscordResult<u64> {
        let base = self.member_permissions(guild_id, member).await?;
        let channel = self.get_channel(channel_id).await?;
        Ok(channel_permissions(base, guild_id, &channel, member))
    }
}

/// Apply a channel's permission overwrites to a member's base permissions.
///
/// Discord's resolution order: administrators bypass overwrites, then the
/// `@everyone` overwrite, then the union of the member's role overwrites,
/// then the member overwrite.
pub fn channel_permissions(
    base: u64,
    guild_id: u64,
    channel: &ChannelInfo,
    member: &GuildMember,
) -> u64 {
    if base & ADMINISTRATOR != 0 {
        return u64::MAX;
    }
    let mut perms = base;

    for ow in &channel.permission_overwrites {
        if ow.kind == OVERWRITE_ROLE && ow.id == guild_id {
            perms = (perms & !ow.deny) | ow.allow;
        }
    }

    let (mut allow, mut deny) = (0u64, 0u64);
    for ow in &channel.permission_overwrites {
        if ow.kind == OVERWRITE_ROLE && ow.id != guild_id && member.roles.contains(&ow.id) {
            allow |= ow.allow;
            deny |= ow.deny;
        }
    }
    perms = (perms & !deny) | allow;

    for ow in &channel.permission_overwrites {
        if ow.kind == OVERWRITE_MEMBER && ow.id == member.user.id {
            perms = (perms & !ow.deny) | ow.allow;
        }
    }
    perms
}
