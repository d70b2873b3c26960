//! Session Lifecycle Manager.
//!
//! Creates, closes and rehydrates private instances against Discord. The
//! registry holds the in-memory truth; Discord holds the durable channel
//! topology. Rehydration reconciles the two after a restart, using a
//! best-effort owner-detection chain that never deletes a channel on its
//! own.

use std::sync::Arc;

use regex::Regex;
use std::sync::LazyLock;
use tokio::sync::Mutex;

use crate::discord::format::{slug_from_channel_name, slugify, CHANNEL_PREFIX};
use crate::discord::rest::{
    ChannelInfo, DiscordApi, GuildMember, OverwriteRequest, CHANNEL_CATEGORY, CHANNEL_TEXT,
    MANAGE_CHANNELS, OVERWRITE_MEMBER, OVERWRITE_ROLE, READ_MESSAGE_HISTORY, SEND_MESSAGES,
    VIEW_CHANNEL,
};
use crate::discord::DiscordResult;
use crate::registry::{ChannelId, SessionRegistry, UserId, MAX_INSTANCES_PER_USER};

/// Owner tag stamped into the channel topic.
static OWNER_TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\blyc-owner:(\d+)\b").unwrap());

/// How far back the rehydration history scan looks.
const HISTORY_LOOKBACK: u8 = 50;

/// Welcome message posted into a fresh instance.
const WELCOME: &str = "Cette instance est privée entre nous. \
     Tu peux me parler directement, pas besoin de mentions. \
     Dis **au revoir** pour fermer cette instance. \
     Tu peux aussi régler ma personnalité: `@Lycoris tags: joyeuse, sarcasme`.";

/// Default farewell when an instance closes.
pub const FAREWELL: &str = "Instance fermée. À bientôt !";

/// Lifecycle manager for private instances.
pub struct InstanceManager {
    api: Arc<DiscordApi>,
    registry: Arc<Mutex<SessionRegistry>>,
    category_name: String,
    bot_id: UserId,
}

impl InstanceManager {
    pub fn new(
        api: Arc<DiscordApi>,
        registry: Arc<Mutex<SessionRegistry>>,
        category_name: impl Into<String>,
        bot_id: UserId,
    ) -> Self {
        Self {
            api,
            registry,
            category_name: category_name.into(),
            bot_id,
        }
    }

    pub fn registry(&self) -> &Arc<Mutex<SessionRegistry>> {
        &self.registry
    }

    /// Resolve the dedicated instance category, creating it if missing.
    pub async fn get_or_create_category(&self, guild_id: u64) -> DiscordResult<ChannelId> {
        let channels = self.api.guild_channels(guild_id).await?;
        if let Some(category) = channels
            .iter()
            .find(|c| c.kind == CHANNEL_CATEGORY && c.name() == self.category_name)
        {
            return Ok(category.id);
        }
        let created = self.api.create_category(guild_id, &self.category_name).await?;
        tracing::info!(guild_id, category_id = created.id, "created instance category");
        Ok(created.id)
    }

    /// Create a private instance for `requester`.
    ///
    /// Returns `None` when the requester already owns the maximum number of
    /// instances. The cap is checked before any mutating call.
    pub async fn create_instance(
        &self,
        guild_id: u64,
        requester: &GuildMember,
    ) -> DiscordResult<Option<ChannelInfo>> {
        let owner_id = requester.user.id;
        {
            let registry = self.registry.lock().await;
            if registry.sessions_of(owner_id).len() >= MAX_INSTANCES_PER_USER {
                return Ok(None);
            }
        }

        let category_id = self.get_or_create_category(guild_id).await?;

        // Derive a readable channel name and de-duplicate inside the category.
        let base = {
            let slug = slugify(requester.display_name());
            if slug.is_empty() {
                "user".to_string()
            } else {
                slug
            }
        };
        let channels = self.api.guild_channels(guild_id).await?;
        let existing: Vec<&str> = channels
            .iter()
            .filter(|c| c.kind == CHANNEL_TEXT && c.parent_id == Some(category_id))
            .map(ChannelInfo::name)
            .collect();
        let mut name = format!("{CHANNEL_PREFIX}{base}");
        let mut suffix = 1;
        while existing.contains(&name.as_str()) {
            suffix += 1;
            name = format!("{CHANNEL_PREFIX}{base}-{suffix}");
        }

        // Everyone out, the owner and the bot in.
        let overwrites = [
            OverwriteRequest {
                id: guild_id, // @everyone
                kind: OVERWRITE_ROLE,
                allow: 0,
                deny: VIEW_CHANNEL,
            },
            OverwriteRequest {
                id: owner_id,
                kind: OVERWRITE_MEMBER,
                allow: VIEW_CHANNEL | SEND_MESSAGES | READ_MESSAGE_HISTORY,
                deny: 0,
            },
            OverwriteRequest {
                id: self.bot_id,
                kind: OVERWRITE_MEMBER,
                allow: VIEW_CHANNEL | SEND_MESSAGES | READ_MESSAGE_HISTORY | MANAGE_CHANNELS,
                deny: 0,
            },
        ];

        let channel = self
            .api
            .create_text_channel(guild_id, &name, category_id, &overwrites)
            .await?;

        // Best-effort owner tag; losing it only degrades future rehydration.
        if let Err(error) = self
            .api
            .set_channel_topic(channel.id, &format!("lyc-owner:{owner_id}"))
            .await
        {
            tracing::warn!(channel_id = channel.id, %error, "cannot stamp owner tag");
        }

        {
            let mut registry = self.registry.lock().await;
            registry.remove_session(channel.id);
            if let Err(error) = registry.set_owner(channel.id, owner_id) {
                tracing::error!(channel_id = channel.id, %error, "owner registration failed");
            }
        }

        if let Err(error) = self
            .api
            .send_message(channel.id, &format!("Bienvenue <@{owner_id}> ! {WELCOME}"))
            .await
        {
            tracing::warn!(channel_id = channel.id, %error, "welcome message failed");
        }

        tracing::info!(
            guild_id,
            channel_id = channel.id,
            owner_id,
            name = %name,
            "instance created"
        );
        Ok(Some(channel))
    }

    /// Close an instance: farewell, channel delete, registry cleanup.
    ///
    /// Cleanup runs whether or not the send and the delete succeed; the
    /// registry never keeps a reference to a channel we meant to delete.
    pub async fn close_instance(&self, channel_id: ChannelId, farewell: &str) {
        if let Err(error) = self.api.send_message(channel_id, farewell).await {
            tracing::warn!(channel_id, %error, "farewell message failed");
        }
        if let Err(error) = self.api.delete_channel(channel_id).await {
            tracing::warn!(channel_id, %error, "channel delete failed");
        }
        self.registry.lock().await.remove_session(channel_id);
        tracing::info!(channel_id, "instance closed");
    }

    /// Drop the registry state of a channel deleted outside the bot.
    pub async fn forget_channel(&self, channel_id: ChannelId) {
        let mut registry = self.registry.lock().await;
        if registry.is_tracked(channel_id) {
            registry.remove_session(channel_id);
            tracing::info!(channel_id, "instance deleted externally, state cleaned");
        }
    }

    /// Rebuild registry state for the instance channels of one guild.
    ///
    /// Idempotent: already-tracked channels are skipped. Channels whose
    /// owner cannot be resolved are left untracked with a warning; nothing
    /// is ever deleted because detection failed.
    pub async fn rehydrate_guild(&self, guild_id: u64) -> DiscordResult<usize> {
        let channels = self.api.guild_channels(guild_id).await?;
        let Some(category_id) = channels
            .iter()
            .find(|c| c.kind == CHANNEL_CATEGORY && c.name() == self.category_name)
            .map(|c| c.id)
        else {
            return Ok(0);
        };

        let mut restored = 0;
        for channel in channels.iter().filter(|c| {
            c.kind == CHANNEL_TEXT
                && c.parent_id == Some(category_id)
                && c.name().starts_with(CHANNEL_PREFIX)
        }) {
            if self.registry.lock().await.is_tracked(channel.id) {
                continue;
            }

            let Some(owner) = self.detect_owner(guild_id, channel).await else {
                tracing::warn!(
                    channel_id = channel.id,
                    name = %channel.name(),
                    topic = ?channel.topic,
                    "no owner found, channel left untracked"
                );
                continue;
            };

            // Repair the owner tag when it was missing or unparsable.
            let tagged = channel
                .topic
                .as_deref()
                .is_some_and(|t| OWNER_TAG_RE.is_match(t));
            if !tagged {
                if let Err(error) = self
                    .api
                    .set_channel_topic(channel.id, &format!("lyc-owner:{}", owner.user.id))
                    .await
                {
                    tracing::warn!(channel_id = channel.id, %error, "cannot repair owner tag");
                }
            }

            {
                let mut registry = self.registry.lock().await;
                if let Err(error) = registry.set_owner(channel.id, owner.user.id) {
                    tracing::error!(channel_id = channel.id, %error, "rehydration commit failed");
                    continue;
                }
            }
            restored += 1;
            tracing::info!(
                guild_id,
                channel_id = channel.id,
                owner_id = owner.user.id,
                name = %channel.name(),
                "instance rehydrated"
            );
        }

        Ok(restored)
    }

    /// Owner detection, tried in strict priority order; first match wins.
    async fn detect_owner(&self, guild_id: u64, channel: &ChannelInfo) -> Option<GuildMember> {
        // 1. Topic tag.
        if let Some(user_id) = owner_from_topic(channel.topic.as_deref()) {
            if let Some(member) = self.human_member(guild_id, user_id).await {
                return Some(member);
            }
        }

        // 2. Explicit member overwrites granting view.
        for user_id in viewer_overwrites(channel) {
            if user_id == self.bot_id {
                continue;
            }
            if let Some(member) = self.human_member(guild_id, user_id).await {
                return Some(member);
            }
        }

        // 3. Member list: first human who can see the channel.
        let members = self.guild_members(guild_id).await;
        for member in &members {
            if !member.user.bot && member_can_view(channel, member) {
                return Some(member.clone());
            }
        }

        // 4. Recent history, newest first: first human author.
        match self
            .api
            .channel_messages(channel.id, HISTORY_LOOKBACK, None)
            .await
        {
            Ok(messages) => {
                for message in &messages {
                    if message.author.bot {
                        continue;
                    }
                    if let Some(member) = self.human_member(guild_id, message.author.id).await {
                        return Some(member);
                    }
                }
            }
            Err(error) => {
                tracing::warn!(channel_id = channel.id, %error, "cannot read channel history");
            }
        }

        // 5. Channel-name slug against member display names.
        let slug = slug_from_channel_name(channel.name());
        if !slug.is_empty() {
            for member in &members {
                if !member.user.bot && slugify(member.display_name()) == slug {
                    return Some(member.clone());
                }
            }
        }

        None
    }

    /// Fetch a member and keep it only if it exists and is human.
    async fn human_member(&self, guild_id: u64, user_id: UserId) -> Option<GuildMember> {
        match self.api.guild_member(guild_id, user_id).await {
            Ok(member) if !member.user.bot => Some(member),
            Ok(_) => None,
            Err(error) => {
                if !error.is_not_found() {
                    tracing::warn!(guild_id, user_id, %error, "member lookup failed");
                }
                None
            }
        }
    }

    /// Full member list of a guild, paginated.
    async fn guild_members(&self, guild_id: u64) -> Vec<GuildMember> {
        let mut members = Vec::new();
        let mut after = 0;
        loop {
            match self.api.list_guild_members(guild_id, 1000, after).await {
                Ok(page) => {
                    if page.is_empty() {
                        break;
                    }
                    after = page.iter().map(|m| m.user.id).max().unwrap_or(after);
                    let full_page = page.len() == 1000;
                    members.extend(page);
                    if !full_page {
                        break;
                    }
                }
                Err(error) => {
                    tracing::warn!(guild_id, %error, "member list fetch failed");
                    break;
                }
            }
        }
        members
    }
}

/// Parse the owner tag out of a channel topic.
pub fn owner_from_topic(topic: Option<&str>) -> Option<UserId> {
    let topic = topic?;
    let caps = OWNER_TAG_RE.captures(topic)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Member ids with an explicit view-granting overwrite, in overwrite order.
pub fn viewer_overwrites(channel: &ChannelInfo) -> Vec<UserId> {
    channel
        .permission_overwrites
        .iter()
        .filter(|ow| ow.kind == OVERWRITE_MEMBER && ow.allow & VIEW_CHANNEL != 0)
        .map(|ow| ow.id)
        .collect()
}

/// Whether a member can see an instance channel, judged from its overwrites.
///
/// Instance channels deny `@everyone`, so visibility comes either from a
/// member overwrite or from a role overwrite on one of the member's roles.
pub fn member_can_view(channel: &ChannelInfo, member: &GuildMember) -> bool {
    channel.permission_overwrites.iter().any(|ow| {
        if ow.allow & VIEW_CHANNEL == 0 {
            return false;
        }
        match ow.kind {
            OVERWRITE_MEMBER => ow.id == member.user.id,
            OVERWRITE_ROLE => member.roles.contains(&ow.id),
            _ => false,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discord::rest::PermissionOverwrite;

    fn channel(topic: Option<&str>, overwrites: Vec<PermissionOverwrite>) -> ChannelInfo {
        serde_json::from_value(serde_json::json!({
            "id": "500",
            "type": 0,
            "name": "lycoris-marie",
            "topic": topic,
            "permission_overwrites": [],
        }))
        .map(|mut c: ChannelInfo| {
            c.permission_overwrites = overwrites;
            c
        })
        .unwrap()
    }

    fn member(id: u64, roles: Vec<u64>) -> GuildMember {
        serde_json::from_value(serde_json::json!({
            "user": { "id": id.to_string(), "username": "marie" },
            "roles": roles.iter().map(u64::to_string).collect::<Vec<_>>(),
        }))
        .unwrap()
    }

    fn overwrite(id: u64, kind: u8, allow: u64) -> PermissionOverwrite {
        serde_json::from_value(serde_json::json!({
            "id": id.to_string(),
            "type": kind,
            "allow": allow.to_string(),
            "deny": "0",
        }))
        .unwrap()
    }

    #[test]
    fn owner_tag_parses() {
        assert_eq!(owner_from_topic(Some("lyc-owner:12345")), Some(12345));
        assert_eq!(
            owner_from_topic(Some("notes | lyc-owner:42 | fin")),
            Some(42)
        );
        assert_eq!(owner_from_topic(Some("pas de tag")), None);
        assert_eq!(owner_from_topic(None), None);
    }

    #[test]
    fn viewer_overwrites_keeps_members_with_view() {
        let ch = channel(
            None,
            vec![
                overwrite(1, OVERWRITE_ROLE, VIEW_CHANNEL),
                overwrite(2, OVERWRITE_MEMBER, SEND_MESSAGES),
                overwrite(3, OVERWRITE_MEMBER, VIEW_CHANNEL | SEND_MESSAGES),
                overwrite(4, OVERWRITE_MEMBER, VIEW_CHANNEL),
            ],
        );
        assert_eq!(viewer_overwrites(&ch), vec![3, 4]);
    }

    #[test]
    fn member_view_through_member_overwrite() {
        let ch = channel(None, vec![overwrite(7, OVERWRITE_MEMBER, VIEW_CHANNEL)]);
        assert!(member_can_view(&ch, &member(7, vec![])));
        assert!(!member_can_view(&ch, &member(8, vec![])));
    }

    #[test]
    fn member_view_through_role_overwrite() {
        let ch = channel(None, vec![overwrite(99, OVERWRITE_ROLE, VIEW_CHANNEL)]);
        assert!(member_can_view(&ch, &member(7, vec![99])));
        assert!(!member_can_view(&ch, &member(7, vec![98])));
    }
}
