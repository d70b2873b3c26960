//! Conversation Orchestrator.
//!
//! Routes inbound messages to the lifecycle manager or the inference
//! collaborator, assembles model context, and applies results back to the
//! Session Registry. The general channel is stateless per message; private
//! instances carry persona, facts and bounded history.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::Config;
use crate::discord::format::channel_link;
use crate::discord::gateway::IncomingMessage;
use crate::discord::rest::{DiscordApi, ADMINISTRATOR, MANAGE_MESSAGES};
use crate::intent;
use crate::lifecycle::{InstanceManager, FAREWELL};
use crate::llm::{ChatMessage, OllamaClient, Role};
use crate::registry::{ChannelId, Session, SessionRegistry, UserId, MAX_INSTANCES_PER_USER};

/// Instruction appended to the persona in the general channel.
const GENERAL_ADDON: &str = " (Salon général : pas de mémoire, ton neutre.) \
     IMPORTANT: Ne promets jamais d'avoir créé un salon. \
     Si on demande un privé et que l'action n'a pas été reconnue par le code, \
     propose : « Dis : @Lycoris crée une instance privée ».";

/// Batch size for the purge loop.
const PURGE_BATCH: u8 = 50;

/// Build the stateless two-message exchange for the general channel.
pub fn build_general_messages(persona: &str, user_prompt: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(format!("{persona}{GENERAL_ADDON}")),
        ChatMessage::user(user_prompt),
    ]
}

/// Build the model context for a private instance:
/// persona (extended by active personality tags), optional facts block,
/// bounded history in order, then the new user turn.
pub fn build_instance_messages(
    session: &Session,
    facts: &[String],
    user_prompt: &str,
) -> Vec<ChatMessage> {
    let mut system = session.persona.clone();
    let fragments: Vec<&str> = session
        .tags
        .iter()
        .filter_map(|tag| Config::tag_fragment(tag))
        .collect();
    if !fragments.is_empty() {
        system.push_str("\nPersonnalité: ");
        system.push_str(&fragments.join(" "));
    }

    let mut messages = vec![ChatMessage::system(system)];
    if !facts.is_empty() {
        let block = facts
            .iter()
            .map(|f| format!("- {f}"))
            .collect::<Vec<_>>()
            .join("\n");
        messages.push(ChatMessage::system(format!(
            "Faits pour cette instance:\n{block}"
        )));
    }
    messages.extend(session.history.iter().cloned());
    messages.push(ChatMessage::user(user_prompt));
    messages
}

/// Filter a raw tag list down to the known vocabulary and build the
/// confirmation label ("aucun" when nothing survives).
fn apply_tag_filter(raw: Vec<String>) -> (Vec<String>, String) {
    let applied: Vec<String> = raw
        .into_iter()
        .filter(|t| Config::is_known_tag(t))
        .collect();
    let label = if applied.is_empty() {
        "aucun".to_string()
    } else {
        applied.join(", ")
    };
    (applied, label)
}

/// Strip the bot's own mention forms from a message body.
fn strip_mentions(content: &str, bot_id: UserId) -> String {
    content
        .replace(&format!("<@{bot_id}>"), "")
        .replace(&format!("<@!{bot_id}>"), "")
        .trim()
        .to_string()
}

/// Central event handler.
pub struct Bot {
    api: Arc<DiscordApi>,
    llm: Arc<OllamaClient>,
    manager: Arc<InstanceManager>,
    registry: Arc<Mutex<SessionRegistry>>,
    config: Config,
    bot_id: UserId,
    /// Per-session serialization: concurrent handlers for the same
    /// instance run one at a time.
    session_locks: Mutex<HashMap<ChannelId, Arc<Mutex<()>>>>,
}

impl Bot {
    pub fn new(
        api: Arc<DiscordApi>,
        llm: Arc<OllamaClient>,
        manager: Arc<InstanceManager>,
        registry: Arc<Mutex<SessionRegistry>>,
        config: Config,
        bot_id: UserId,
    ) -> Self {
        Self {
            api,
            llm,
            manager,
            registry,
            config,
            bot_id,
            session_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle an inbound message. Errors are reported by the caller as a
    /// generic inference-error message, never allowed to kill the process.
    pub async fn on_message(&self, msg: &IncomingMessage) -> anyhow::Result<()> {
        if msg.author_is_bot {
            return Ok(());
        }

        let tracked = self.registry.lock().await.is_tracked(msg.channel_id);
        if tracked {
            self.on_instance_message(msg).await;
            return Ok(());
        }

        if self.is_general_channel(msg.channel_id).await {
            self.on_general_message(msg).await?;
        }
        Ok(())
    }

    /// Last-resort user-facing report when a handler failed unexpectedly.
    pub async fn report_failure(&self, channel_id: ChannelId) {
        self.send_best_effort(channel_id, "Erreur IA : une erreur inattendue est survenue.")
            .await;
    }

    /// External channel deletion: drop state, release the session lock.
    pub async fn on_channel_delete(&self, channel_id: ChannelId) {
        self.manager.forget_channel(channel_id).await;
        self.session_locks.lock().await.remove(&channel_id);
    }

    async fn is_general_channel(&self, channel_id: ChannelId) -> bool {
        if let Some(general) = self.config.general_channel_id {
            return channel_id == general;
        }
        // No configured id: fall back on the conventional channel name.
        match self.api.get_channel(channel_id).await {
            Ok(channel) => {
                let name = channel.name().to_lowercase();
                name == "général" || name == "general"
            }
            Err(error) => {
                tracing::debug!(channel_id, %error, "channel lookup failed");
                false
            }
        }
    }

    // --- General channel -------------------------------------------------

    async fn on_general_message(&self, msg: &IncomingMessage) -> anyhow::Result<()> {
        // Only answer when mentioned.
        if !msg.mentions.contains(&self.bot_id) {
            return Ok(());
        }

        let clean = strip_mentions(&msg.content, self.bot_id);
        let norm = clean.to_lowercase();

        if intent::wants_purge(&norm) {
            self.purge_flow(msg).await;
            return Ok(());
        }

        if intent::wants_count(&norm) {
            let total = self.registry.lock().await.count_live_sessions();
            self.api
                .send_message(msg.channel_id, &format!("Instances actives: **{total}**."))
                .await?;
            return Ok(());
        }

        if intent::wants_instance(&norm) {
            self.create_flow(msg).await?;
            return Ok(());
        }

        // Neutral stateless answer.
        if let Err(error) = self.api.trigger_typing(msg.channel_id).await {
            tracing::debug!(%error, "typing indicator failed");
        }
        let messages = build_general_messages(&self.config.default_persona, &clean);
        let text = self.llm.reply(&messages).await;
        self.api.send_chunked(msg.channel_id, &text).await?;
        Ok(())
    }

    async fn create_flow(&self, msg: &IncomingMessage) -> anyhow::Result<()> {
        let Some(guild_id) = msg.guild_id else {
            return Ok(());
        };

        let owned = self
            .registry
            .lock()
            .await
            .sessions_of(msg.author_id)
            .len();
        if owned >= MAX_INSTANCES_PER_USER {
            self.api
                .send_message(
                    msg.channel_id,
                    &format!(
                        "Désolée <@{}>, tu as déjà 2 instances actives. \
                         Ferme-en une (dis 'au revoir' dans l’instance) avant d’en créer une autre.",
                        msg.author_id
                    ),
                )
                .await?;
            return Ok(());
        }

        let requester = self.api.guild_member(guild_id, msg.author_id).await?;
        let created = self.manager.create_instance(guild_id, &requester).await?;

        let Some(channel) = created else {
            self.api
                .send_message(msg.channel_id, "Je ne peux pas créer d’instance maintenant.")
                .await?;
            return Ok(());
        };

        let url = channel_link(guild_id, channel.id);
        match self.dm_user(msg.author_id, &format!("Instance ouverte : <#{}>\nLien direct : {url}", channel.id)).await {
            Ok(()) => {
                self.api
                    .send_message(
                        msg.channel_id,
                        &format!(
                            "<@{}> je t’ai envoyé le lien de notre salon privé en DM.",
                            msg.author_id
                        ),
                    )
                    .await?;
            }
            Err(error) => {
                tracing::debug!(%error, "DM refused, linking in channel");
                self.api
                    .send_message(
                        msg.channel_id,
                        &format!(
                            "<@{}> j’ai ouvert un salon privé pour nous. Lien direct : {url}",
                            msg.author_id
                        ),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn dm_user(&self, user_id: UserId, content: &str) -> anyhow::Result<()> {
        let dm = self.api.create_dm(user_id).await?;
        self.api.send_message(dm.id, content).await?;
        Ok(())
    }

    async fn purge_flow(&self, msg: &IncomingMessage) {
        let Some(guild_id) = msg.guild_id else {
            return;
        };

        // Requester must hold Manage Messages in this channel, overwrites
        // included, or Administrator.
        let allowed = match self.api.guild_member(guild_id, msg.author_id).await {
            Ok(member) => match self
                .api
                .member_channel_permissions(guild_id, msg.channel_id, &member)
                .await
            {
                Ok(perms) => perms & (MANAGE_MESSAGES | ADMINISTRATOR) != 0,
                Err(error) => {
                    tracing::warn!(%error, "permission lookup failed");
                    false
                }
            },
            Err(error) => {
                tracing::warn!(%error, "member lookup failed");
                false
            }
        };
        if !allowed {
            self.send_best_effort(
                msg.channel_id,
                "Je n'ai pas le droit de nettoyer ce salon (permission *Gérer les messages* requise)",
            )
            .await;
            return;
        }

        self.send_best_effort(msg.channel_id, "Nettoyage en cours...").await;

        match self.purge_channel(msg.channel_id).await {
            Ok(deleted) => {
                tracing::info!(channel_id = msg.channel_id, deleted, "purge finished");
                self.send_best_effort(msg.channel_id, "J'ai fini de nettoyer le salon").await;
            }
            Err(error) if error.is_permission_denied() => {
                self.send_best_effort(
                    msg.channel_id,
                    "Je n'ai pas la permission *Gérer les messages* ici",
                )
                .await;
            }
            Err(error) => {
                tracing::warn!(channel_id = msg.channel_id, %error, "purge failed");
                self.send_best_effort(msg.channel_id, "Le nettoyage a échoué.").await;
            }
        }
    }

    /// Delete non-pinned messages in batches until a pass deletes nothing.
    async fn purge_channel(&self, channel_id: ChannelId) -> crate::discord::DiscordResult<usize> {
        let mut deleted_total = 0;
        loop {
            let batch = self.api.channel_messages(channel_id, PURGE_BATCH, None).await?;
            let deletable: Vec<_> = batch.iter().filter(|m| !m.pinned).collect();
            if deletable.is_empty() {
                break;
            }
            for message in deletable {
                self.api.delete_message(channel_id, message.id).await?;
                deleted_total += 1;
            }
        }
        Ok(deleted_total)
    }

    // --- Instance channels -----------------------------------------------

    async fn on_instance_message(&self, msg: &IncomingMessage) {
        // Only the owner converses here.
        let owner = self.registry.lock().await.owner_of(msg.channel_id);
        if owner != Some(msg.author_id) {
            return;
        }

        // Goodbye matches anywhere in the raw message.
        if intent::wants_goodbye(&msg.content) {
            self.manager.close_instance(msg.channel_id, FAREWELL).await;
            self.session_locks.lock().await.remove(&msg.channel_id);
            return;
        }

        // Personality directive, mention-gated.
        if msg.mentions.contains(&self.bot_id) {
            if let Some(raw_tags) = intent::parse_tag_directive(&msg.content) {
                let (applied, label) = apply_tag_filter(raw_tags);
                self.registry
                    .lock()
                    .await
                    .set_tags(msg.channel_id, applied);
                self.send_best_effort(msg.channel_id, &format!("Tags appliqués: {label}.")).await;
                return;
            }
        }

        // Memory-backed chat, serialized per session.
        let lock = self.session_lock(msg.channel_id).await;
        let _guard = lock.lock().await;

        if let Err(error) = self.api.trigger_typing(msg.channel_id).await {
            tracing::debug!(%error, "typing indicator failed");
        }

        let prompt = msg.content.trim().to_string();
        let messages = {
            let registry = self.registry.lock().await;
            let Some(session) = registry.session(msg.channel_id) else {
                // Closed while we waited on the lock.
                return;
            };
            build_instance_messages(session, registry.recent_facts(msg.channel_id), &prompt)
        };

        let text = self.llm.reply(&messages).await;

        {
            let mut registry = self.registry.lock().await;
            registry.push_turn(msg.channel_id, Role::User, prompt);
            registry.push_turn(msg.channel_id, Role::Assistant, text.clone());
        }

        if let Err(error) = self.api.send_chunked(msg.channel_id, &text).await {
            tracing::warn!(channel_id = msg.channel_id, %error, "reply send failed");
        }
    }

    async fn session_lock(&self, channel_id: ChannelId) -> Arc<Mutex<()>> {
        self.session_locks
            .lock()
            .await
            .entry(channel_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn send_best_effort(&self, channel_id: ChannelId, content: &str) {
        if let Err(error) = self.api.send_message(channel_id, content).await {
            tracing::warn!(channel_id, %error, "message send failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use std::collections::VecDeque;

    fn session(persona: &str, tags: Vec<&str>, history: Vec<ChatMessage>) -> Session {
        Session {
            owner: Some(1),
            persona: persona.to_string(),
            tags: tags.into_iter().map(String::from).collect(),
            history: VecDeque::from(history),
            facts: Vec::new(),
        }
    }

    #[test]
    fn general_messages_are_stateless_pair() {
        let messages = build_general_messages("persona", "bonjour");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.starts_with("persona"));
        assert!(messages[0].content.contains("Ne promets jamais"));
        assert_eq!(messages[1].role, Role::User);
        assert_eq!(messages[1].content, "bonjour");
    }

    #[test]
    fn instance_messages_in_order() {
        let s = session(
            "persona",
            vec![],
            vec![
                ChatMessage::user("salut"),
                ChatMessage::assistant("bonjour !"),
            ],
        );
        let facts = vec!["aime le thé".to_string()];
        let messages = build_instance_messages(&s, &facts, "et ensuite ?");

        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "persona");
        assert!(messages[1].content.contains("- aime le thé"));
        assert_eq!(messages[2].content, "salut");
        assert_eq!(messages[3].content, "bonjour !");
        assert_eq!(messages[4].content, "et ensuite ?");
    }

    #[test]
    fn instance_messages_skip_empty_facts() {
        let s = session("persona", vec![], vec![]);
        let messages = build_instance_messages(&s, &[], "question");
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn tags_extend_the_system_prompt() {
        let s = session("persona", vec!["joyeuse", "sobre"], vec![]);
        let messages = build_instance_messages(&s, &[], "question");
        assert!(messages[0].content.contains("Personnalité:"));
        assert!(messages[0].content.contains("joyeux"));
        assert!(messages[0].content.contains("factuelle"));
    }

    #[test]
    fn unknown_tags_do_not_leak_into_prompt() {
        let s = session("persona", vec!["inconnue"], vec![]);
        let messages = build_instance_messages(&s, &[], "question");
        assert!(!messages[0].content.contains("Personnalité:"));
    }

    #[test]
    fn tag_directive_keeps_known_tags_only() {
        let raw = intent::parse_tag_directive("@Lycoris tags: joyeuse, inconnue").unwrap();
        let (applied, label) = apply_tag_filter(raw);
        assert_eq!(applied, vec!["joyeuse"]);
        assert_eq!(label, "joyeuse");
    }

    #[test]
    fn tag_directive_without_known_tags_reports_aucun() {
        let (applied, label) = apply_tag_filter(vec!["inconnue".into(), "grognon".into()]);
        assert!(applied.is_empty());
        assert_eq!(label, "aucun");
    }

    #[test]
    fn tag_directive_label_joins_applied_tags() {
        let (applied, label) = apply_tag_filter(vec!["sobre".into(), "curieuse".into()]);
        assert_eq!(applied, vec!["sobre", "curieuse"]);
        assert_eq!(label, "sobre, curieuse");
    }

    #[test]
    fn mention_stripping() {
        assert_eq!(strip_mentions("<@42> bonjour", 42), "bonjour");
        assert_eq!(strip_mentions("<@!42> salut <@42>", 42), "salut");
        assert_eq!(strip_mentions("sans mention", 42), "sans mention");
    }
}
