//! Session Registry: the owning in-memory state of the bot.
//!
//! Pure key-value store, no I/O. Holds per-instance conversation history,
//! long-term facts, persona text and personality tags, plus the
//! bidirectional owner index. Every mutating operation leaves the session
//! map and the owner index in agreement; partial cleanup is a bug, not a
//! state this type can express after a method returns.

use std::collections::{HashMap, VecDeque};

use crate::llm::{ChatMessage, Role};

/// Discord channel snowflake.
pub type ChannelId = u64;
/// Discord user snowflake.
pub type UserId = u64;

/// Hard cap on live instances per owner.
pub const MAX_INSTANCES_PER_USER: usize = 2;

/// Number of most recent facts surfaced to the model.
pub const FACTS_SURFACED: usize = 10;

/// Registry error type.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session {session} is already owned by {current}, refusing {attempted}")]
    OwnerMismatch {
        session: ChannelId,
        current: UserId,
        attempted: UserId,
    },
}

/// One private conversation instance.
#[derive(Debug, Clone)]
pub struct Session {
    /// Single user permitted to converse here. Set exactly once.
    pub owner: Option<UserId>,
    /// System prompt for this instance.
    pub persona: String,
    /// Active personality tags, replaced wholesale on each directive.
    pub tags: Vec<String>,
    /// Bounded conversation turns, oldest evicted first.
    pub history: VecDeque<ChatMessage>,
    /// Free-text facts. Unbounded; only the tail is surfaced.
    pub facts: Vec<String>,
}

impl Session {
    fn new(persona: &str) -> Self {
        Self {
            owner: None,
            persona: persona.to_string(),
            tags: Vec::new(),
            history: VecDeque::new(),
            facts: Vec::new(),
        }
    }
}

/// In-memory session store with a bidirectional owner index.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: HashMap<ChannelId, Session>,
    owners: HashMap<UserId, Vec<ChannelId>>,
    default_persona: String,
    histo_max: usize,
}

impl SessionRegistry {
    pub fn new(default_persona: impl Into<String>, histo_max: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            owners: HashMap::new(),
            default_persona: default_persona.into(),
            histo_max,
        }
    }

    /// Whether a session exists for this channel.
    pub fn is_tracked(&self, channel: ChannelId) -> bool {
        self.sessions.contains_key(&channel)
    }

    /// Read access to a session, if tracked.
    pub fn session(&self, channel: ChannelId) -> Option<&Session> {
        self.sessions.get(&channel)
    }

    /// Mutable access, creating a default session on first access
    /// (empty history, empty facts, default persona, empty tags, no owner).
    pub fn session_mut(&mut self, channel: ChannelId) -> &mut Session {
        let persona = &self.default_persona;
        self.sessions
            .entry(channel)
            .or_insert_with(|| Session::new(persona))
    }

    /// Owner of a session, if tracked and set.
    pub fn owner_of(&self, channel: ChannelId) -> Option<UserId> {
        self.sessions.get(&channel).and_then(|s| s.owner)
    }

    /// Channels currently owned by a user.
    pub fn sessions_of(&self, owner: UserId) -> &[ChannelId] {
        self.owners.get(&owner).map_or(&[], Vec::as_slice)
    }

    /// Bind a session to its owner.
    ///
    /// Fails only if the session already has a different owner. Setting the
    /// same owner again is a no-op so that rehydration stays idempotent.
    pub fn set_owner(&mut self, channel: ChannelId, owner: UserId) -> Result<(), RegistryError> {
        let session = self.session_mut(channel);
        match session.owner {
            Some(current) if current != owner => Err(RegistryError::OwnerMismatch {
                session: channel,
                current,
                attempted: owner,
            }),
            Some(_) => Ok(()),
            None => {
                session.owner = Some(owner);
                let owned = self.owners.entry(owner).or_default();
                if !owned.contains(&channel) {
                    owned.push(channel);
                }
                Ok(())
            }
        }
    }

    /// Remove every trace of a session: history, facts, persona, tags and
    /// the owner-index entry, as one logical operation.
    pub fn remove_session(&mut self, channel: ChannelId) {
        if let Some(session) = self.sessions.remove(&channel) {
            if let Some(owner) = session.owner {
                if let Some(owned) = self.owners.get_mut(&owner) {
                    owned.retain(|c| *c != channel);
                    if owned.is_empty() {
                        self.owners.remove(&owner);
                    }
                }
            }
        }
    }

    /// Total number of live owned sessions.
    pub fn count_live_sessions(&self) -> usize {
        self.owners.values().map(Vec::len).sum()
    }

    /// Append a turn, evicting the oldest once capacity is exceeded.
    pub fn push_turn(&mut self, channel: ChannelId, role: Role, content: impl Into<String>) {
        let histo_max = self.histo_max;
        let session = self.session_mut(channel);
        session.history.push_back(ChatMessage::new(role, content));
        while session.history.len() > histo_max {
            session.history.pop_front();
        }
    }

    /// Append a long-term fact.
    pub fn push_fact(&mut self, channel: ChannelId, fact: impl Into<String>) {
        self.session_mut(channel).facts.push(fact.into());
    }

    /// The most recent facts surfaced to the model (at most [`FACTS_SURFACED`]).
    pub fn recent_facts(&self, channel: ChannelId) -> &[String] {
        match self.sessions.get(&channel) {
            Some(session) => {
                let skip = session.facts.len().saturating_sub(FACTS_SURFACED);
                &session.facts[skip..]
            }
            None => &[],
        }
    }

    /// Replace the tag list wholesale.
    pub fn set_tags(&mut self, channel: ChannelId, tags: Vec<String>) {
        self.session_mut(channel).tags = tags;
    }
}
