//! Lycoris - a Discord companion bot with ephemeral private instances.
//!
//! Lycoris answers in a shared general channel without memory, and opens
//! private per-user instance channels with local memory on request. All
//! session state lives in process memory; after a restart it is rebuilt
//! from the surviving channel topology (rehydration).
//!
//! ## Architecture
//!
//! ```text
//! gateway event → intent classifier → { lifecycle manager | orchestrator }
//!                                              ↓
//!                                      session registry mutation
//!                                              ↓
//!                                       Discord REST send
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod discord;
pub mod intent;
pub mod lifecycle;
pub mod llm;
pub mod logging;
pub mod orchestrator;
pub mod registry;

// Re-export commonly used types
pub use config::{Config, DEFAULT_PERSONA, PERSONALITY_TAGS};
pub use discord::gateway::{DiscordGateway, GatewayEvent, IncomingMessage};
pub use discord::rest::DiscordApi;
pub use discord::{DiscordError, DiscordResult};
pub use lifecycle::InstanceManager;
pub use llm::{ChatMessage, OllamaClient, Role};
pub use logging::init_logging;
pub use orchestrator::Bot;
pub use registry::{ChannelId, RegistryError, Session, SessionRegistry, UserId};
