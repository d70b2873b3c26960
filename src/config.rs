//! Environment-sourced configuration for Lycoris.
//!
//! Every knob comes from the process environment; there is no config file
//! and no on-disk state. Missing optional variables fall back to the
//! defaults documented on each field.

use anyhow::Context;

/// Default persona used for the general channel and as the initial persona
/// of every private instance.
pub const DEFAULT_PERSONA: &str = "Rôles & règles : Tu es Lycoris, un assistant francophone, utile et concis. \
     En salon général, tu es neutre et sans mémoire. En instance privée, tu as une mémoire locale. \
     Tu n’inventes JAMAIS de souvenirs. Si une information passée n’est pas dans les ‘Faits’ fournis \
     ni dans l’historique, dis clairement que tu ne sais pas. Réponds en 1–2 phrases maximum.";

/// Known personality tags and the persona fragment each one adds.
pub const PERSONALITY_TAGS: &[(&str, &str)] = &[
    ("joyeuse", "Ton ton est joyeux, chaleureux, sans exagération."),
    ("sarcasme", "Tu emploies un sarcasme léger et bienveillant, jamais blessant."),
    ("curieuse", "Tu peux poser au plus une question courte si c’est vraiment utile."),
    ("sobre", "Tu restes très factuelle et directe."),
];

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Discord bot token (`DISCORD_TOKEN`, required).
    pub discord_token: String,
    /// Ollama base URL (`OLLAMA_URL`, default `http://localhost:11434`).
    pub ollama_url: String,
    /// Ollama model name (`OLLAMA_MODEL`, default `llama3`).
    pub ollama_model: String,
    /// Sampling temperature (`LLM_TEMPERATURE`, default 0.7).
    pub temperature: f64,
    /// Target general channel id (`GENERAL_CHANNEL_ID`, optional).
    ///
    /// When unset, any channel named "général" or "general" is treated as
    /// the general channel.
    pub general_channel_id: Option<u64>,
    /// Name of the category holding instance channels
    /// (`INSTANCE_CATEGORY_NAME`, default "Instances Lycoris").
    pub instance_category_name: String,
    /// History capacity per instance (`HISTO_MAX`, default 12).
    pub histo_max: usize,
    /// Default persona text (`LYCORIS_PERSONA`, default [`DEFAULT_PERSONA`]).
    pub default_persona: String,
    /// Log level (`LOG_LEVEL`, default "info").
    pub log_level: String,
    /// Log format, "pretty" or "json" (`LOG_FORMAT`, default "pretty").
    pub log_format: String,
}

impl Config {
    /// Load the configuration from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        let discord_token = std::env::var("DISCORD_TOKEN")
            .context("DISCORD_TOKEN is not set")?;

        Ok(Self {
            discord_token,
            ollama_url: env_or("OLLAMA_URL", "http://localhost:11434"),
            ollama_model: env_or("OLLAMA_MODEL", "llama3"),
            temperature: parse_env("LLM_TEMPERATURE", 0.7)?,
            general_channel_id: std::env::var("GENERAL_CHANNEL_ID")
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| v.parse().context("GENERAL_CHANNEL_ID is not a valid id"))
                .transpose()?,
            instance_category_name: env_or("INSTANCE_CATEGORY_NAME", "Instances Lycoris"),
            histo_max: parse_env("HISTO_MAX", 12)?,
            default_persona: env_or("LYCORIS_PERSONA", DEFAULT_PERSONA),
            log_level: env_or("LOG_LEVEL", "info"),
            log_format: env_or("LOG_FORMAT", "pretty"),
        })
    }

    /// Look up the persona fragment for a known personality tag.
    pub fn tag_fragment(name: &str) -> Option<&'static str> {
        PERSONALITY_TAGS
            .iter()
            .find(|(tag, _)| *tag == name)
            .map(|(_, fragment)| *fragment)
    }

    /// Whether `name` is a known personality tag.
    pub fn is_known_tag(name: &str) -> bool {
        Self::tag_fragment(name).is_some()
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .with_context(|| format!("{key} has an invalid value")),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_tags_resolve() {
        assert!(Config::is_known_tag("joyeuse"));
        assert!(Config::is_known_tag("sobre"));
        assert!(!Config::is_known_tag("inconnue"));
    }

    #[test]
    fn tag_fragment_lookup() {
        let fragment = Config::tag_fragment("sarcasme").unwrap();
        assert!(fragment.contains("sarcasme"));
        assert_eq!(Config::tag_fragment("grognon"), None);
    }
}
