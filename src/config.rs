//! Configuration for the agent core.
//!
//! [`ProviderConfig`] covers everything the LLM adapter needs (model,
//! credentials, limits, caching and retry policy); [`AgentConfig`] wraps it
//! together with the base system prompt and the paths the surrounding
//! application wires in (session database, tool sandbox root).
//!
//! Both are built through validating builders. The API key may be omitted
//! and is then read from the `ANTHROPIC_API_KEY` environment variable at
//! request time, never stored back into the config.

use std::env;
use std::time::Duration;

use crate::{Error, Result};

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default per-response token ceiling.
pub const DEFAULT_MAX_TOKENS: u32 = 8192;

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default retry budget beyond the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for exponential backoff.
pub const DEFAULT_RETRY_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default TTL for resumable event streams.
pub const DEFAULT_EVENT_STORE_TTL: Duration = Duration::from_secs(300);

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// LLM provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Identifier of the LLM backend (e.g. "anthropic").
    pub provider_type: String,

    /// Provider-specific model name.
    pub model: String,

    /// Credential. `None` falls back to [`API_KEY_ENV`] at request time.
    pub api_key: Option<String>,

    /// API endpoint root.
    pub base_url: String,

    /// Per-response upper bound on generated tokens.
    pub max_tokens: u32,

    /// Per-request deadline.
    pub timeout: Duration,

    /// When true, positional cache markers are injected into each request.
    pub enable_prompt_caching: bool,

    /// Retries beyond the initial attempt for transient failures.
    pub max_retries: u32,

    /// Base delay for exponential backoff (doubles per retry).
    pub retry_initial_delay: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: "anthropic".to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout: DEFAULT_TIMEOUT,
            enable_prompt_caching: true,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_initial_delay: DEFAULT_RETRY_INITIAL_DELAY,
        }
    }
}

impl ProviderConfig {
    /// Creates a new builder.
    pub fn builder() -> ProviderConfigBuilder {
        ProviderConfigBuilder::default()
    }

    /// Resolves the API key: the configured value if set, otherwise the
    /// [`API_KEY_ENV`] environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| env::var(API_KEY_ENV).ok())
    }
}

/// Builder for [`ProviderConfig`] with validation on `build()`.
#[derive(Debug, Default)]
pub struct ProviderConfigBuilder {
    provider_type: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    base_url: Option<String>,
    max_tokens: Option<u32>,
    timeout: Option<Duration>,
    enable_prompt_caching: Option<bool>,
    max_retries: Option<u32>,
    retry_initial_delay: Option<Duration>,
}

impl ProviderConfigBuilder {
    /// Sets the backend identifier.
    pub fn provider_type(mut self, provider_type: impl Into<String>) -> Self {
        self.provider_type = Some(provider_type.into());
        self
    }

    /// Sets the model name.
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the API key explicitly.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Sets the endpoint root.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Sets the per-response token ceiling.
    pub fn max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = Some(tokens);
        self
    }

    /// Sets the per-request deadline.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables or disables prompt-cache markers.
    pub fn enable_prompt_caching(mut self, enable: bool) -> Self {
        self.enable_prompt_caching = Some(enable);
        self
    }

    /// Sets the retry budget.
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Sets the backoff base delay.
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = Some(delay);
        self
    }

    /// Validates and builds the final [`ProviderConfig`].
    ///
    /// # Errors
    ///
    /// Fails when the model is empty or whitespace, the base URL has no
    /// http(s) scheme, or `max_tokens` is zero.
    pub fn build(self) -> Result<ProviderConfig> {
        let defaults = ProviderConfig::default();

        let model = self.model.unwrap_or(defaults.model);
        if model.trim().is_empty() {
            return Err(Error::config("model cannot be empty or whitespace"));
        }

        let base_url = self.base_url.unwrap_or(defaults.base_url);
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config(
                "base_url must start with http:// or https://",
            ));
        }

        let max_tokens = self.max_tokens.unwrap_or(defaults.max_tokens);
        if max_tokens == 0 {
            return Err(Error::config("max_tokens must be greater than 0"));
        }

        Ok(ProviderConfig {
            provider_type: self.provider_type.unwrap_or(defaults.provider_type),
            model,
            api_key: self.api_key,
            base_url,
            max_tokens,
            timeout: self.timeout.unwrap_or(defaults.timeout),
            enable_prompt_caching: self
                .enable_prompt_caching
                .unwrap_or(defaults.enable_prompt_caching),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            retry_initial_delay: self
                .retry_initial_delay
                .unwrap_or(defaults.retry_initial_delay),
        })
    }
}

/// Default base system prompt for the coding agent.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a professional software development assistant.

Working principles:
- Understand the task before acting; break complex work into steps.
- Before modifying anything, consider reading the relevant files first.
- Explain your reasoning and the choices you make.
- When uncertain, ask the user instead of guessing.";

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Provider settings.
    pub provider: ProviderConfig,

    /// Base system prompt; skills compose on top of it per request.
    pub system_prompt: String,

    /// Session database location.
    pub session_db_path: String,

    /// Filesystem root the file tools are confined to.
    pub sandbox_dir: String,

    /// TTL for resumable event streams.
    pub event_store_ttl: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            session_db_path: "sessions.db".to_string(),
            sandbox_dir: "workspace/sandbox".to_string(),
            event_store_ttl: DEFAULT_EVENT_STORE_TTL,
        }
    }
}

impl AgentConfig {
    /// Creates a config around the given provider settings with default
    /// prompt and paths.
    pub fn with_provider(provider: ProviderConfig) -> Self {
        Self {
            provider,
            ..Self::default()
        }
    }

    /// Replaces the base system prompt.
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Replaces the session database path.
    pub fn session_db_path(mut self, path: impl Into<String>) -> Self {
        self.session_db_path = path.into();
        self
    }

    /// Replaces the sandbox root.
    pub fn sandbox_dir(mut self, dir: impl Into<String>) -> Self {
        self.sandbox_dir = dir.into();
        self
    }

    /// Replaces the event-store TTL.
    pub fn event_store_ttl(mut self, ttl: Duration) -> Self {
        self.event_store_ttl = ttl;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.provider_type, "anthropic");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(config.timeout, Duration::from_secs(30));
        assert!(config.enable_prompt_caching);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_initial_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_builder_validation() {
        assert!(ProviderConfig::builder().model("   ").build().is_err());
        assert!(
            ProviderConfig::builder()
                .base_url("localhost:1234")
                .build()
                .is_err()
        );
        assert!(ProviderConfig::builder().max_tokens(0).build().is_err());

        let config = ProviderConfig::builder()
            .model("claude-haiku-4-20250514")
            .max_retries(5)
            .retry_initial_delay(Duration::from_millis(500))
            .enable_prompt_caching(false)
            .build()
            .unwrap();
        assert_eq!(config.model, "claude-haiku-4-20250514");
        assert_eq!(config.max_retries, 5);
        assert!(!config.enable_prompt_caching);
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let config = ProviderConfig::builder()
            .api_key("sk-explicit")
            .build()
            .unwrap();
        assert_eq!(config.resolve_api_key().unwrap(), "sk-explicit");
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.session_db_path, "sessions.db");
        assert_eq!(config.sandbox_dir, "workspace/sandbox");
        assert_eq!(config.event_store_ttl, Duration::from_secs(300));
        assert!(config.system_prompt.contains("assistant"));
    }
}
