use std::path::PathBuf;
use std::time::Duration;

use epicrag_auth::assertion::MAX_ASSERTION_LIFETIME_SECS;
use epicrag_auth::{Credentials, RetryPolicy, SigningKey};
use epicrag_fhir::{DEFAULT_MAX_OBSERVATIONS, FetcherConfig};
use serde::Deserialize;

/// Default configuration file, read from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "epicrag.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub epic: EpicConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub openai: OpenAiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub patients: PatientsConfig,
}

impl AppConfig {
    /// Range and format checks. Required values are checked by the command
    /// that needs them, so `keygen` works without any Epic settings.
    pub fn validate(&self) -> Result<(), String> {
        // Retry validations
        if self.retry.max_attempts == 0 {
            return Err("retry.max_attempts must be > 0".into());
        }
        if self.retry.max_attempts > 10 {
            return Err("retry.max_attempts must be <= 10".into());
        }
        if self.retry.multiplier < 1.0 {
            return Err("retry.multiplier must be >= 1.0".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err("retry.base_delay_ms must be <= retry.max_delay_ms".into());
        }
        // Assertion validation
        let lifetime = self.epic.assertion_lifetime_secs;
        if lifetime <= 0 || lifetime > MAX_ASSERTION_LIFETIME_SECS {
            return Err(format!(
                "epic.assertion_lifetime_secs must be within 1..={MAX_ASSERTION_LIFETIME_SECS}"
            ));
        }
        for (name, url) in [
            ("epic.base_url", &self.epic.base_url),
            ("epic.token_url", &self.epic.token_url),
            ("openai.base_url", &self.openai.base_url),
        ] {
            if !url.is_empty() && !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("{name} must be an http(s) URL"));
            }
        }
        // Fetch validations
        if self.fetch.page_size == 0 {
            return Err("fetch.page_size must be > 0".into());
        }
        // OpenAI validations
        if !(0.0..=2.0).contains(&self.openai.temperature) {
            return Err("openai.temperature must be within 0.0..=2.0".into());
        }
        if self.openai.max_tokens == 0 {
            return Err("openai.max_tokens must be > 0".into());
        }
        if self.openai.top_k == 0 {
            return Err("openai.top_k must be > 0".into());
        }
        if self.openai.batch_size == 0 {
            return Err("openai.batch_size must be > 0".into());
        }
        // Store validation
        if self.store.collection.trim().is_empty() {
            return Err("store.collection must not be empty".into());
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(self.retry.max_attempts)
            .with_base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .with_multiplier(self.retry.multiplier)
            .with_max_delay(Duration::from_millis(self.retry.max_delay_ms))
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        let category = self
            .fetch
            .observation_category
            .clone()
            .filter(|c| !c.trim().is_empty() && !c.eq_ignore_ascii_case("all"));
        FetcherConfig::default()
            .with_page_size(self.fetch.page_size)
            .with_min_request_interval(Duration::from_millis(self.fetch.min_request_interval_ms))
            .with_default_observation_category(category)
            .with_retry(self.retry_policy())
            .with_request_timeout(Duration::from_secs(self.fetch.request_timeout_secs))
    }

    /// Builds the Backend Services credentials, loading the signing key.
    pub fn credentials(&self) -> Result<Credentials, String> {
        let epic = &self.epic;
        for (name, value) in [
            ("epic.client_id (EPIC_CLIENT_ID)", &epic.client_id),
            ("epic.key_id (EPIC_KEY_ID)", &epic.key_id),
            ("epic.base_url (EPIC_BASE_URL)", &epic.base_url),
            ("epic.token_url (EPIC_TOKEN_URL)", &epic.token_url),
        ] {
            if value.trim().is_empty() {
                return Err(format!("{name} is required"));
            }
        }
        let key_path = epic
            .private_key_path
            .as_ref()
            .ok_or("epic.private_key_path (EPIC_PRIVATE_KEY_PATH) is required")?;
        let key = SigningKey::from_file(key_path).map_err(|e| e.to_string())?;

        let credentials = Credentials::new(
            &epic.client_id,
            &epic.key_id,
            &epic.token_url,
            &epic.base_url,
            key,
        )
        .map_err(|e| e.to_string())?;
        Ok(match &epic.scope {
            Some(scope) => credentials.with_scope(scope),
            None => credentials,
        })
    }

    /// The OpenAI API key, required by every command that embeds or chats.
    pub fn openai_api_key(&self) -> Result<&str, String> {
        self.openai
            .api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| "openai.api_key (OPENAI_API_KEY) is required".to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EpicConfig {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub key_id: String,
    /// FHIR R4 base URL.
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default = "default_assertion_lifetime_secs")]
    pub assertion_lifetime_secs: i64,
    /// Tokens are refreshed this long before they expire.
    #[serde(default = "default_token_margin_secs")]
    pub token_margin_secs: u64,
}

impl Default for EpicConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            key_id: String::new(),
            base_url: String::new(),
            token_url: String::new(),
            private_key_path: None,
            scope: None,
            assertion_lifetime_secs: default_assertion_lifetime_secs(),
            token_margin_secs: default_token_margin_secs(),
        }
    }
}

fn default_assertion_lifetime_secs() -> i64 {
    MAX_ASSERTION_LIFETIME_SECS
}
fn default_token_margin_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,
    /// Category used for Observation searches. Empty or `all` disables it.
    #[serde(default = "default_observation_category")]
    pub observation_category: Option<String>,
    /// Observations embedded per patient.
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            min_request_interval_ms: default_min_request_interval_ms(),
            observation_category: default_observation_category(),
            max_observations: default_max_observations(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_page_size() -> u32 {
    50
}
fn default_min_request_interval_ms() -> u64 {
    100
}
fn default_observation_category() -> Option<String> {
    Some(epicrag_fhir::DEFAULT_OBSERVATION_CATEGORY.to_string())
}
fn default_max_observations() -> usize {
    DEFAULT_MAX_OBSERVATIONS
}
fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Chunks retrieved per question.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Prior exchanges sent along with a question in interactive mode.
    #[serde(default = "default_history_exchanges")]
    pub history_exchanges: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_openai_base_url(),
            embedding_model: default_embedding_model(),
            chat_model: default_chat_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            batch_size: default_batch_size(),
            top_k: default_top_k(),
            history_exchanges: default_history_exchanges(),
        }
    }
}

fn default_openai_base_url() -> String {
    epicrag_index::openai::DEFAULT_BASE_URL.to_string()
}
fn default_embedding_model() -> String {
    epicrag_index::embeddings::DEFAULT_EMBEDDING_MODEL.to_string()
}
fn default_chat_model() -> String {
    epicrag_index::chat::DEFAULT_CHAT_MODEL.to_string()
}
fn default_temperature() -> f32 {
    epicrag_index::chat::DEFAULT_TEMPERATURE
}
fn default_max_tokens() -> u32 {
    epicrag_index::chat::DEFAULT_MAX_TOKENS
}
fn default_batch_size() -> usize {
    epicrag_index::embeddings::DEFAULT_BATCH_SIZE
}
fn default_top_k() -> usize {
    epicrag_index::qa::DEFAULT_TOP_K
}
fn default_history_exchanges() -> usize {
    epicrag_index::qa::DEFAULT_HISTORY_EXCHANGES
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            collection: default_collection(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("./vector_store.json")
}
fn default_collection() -> String {
    epicrag_index::DEFAULT_COLLECTION.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PatientsConfig {
    /// Patients indexed when `index` is run without arguments.
    #[serde(default)]
    pub ids: Vec<String>,
}

/// Splits a comma-separated id list, dropping blanks.
pub fn split_patient_ids(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub mod loader {
    use super::{AppConfig, DEFAULT_CONFIG_FILE, split_patient_ids};
    use config::{Config, ConfigBuilder, Environment, File, builder::DefaultState};
    use std::path::PathBuf;

    /// Flat variables used by existing deployments, mapped onto config keys.
    const FLAT_VARS: [(&str, &str); 6] = [
        ("EPIC_CLIENT_ID", "epic.client_id"),
        ("EPIC_KEY_ID", "epic.key_id"),
        ("EPIC_TOKEN_URL", "epic.token_url"),
        ("EPIC_PRIVATE_KEY_PATH", "epic.private_key_path"),
        ("EPIC_SCOPE", "epic.scope"),
        ("OPENAI_API_KEY", "openai.api_key"),
    ];

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, String> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_FILE));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        } else if path.is_some() {
            return Err(format!("config file not found: {}", pathbuf.display()));
        }
        // Environment variable overrides, e.g., EPICRAG__FETCH__PAGE_SIZE=100
        builder = builder.add_source(
            Environment::with_prefix("EPICRAG")
                .try_parsing(true)
                .separator("__"),
        );
        builder = flat_overrides(builder).map_err(|e| format!("config override error: {e}"))?;

        let cfg = builder
            .build()
            .map_err(|e| format!("config build error: {e}"))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| format!("config deserialize error: {e}"))?;
        // Validate
        merged.validate()?;
        Ok(merged)
    }

    fn flat_overrides(
        mut builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, config::ConfigError> {
        for (var, key) in FLAT_VARS {
            builder = builder.set_override_option(key, non_empty_var(var))?;
        }
        let base_url = non_empty_var("EPIC_BASE_URL").or_else(|| non_empty_var("EPIC_FHIR_BASE_URL"));
        builder = builder.set_override_option("epic.base_url", base_url)?;

        if let Some(raw) = non_empty_var("TEST_PATIENT_ID_LIST") {
            builder = builder.set_override("patients.ids", split_patient_ids(&raw))?;
        }
        Ok(builder)
    }

    fn non_empty_var(name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AppConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.fetch.page_size, 50);
        assert_eq!(cfg.store.collection, "patient_records");
        assert_eq!(cfg.openai.chat_model, "gpt-4o-mini");
        assert_eq!(cfg.fetch.observation_category.as_deref(), Some("vital-signs"));
    }

    #[test]
    fn test_validation_rejects_out_of_range() {
        let mut cfg = AppConfig::default();
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().unwrap_err().contains("max_attempts"));

        let mut cfg = AppConfig::default();
        cfg.epic.assertion_lifetime_secs = 600;
        assert!(cfg.validate().unwrap_err().contains("assertion_lifetime_secs"));

        let mut cfg = AppConfig::default();
        cfg.retry.base_delay_ms = 10_000;
        assert!(cfg.validate().unwrap_err().contains("base_delay_ms"));

        let mut cfg = AppConfig::default();
        cfg.epic.base_url = "fhir.example.org".into();
        assert!(cfg.validate().unwrap_err().contains("epic.base_url"));

        let mut cfg = AppConfig::default();
        cfg.logging.level = "loud".into();
        assert!(cfg.validate().unwrap_err().contains("logging.level"));
    }

    #[test]
    fn test_credentials_require_epic_settings() {
        let mut cfg = AppConfig::default();
        cfg.epic.client_id = "client".into();
        let err = cfg.credentials().unwrap_err();
        assert!(err.contains("EPIC_KEY_ID"), "{err}");
    }

    #[test]
    fn test_openai_key_required() {
        let mut cfg = AppConfig::default();
        assert!(cfg.openai_api_key().is_err());
        cfg.openai.api_key = Some("  ".into());
        assert!(cfg.openai_api_key().is_err());
        cfg.openai.api_key = Some("sk-test".into());
        assert_eq!(cfg.openai_api_key().unwrap(), "sk-test");
    }

    #[test]
    fn test_observation_category_can_be_disabled() {
        let mut cfg = AppConfig::default();
        cfg.fetch.observation_category = Some("all".into());
        assert_eq!(cfg.fetcher_config().default_observation_category, None);
        cfg.fetch.observation_category = Some("laboratory".into());
        assert_eq!(
            cfg.fetcher_config().default_observation_category.as_deref(),
            Some("laboratory")
        );
    }

    #[test]
    fn test_split_patient_ids() {
        assert_eq!(split_patient_ids(" a, b,,c ,"), vec!["a", "b", "c"]);
        assert!(split_patient_ids("").is_empty());
    }
}
