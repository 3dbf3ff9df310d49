use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub packs: PacksConfig,
    #[serde(default)]
    pub market: MarketConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    /// Sessions idle longer than this are deleted at server start.
    #[serde(default = "default_session_ttl_days")]
    pub session_ttl_days: i64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            upload_dir: default_upload_dir(),
            max_upload_bytes: default_max_upload_bytes(),
            session_cookie: default_session_cookie(),
            session_ttl_days: default_session_ttl_days(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:5000".to_string()
}
fn default_upload_dir() -> PathBuf {
    PathBuf::from("./uploads")
}
fn default_max_upload_bytes() -> usize {
    5 * 1024 * 1024
}
fn default_session_cookie() -> String {
    "pokeshop_session".to_string()
}
fn default_session_ttl_days() -> i64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CatalogConfig {
    #[serde(default = "default_per_page")]
    pub per_page: i64,
    #[serde(default = "default_facets_ttl")]
    pub facets_ttl_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            per_page: default_per_page(),
            facets_ttl_secs: default_facets_ttl(),
        }
    }
}

fn default_per_page() -> i64 {
    8
}
fn default_facets_ttl() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_openai_url")]
    pub url: String,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            dims: default_dims(),
            url: default_openai_url(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_embedding_timeout() -> u64 {
    20
}
fn default_embedding_retries() -> u32 {
    2
}
fn default_max_input_chars() -> usize {
    6000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_chat_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_chat_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_chat_retries")]
    pub max_retries: u32,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            provider: default_chat_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_chat_timeout(),
            max_retries: default_chat_retries(),
        }
    }
}

fn default_chat_provider() -> String {
    "disabled".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_tokens() -> u32 {
    512
}
fn default_chat_timeout() -> u64 {
    30
}
fn default_chat_retries() -> u32 {
    2
}

impl ChatConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Model name, falling back to the provider's usual default.
    pub fn model_name(&self) -> String {
        if let Some(model) = &self.model {
            return model.clone();
        }
        match self.provider.as_str() {
            "groq" => "llama-3.1-8b-instant".to_string(),
            _ => "gpt-4o-mini".to_string(),
        }
    }

    pub fn base_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.trim_end_matches('/').to_string();
        }
        match self.provider.as_str() {
            "groq" => "https://api.groq.com/openai/v1".to_string(),
            _ => default_openai_url(),
        }
    }

    /// Environment variable holding the bearer key for this provider.
    pub fn api_key_env(&self) -> &'static str {
        match self.provider.as_str() {
            "groq" => "GROQ_API_KEY",
            _ => "OPENAI_API_KEY",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssistantConfig {
    #[serde(default = "default_retrieval_k")]
    pub retrieval_k: usize,
    #[serde(default = "default_search_k")]
    pub search_k: usize,
    #[serde(default = "default_chat_history")]
    pub chat_history: usize,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            retrieval_k: default_retrieval_k(),
            search_k: default_search_k(),
            chat_history: default_chat_history(),
        }
    }
}

fn default_retrieval_k() -> usize {
    5
}
fn default_search_k() -> usize {
    16
}
fn default_chat_history() -> usize {
    20
}

/// Draw weights per rarity bucket, as stored in `pack_rules.weights_json`.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct RarityWeights {
    #[serde(rename = "Common", default)]
    pub common: f64,
    #[serde(rename = "Uncommon", default)]
    pub uncommon: f64,
    #[serde(rename = "Rare", default)]
    pub rare: f64,
}

impl Default for RarityWeights {
    fn default() -> Self {
        Self {
            common: 0.7,
            uncommon: 0.25,
            rare: 0.05,
        }
    }
}

impl RarityWeights {
    pub fn validate(&self) -> Result<()> {
        if self.common < 0.0 || self.uncommon < 0.0 || self.rare < 0.0 {
            anyhow::bail!("pack weights must be non-negative");
        }
        if self.common + self.uncommon + self.rare <= 0.0 {
            anyhow::bail!("pack weights must have a positive sum");
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PacksConfig {
    #[serde(default = "default_pack_size")]
    pub default_pack_size: i64,
    #[serde(default = "default_god_chance")]
    pub default_god_chance: f64,
    #[serde(default)]
    pub default_weights: RarityWeights,
}

impl Default for PacksConfig {
    fn default() -> Self {
        Self {
            default_pack_size: default_pack_size(),
            default_god_chance: default_god_chance(),
            default_weights: RarityWeights::default(),
        }
    }
}

fn default_pack_size() -> i64 {
    10
}
fn default_god_chance() -> f64 {
    0.001
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    #[serde(default = "default_market_url")]
    pub url: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_market_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_market_retries")]
    pub max_retries: u32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            url: default_market_url(),
            page_size: default_page_size(),
            timeout_secs: default_market_timeout(),
            max_retries: default_market_retries(),
        }
    }
}

fn default_market_url() -> String {
    "https://api.pokemontcg.io/v2".to_string()
}
fn default_page_size() -> u32 {
    250
}
fn default_market_timeout() -> u64 {
    25
}
fn default_market_retries() -> u32 {
    3
}

impl Config {
    /// Configuration with every section defaulted, pointing at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            server: ServerConfig::default(),
            catalog: CatalogConfig::default(),
            embedding: EmbeddingConfig::default(),
            chat: ChatConfig::default(),
            assistant: AssistantConfig::default(),
            packs: PacksConfig::default(),
            market: MarketConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.session_ttl_days < 1 {
            anyhow::bail!("server.session_ttl_days must be >= 1");
        }
        if self.catalog.per_page < 1 {
            anyhow::bail!("catalog.per_page must be >= 1");
        }

        if self.embedding.dims == 0 {
            anyhow::bail!("embedding.dims must be > 0");
        }
        match self.embedding.provider.as_str() {
            "hash" | "openai" | "local" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be hash, openai, or local.",
                other
            ),
        }

        match self.chat.provider.as_str() {
            "disabled" | "openai" | "groq" => {}
            other => anyhow::bail!(
                "Unknown chat provider: '{}'. Must be disabled, openai, or groq.",
                other
            ),
        }
        if !(0.0..=2.0).contains(&self.chat.temperature) {
            anyhow::bail!("chat.temperature must be in [0.0, 2.0]");
        }

        if self.assistant.retrieval_k == 0 || self.assistant.search_k == 0 {
            anyhow::bail!("assistant.retrieval_k and assistant.search_k must be >= 1");
        }

        if self.packs.default_pack_size < 1 {
            anyhow::bail!("packs.default_pack_size must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.packs.default_god_chance) {
            anyhow::bail!("packs.default_god_chance must be in [0.0, 1.0]");
        }
        self.packs.default_weights.validate()?;

        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg = parse_config("[db]\npath = \"./data/shop.sqlite\"\n").unwrap();
        assert_eq!(cfg.catalog.per_page, 8);
        assert_eq!(cfg.embedding.provider, "hash");
        assert_eq!(cfg.embedding.dims, 256);
        assert!(!cfg.chat.is_enabled());
        assert_eq!(cfg.packs.default_weights, RarityWeights::default());
        assert_eq!(cfg.server.session_cookie, "pokeshop_session");
        assert_eq!(cfg.server.session_ttl_days, 30);
    }

    #[test]
    fn test_groq_defaults() {
        let cfg = parse_config("[db]\npath = \"x.sqlite\"\n[chat]\nprovider = \"groq\"\n").unwrap();
        assert_eq!(cfg.chat.model_name(), "llama-3.1-8b-instant");
        assert_eq!(cfg.chat.base_url(), "https://api.groq.com/openai/v1");
        assert_eq!(cfg.chat.api_key_env(), "GROQ_API_KEY");
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse_config("[db]\npath = \"x\"\n[embedding]\nprovider = \"magic\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_rejects_bad_weights() {
        let err = parse_config(
            "[db]\npath = \"x\"\n[packs.default_weights]\nCommon = 0.0\nUncommon = 0.0\nRare = 0.0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("positive sum"));
    }

    #[test]
    fn test_rejects_zero_session_ttl() {
        let err = parse_config("[db]\npath = \"x\"\n[server]\nsession_ttl_days = 0\n").unwrap_err();
        assert!(err.to_string().contains("session_ttl_days"));
    }

    #[test]
    fn test_rejects_zero_per_page() {
        assert!(parse_config("[db]\npath = \"x\"\n[catalog]\nper_page = 0\n").is_err());
    }
}
