//! Typed gateway configuration.
//!
//! The whole document is loaded once from disk, frozen behind an `Arc`, and
//! swapped atomically on admin updates. In-flight requests keep the snapshot
//! they started with.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Intent-complexity bucket. Higher tiers map to more capable model pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    T1,
    T2,
    T3,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::T1, Tier::T2, Tier::T3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::T1 => "t1",
            Tier::T2 => "t2",
            Tier::T3 => "t3",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Candidate iteration strategy for a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Sequential,
    Random,
    Adaptive,
}

/// One value per tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierMap<T> {
    pub t1: T,
    pub t2: T,
    pub t3: T,
}

impl<T> TierMap<T> {
    pub fn get(&self, tier: Tier) -> &T {
        match tier {
            Tier::T1 => &self.t1,
            Tier::T2 => &self.t2,
            Tier::T3 => &self.t3,
        }
    }
}

impl<T: Clone> TierMap<T> {
    pub fn splat(value: T) -> Self {
        Self {
            t1: value.clone(),
            t2: value.clone(),
            t3: value,
        }
    }
}

/// Wire protocol spoken by an upstream endpoint. Governs the request path and
/// whether upstream streaming is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "v1-messages")]
    V1Messages,
    #[serde(rename = "v1-response")]
    V1Response,
}

impl Protocol {
    pub fn path(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "/chat/completions",
            Protocol::V1Messages => "/messages",
            Protocol::V1Response => "/responses",
        }
    }

    /// `v1-messages` and `v1-response` upstreams are always called
    /// non-streaming, even for streaming clients.
    pub fn allows_streaming(&self) -> bool {
        matches!(self, Protocol::OpenAi)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::OpenAi
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEndpoint {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Default upstream used when a model carries no provider prefix and has
    /// no entry in `map`.
    #[serde(default = "default_upstream")]
    pub upstream: ProviderEndpoint,
    /// Named providers addressable via the `provider/model` prefix.
    #[serde(default)]
    pub custom: HashMap<String, ProviderEndpoint>,
    /// Bare model name -> provider id.
    #[serde(default)]
    pub map: HashMap<String, String>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            custom: HashMap::new(),
            map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_t1_models")]
    pub t1: Vec<String>,
    #[serde(default = "default_t2_models")]
    pub t2: Vec<String>,
    #[serde(default = "default_t3_models")]
    pub t3: Vec<String>,
    #[serde(default = "default_strategies")]
    pub strategies: TierMap<Strategy>,
}

impl ModelsConfig {
    pub fn pool(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::T1 => &self.t1,
            Tier::T2 => &self.t2,
            Tier::T3 => &self.t3,
        }
    }

    /// Union of all tier pools, de-duplicated, in sorted order.
    pub fn all_models(&self) -> BTreeSet<String> {
        self.t1
            .iter()
            .chain(self.t2.iter())
            .chain(self.t3.iter())
            .filter(|m| !m.is_empty())
            .cloned()
            .collect()
    }
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            t1: default_t1_models(),
            t2: default_t2_models(),
            t3: default_t3_models(),
            strategies: default_strategies(),
        }
    }
}

/// All timeouts are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "default_connect_timeouts")]
    pub connect: TierMap<u64>,
    #[serde(default = "default_generation_timeouts")]
    pub generation: TierMap<u64>,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            connect: default_connect_timeouts(),
            generation: default_generation_timeouts(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConditions {
    #[serde(default = "default_retry_status_codes")]
    pub status_codes: Vec<u16>,
    #[serde(default = "default_retry_keywords")]
    pub error_keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub retry_on_empty: bool,
}

impl RetryConditions {
    pub fn matches_status(&self, status: u16) -> bool {
        self.status_codes.contains(&status)
    }

    /// Case-insensitive substring match against any configured keyword.
    pub fn matches_keyword(&self, body: &str) -> Option<&str> {
        let lower = body.to_lowercase();
        self.error_keywords
            .iter()
            .find(|k| !k.is_empty() && lower.contains(&k.to_lowercase()))
            .map(|k| k.as_str())
    }
}

impl Default for RetryConditions {
    fn default() -> Self {
        Self {
            status_codes: default_retry_status_codes(),
            error_keywords: default_retry_keywords(),
            retry_on_empty: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetriesConfig {
    /// Full passes over the candidate list (sequential strategy).
    #[serde(default = "default_rounds")]
    pub rounds: TierMap<u32>,
    /// Attempt budget (random / adaptive strategies).
    #[serde(default = "default_max_retries")]
    pub max_retries: TierMap<u32>,
    #[serde(default)]
    pub conditions: RetryConditions,
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            max_retries: default_max_retries(),
            conditions: RetryConditions::default(),
        }
    }
}

/// What tier to report when the intent router is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisabledTierPolicy {
    #[serde(rename = "fixed-t1")]
    FixedT1,
    /// Deprecated debug aid retained for compatibility: pick a uniformly
    /// random tier per request.
    #[serde(rename = "legacy-random")]
    LegacyRandom,
}

impl Default for DisabledTierPolicy {
    fn default() -> Self {
        DisabledTierPolicy::FixedT1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_router_model")]
    pub model: String,
    #[serde(default = "default_router_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_true")]
    pub verify_ssl: bool,
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    #[serde(default)]
    pub disabled_tier_policy: DisabledTierPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: default_router_model(),
            base_url: default_router_base_url(),
            api_key: String::new(),
            verify_ssl: true,
            prompt_template: default_prompt_template(),
            disabled_tier_policy: DisabledTierPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Failure-score decay, in points per minute of wall time.
    #[serde(default = "default_decay_rate")]
    pub decay_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            decay_rate: default_decay_rate(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamsConfig {
    /// Applied to every upstream body where the client did not set the key.
    #[serde(default)]
    pub global_params: Map<String, Value>,
    /// Per-model overrides; these win over the client payload.
    #[serde(default)]
    pub model_params: HashMap<String, Map<String, Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Bearer key clients must present. Empty string = open gateway.
    #[serde(default)]
    pub gateway_api_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub retries: RetriesConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub params: ParamsConfig,
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Read-only snapshot accessor over the config document.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Arc<AppConfig>>,
}

impl ConfigStore {
    /// Load from `path`. A missing file materializes the defaults on disk; a
    /// corrupt file falls back to defaults with a warning.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<AppConfig>(&raw) {
                Ok(config) => config,
                Err(e) => {
                    warn!("failed to parse {}: {e}; using defaults", path.display());
                    AppConfig::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                write_config(&path, &config)?;
                config
            }
            Err(e) => {
                return Err(e).context(format!("failed to read {}", path.display()));
            }
        };
        Ok(Self {
            path,
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// In-memory store for tests and embedded use.
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(config)),
        }
    }

    /// The snapshot a request should pin for its whole lifetime.
    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.current.read().expect("config lock poisoned").clone()
    }

    /// Swap in a new document and persist it.
    pub fn replace(&self, config: AppConfig) -> Result<()> {
        if !self.path.as_os_str().is_empty() {
            write_config(&self.path, &config)?;
        }
        *self.current.write().expect("config lock poisoned") = Arc::new(config);
        Ok(())
    }
}

fn write_config(path: &Path, config: &AppConfig) -> Result<()> {
    let raw = serde_json::to_string_pretty(config)?;
    std::fs::write(path, raw).context(format!("failed to write {}", path.display()))?;
    Ok(())
}

fn default_true() -> bool {
    true
}

fn default_upstream() -> ProviderEndpoint {
    ProviderEndpoint {
        base_url: "https://api.openai.com/v1".to_string(),
        api_key: String::new(),
        protocol: Protocol::OpenAi,
        verify_ssl: true,
    }
}

fn default_t1_models() -> Vec<String> {
    vec!["gpt-4o-mini".to_string()]
}

fn default_t2_models() -> Vec<String> {
    vec!["gpt-4o".to_string()]
}

fn default_t3_models() -> Vec<String> {
    vec!["o3".to_string()]
}

fn default_strategies() -> TierMap<Strategy> {
    TierMap::splat(Strategy::Sequential)
}

fn default_connect_timeouts() -> TierMap<u64> {
    TierMap {
        t1: 3_000,
        t2: 5_000,
        t3: 5_000,
    }
}

fn default_generation_timeouts() -> TierMap<u64> {
    TierMap {
        t1: 30_000,
        t2: 60_000,
        t3: 120_000,
    }
}

fn default_retry_status_codes() -> Vec<u16> {
    vec![429, 500, 502, 503, 504]
}

fn default_retry_keywords() -> Vec<String> {
    ["rate limit", "quota exceeded", "overloaded", "timeout", "try again"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_rounds() -> TierMap<u32> {
    TierMap::splat(1)
}

fn default_max_retries() -> TierMap<u32> {
    TierMap::splat(3)
}

fn default_router_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_router_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_prompt_template() -> String {
    r#"You are an intent router for an AI agent gateway.
Classify the complexity of the user's recent requests into one of three levels.

T1 (passive / text-only): pure conversation, greetings, factual questions
answerable from internal knowledge. No tools, no side effects.

T2 (active / single task): standard tool usage (search, calculator, weather),
code generation, simple system operations, analysis of provided files.

T3 (agentic / complex flow): multi-step workflows, deep system control,
high-stakes reasoning or planning over ambiguous instructions.

Short does not mean simple: any implied action beyond conversation rules out T1.

User history:
{history}

Respond ONLY with the label: "T1", "T2", or "T3"."#
        .to_string()
}

fn default_decay_rate() -> f64 {
    1.0
}
