//! Run configuration.
//!
//! `Config` is an explicit parameter to `run_analysis` — there is no
//! process-wide configuration singleton, and nothing here touches the file
//! system or environment at import time. Environment variables (provider
//! credentials) are read exactly once, at [`Config::load_env_credentials`]
//! time, never during a run. Every field has a serde default so a config
//! can be deserialized from a partial YAML document.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::compress::CompressConfig;
use crate::debate::DEFAULT_CONSENSUS_LEXICON;
use crate::error::PipelineError;

/// Recognized LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// OpenAI API.
    #[default]
    Openai,
    /// Anthropic API.
    Anthropic,
    /// Google API.
    Google,
    /// Self-hosted endpoint.
    Local,
}

impl LlmProvider {
    /// Conventional credential environment variable for this provider.
    pub fn credential_env_key(self) -> Option<&'static str> {
        match self {
            LlmProvider::Openai => Some("OPENAI_API_KEY"),
            LlmProvider::Anthropic => Some("ANTHROPIC_API_KEY"),
            LlmProvider::Google => Some("GOOGLE_API_KEY"),
            LlmProvider::Local => None,
        }
    }
}

/// LLM settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Which provider the embedder wires in.
    pub provider: LlmProvider,
    /// Model for high-volume summarization (analysts).
    pub quick_model: String,
    /// Model for debate and judgment stages.
    pub deep_model: String,
    /// Override endpoint, mainly for `local`.
    pub base_url: Option<String>,
    /// Per-call timeout in seconds.
    pub timeout_s: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            quick_model: "gpt-4o-mini".to_string(),
            deep_model: "gpt-4o".to_string(),
            base_url: None,
            timeout_s: 60,
        }
    }
}

/// The four analyst roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalystKind {
    /// Market technicals.
    Market,
    /// News flow.
    News,
    /// Social sentiment.
    Social,
    /// Company fundamentals.
    Fundamentals,
}

impl AnalystKind {
    /// All four analysts, the default selection.
    pub fn all() -> Vec<AnalystKind> {
        vec![
            AnalystKind::Market,
            AnalystKind::News,
            AnalystKind::Social,
            AnalystKind::Fundamentals,
        ]
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            AnalystKind::Market => "market",
            AnalystKind::News => "news",
            AnalystKind::Social => "social",
            AnalystKind::Fundamentals => "fundamentals",
        }
    }

    /// Node name of this analyst.
    pub fn node_name(self) -> String {
        format!("{}_analyst", self.as_str())
    }

    /// State field carrying this analyst's report.
    pub fn report_field(self) -> String {
        format!("{}_report", self.as_str())
    }

    /// State field counting this analyst's tool calls.
    pub fn tool_calls_field(self) -> String {
        format!("{}_tool_calls", self.as_str())
    }
}

/// Debate bounds and convergence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    /// Round bound for the research debate.
    pub max_research_rounds: u32,
    /// Round bound for the risk debate.
    pub max_risk_rounds: u32,
    /// Rounds required before quality alone can close a debate.
    pub min_rounds: u32,
    /// Quality score in `[0, 10]` that forces consensus.
    pub force_consensus_quality: f64,
    /// Debate-loop entries at which the circuit breaker trips.
    pub circuit_breaker_attempts: u32,
    /// Consensus indicator phrases.
    pub consensus_lexicon: Vec<String>,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            max_research_rounds: 3,
            max_risk_rounds: 1,
            min_rounds: 1,
            force_consensus_quality: 7.0,
            circuit_breaker_attempts: 5,
            consensus_lexicon: DEFAULT_CONSENSUS_LEXICON
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Global run budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Node invocations allowed per run.
    pub recursion_limit: u32,
    /// Wall-clock budget for the whole run, in seconds.
    pub wall_clock_s: u64,
    /// Per-node timeout, in seconds.
    pub node_timeout_s: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            recursion_limit: 50,
            wall_clock_s: 180,
            node_timeout_s: 60,
        }
    }
}

impl RuntimeConfig {
    /// Wall clock as a duration.
    pub fn wall_clock(&self) -> Duration {
        Duration::from_secs(self.wall_clock_s)
    }

    /// Node timeout as a duration.
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_s)
    }
}

/// Tool Invoker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Retry attempts for transient failures (including the first call).
    pub max_retries: usize,
    /// Consecutive failures that open an endpoint's circuit breaker.
    pub circuit_breaker_threshold: u32,
    /// Seconds before an open breaker half-opens.
    pub circuit_breaker_reset_s: u64,
    /// Cache TTL per endpoint, in seconds; absent means uncached.
    pub cache_ttl_s: HashMap<String, u64>,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_s: 60,
            cache_ttl_s: HashMap::new(),
        }
    }
}

/// Ordered provider chains per data kind (e.g. `ohlcv: [finnhub, yahoo]`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Data kind name → provider names, primary first.
    pub providers: HashMap<String, Vec<String>>,
}

/// Provider credentials, read from the environment exactly once.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    values: HashMap<String, String>,
}

impl Credentials {
    /// Read the given environment keys now. Missing keys are simply
    /// absent; providers that need them will fail with a permanent error
    /// at call time, not at load time.
    pub fn from_env(keys: &[&str]) -> Self {
        let mut values = HashMap::new();
        for key in keys {
            if let Ok(value) = env::var(key) {
                values.insert((*key).to_string(), value);
            }
        }
        Self { values }
    }

    /// Look up a credential captured at load time.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

/// Full configuration for one `run_analysis` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// LLM settings.
    pub llm: LlmConfig,
    /// Which analysts to dispatch; defaults to all four.
    pub selected_analysts: Vec<AnalystKind>,
    /// Debate settings.
    pub debate: DebateConfig,
    /// Global budgets.
    pub runtime: RuntimeConfig,
    /// Tool Invoker settings.
    pub tools: ToolsConfig,
    /// Provider chains.
    pub data: DataConfig,
    /// Compressor budgets.
    pub compress: CompressConfig,
    /// Credentials captured at load time. Never serialized.
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            selected_analysts: AnalystKind::all(),
            debate: DebateConfig::default(),
            runtime: RuntimeConfig::default(),
            tools: ToolsConfig::default(),
            data: DataConfig::default(),
            compress: CompressConfig::default(),
            credentials: Credentials::default(),
        }
    }
}

impl Config {
    /// Parse a (possibly partial) YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, PipelineError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| PipelineError::Configuration(format!("invalid config YAML: {e}")))
    }

    /// Capture provider credentials from the environment, once. The key
    /// set is derived from the configured LLM provider plus one
    /// `<PROVIDER>_API_KEY` per data provider named in the chains.
    pub fn load_env_credentials(&mut self) {
        let mut keys: Vec<String> = Vec::new();
        if let Some(key) = self.llm.provider.credential_env_key() {
            keys.push(key.to_string());
        }
        for chain in self.data.providers.values() {
            for provider in chain {
                keys.push(format!("{}_API_KEY", provider.to_uppercase()));
            }
        }
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        self.credentials = Credentials::from_env(&refs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.selected_analysts.len(), 4);
        assert_eq!(cfg.debate.max_research_rounds, 3);
        assert_eq!(cfg.debate.max_risk_rounds, 1);
        assert_eq!(cfg.debate.min_rounds, 1);
        assert!((cfg.debate.force_consensus_quality - 7.0).abs() < f64::EPSILON);
        assert_eq!(cfg.debate.circuit_breaker_attempts, 5);
        assert_eq!(cfg.runtime.recursion_limit, 50);
        assert_eq!(cfg.runtime.wall_clock_s, 180);
        assert_eq!(cfg.runtime.node_timeout_s, 60);
        assert_eq!(cfg.tools.max_retries, 3);
        assert_eq!(cfg.tools.circuit_breaker_threshold, 5);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let cfg = Config::from_yaml_str(
            r#"
selected_analysts: [market, news]
debate:
  max_research_rounds: 2
runtime:
  wall_clock_s: 30
"#,
        )
        .unwrap();
        assert_eq!(
            cfg.selected_analysts,
            vec![AnalystKind::Market, AnalystKind::News]
        );
        assert_eq!(cfg.debate.max_research_rounds, 2);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.debate.circuit_breaker_attempts, 5);
        assert_eq!(cfg.runtime.wall_clock_s, 30);
        assert_eq!(cfg.runtime.node_timeout_s, 60);
    }

    #[test]
    fn invalid_yaml_is_a_configuration_error() {
        let err = Config::from_yaml_str("selected_analysts: [cosmic]").unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn analyst_kind_field_names_are_stable() {
        assert_eq!(AnalystKind::Market.report_field(), "market_report");
        assert_eq!(AnalystKind::News.node_name(), "news_analyst");
        assert_eq!(
            AnalystKind::Fundamentals.tool_calls_field(),
            "fundamentals_tool_calls"
        );
    }

    #[test]
    fn credentials_capture_is_explicit_and_one_shot() {
        env::set_var("TRADEFLOW_TEST_CRED", "sekrit");
        let creds = Credentials::from_env(&["TRADEFLOW_TEST_CRED", "TRADEFLOW_TEST_MISSING"]);
        env::remove_var("TRADEFLOW_TEST_CRED");
        assert_eq!(creds.get("TRADEFLOW_TEST_CRED"), Some("sekrit"));
        assert_eq!(creds.get("TRADEFLOW_TEST_MISSING"), None);
    }
}
