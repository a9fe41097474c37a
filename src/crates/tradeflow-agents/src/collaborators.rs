//! External collaborators and the shared per-run agent context.
//!
//! The core consumes the LLM client, data providers and indicator engine
//! behind traits; an embedder wires real implementations into
//! [`Collaborators`] and the pipeline threads them to every node through
//! one [`AgentContext`]. Nothing in this crate constructs a network
//! client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tradeflow_core::compress::ContextCompressor;
use tradeflow_core::config::{Config, LlmConfig};
use tradeflow_core::invoker::{RetryPolicy, ToolError, ToolInvoker};
use tradeflow_core::llm::{ChatRequest, Completion, LlmClient, Message};
use tradeflow_core::providers::{DataKind, DataProvider, IndicatorEngine};

/// The external services a run needs: one LLM client, ordered provider
/// chains per data kind, and an indicator engine.
#[derive(Clone)]
pub struct Collaborators {
    /// Chat-completion client.
    pub llm: Arc<dyn LlmClient>,
    /// Provider chains, primary first, keyed by data kind.
    pub providers: HashMap<DataKind, Vec<Arc<dyn DataProvider>>>,
    /// CPU-bound indicator engine (always offloaded).
    pub indicators: Arc<dyn IndicatorEngine>,
}

impl Collaborators {
    /// Collaborators with no provider chains yet.
    pub fn new(llm: Arc<dyn LlmClient>, indicators: Arc<dyn IndicatorEngine>) -> Self {
        Self {
            llm,
            providers: HashMap::new(),
            indicators,
        }
    }

    /// Append `provider` to the chain for `kind`.
    pub fn with_provider(mut self, kind: DataKind, provider: Arc<dyn DataProvider>) -> Self {
        self.providers.entry(kind).or_default().push(provider);
        self
    }

    /// The configured chain for `kind` (empty if none).
    pub fn chain(&self, kind: DataKind) -> &[Arc<dyn DataProvider>] {
        self.providers.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Everything an agent node closure captures: collaborators, the tool
/// invoker, the compressor, and the LLM settings. One per run, shared via
/// `Arc`.
pub struct AgentContext {
    /// External services.
    pub collaborators: Collaborators,
    /// Resilience wrapper for all outbound calls.
    pub invoker: ToolInvoker,
    /// Perspective-view builder.
    pub compressor: ContextCompressor,
    /// Models and per-call timeout.
    pub llm: LlmConfig,
}

impl AgentContext {
    /// Build the per-run context from config and collaborators.
    pub fn new(config: &Config, collaborators: Collaborators) -> Arc<Self> {
        let invoker = ToolInvoker::new(
            RetryPolicy::new(config.tools.max_retries),
            config.tools.circuit_breaker_threshold,
            Duration::from_secs(config.tools.circuit_breaker_reset_s),
        );
        for (endpoint, ttl_s) in &config.tools.cache_ttl_s {
            invoker.set_cache_ttl(endpoint.clone(), Duration::from_secs(*ttl_s));
        }
        Arc::new(Self {
            collaborators,
            invoker,
            compressor: ContextCompressor::new(config.compress.clone()),
            llm: config.llm.clone(),
        })
    }

    /// One guarded LLM call: system + user message against the given
    /// model, through the invoker (retry, breaker).
    pub async fn complete(
        &self,
        model: &str,
        system: &str,
        user: &str,
    ) -> Result<Completion, ToolError> {
        let request = ChatRequest::new(model, vec![Message::system(system), Message::user(user)])
            .with_timeout(Duration::from_secs(self.llm.timeout_s));
        let args = json!({ "model": model, "system": system, "user": user });
        self.invoker
            .invoke("llm", &args, || async {
                self.collaborators
                    .llm
                    .complete(request.clone())
                    .await
                    .map_err(ToolError::from)
            })
            .await
    }

    /// Walk a provider chain: invoke each provider in order through the
    /// invoker until one succeeds. The endpoint key is
    /// `<provider>:<kind>`, so breakers and caches are per provider.
    pub async fn fetch_chain<T, F, Fut>(
        &self,
        kind: DataKind,
        args: &serde_json::Value,
        call: F,
    ) -> Result<T, ToolError>
    where
        T: serde::Serialize + serde::de::DeserializeOwned,
        F: Fn(Arc<dyn DataProvider>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ToolError>>,
    {
        let chain = self.collaborators.chain(kind);
        if chain.is_empty() {
            return Err(ToolError::Permanent(format!(
                "no providers configured for {}",
                kind.as_str()
            )));
        }
        let mut last = None;
        for provider in chain {
            let endpoint = format!("{}:{}", provider.name(), kind.as_str());
            let provider = provider.clone();
            match self
                .invoker
                .invoke(&endpoint, args, || call(provider.clone()))
                .await
            {
                Ok(value) => return Ok(value),
                Err(err) => {
                    tracing::warn!(endpoint, error = %err, "provider failed, trying next in chain");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            ToolError::Permanent(format!("provider chain for {} is empty", kind.as_str()))
        }))
    }
}
