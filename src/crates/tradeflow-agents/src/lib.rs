//! tradeflow-agents — the agent nodes and standard topology on top of
//! `tradeflow-core`.
//!
//! This crate supplies the concrete agents of the trading-analysis
//! pipeline — four analysts, the bull/bear researchers and their manager,
//! the trader, the three risk debators and their manager — and the
//! [`run_analysis`] entry point that assembles and drives the standard
//! graph.
//!
//! External services are injected through [`Collaborators`]: an
//! [`LlmClient`](tradeflow_core::llm::LlmClient) implementation, provider
//! chains per data kind, and an indicator engine. The crate never builds a
//! network client itself, which keeps it embeddable and the test suite
//! fully offline (see `tradeflow_core::testing`).
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tradeflow_agents::{run_analysis, Collaborators};
//! use tradeflow_core::providers::DataKind;
//! use tradeflow_core::Config;
//!
//! # async fn example(
//! #     llm: Arc<dyn tradeflow_core::llm::LlmClient>,
//! #     provider: Arc<dyn tradeflow_core::providers::DataProvider>,
//! #     indicators: Arc<dyn tradeflow_core::providers::IndicatorEngine>,
//! # ) -> Result<(), tradeflow_core::PipelineError> {
//! let collaborators = Collaborators::new(llm, indicators)
//!     .with_provider(DataKind::Ohlcv, provider.clone())
//!     .with_provider(DataKind::News, provider);
//!
//! let report = run_analysis("AAPL", "2024-01-15", Config::default(), collaborators).await?;
//! println!("{}: {}", report.decision.as_str(), report.rationale);
//! # Ok(())
//! # }
//! ```

pub mod analysts;
pub mod collaborators;
pub mod pipeline;
pub mod prompts;
pub mod research;
pub mod risk;
pub mod trader;

pub use collaborators::{AgentContext, Collaborators};
pub use pipeline::{build_graph, build_schema, run_analysis};
