//! tradeflow-core — graph runtime and agent orchestration for
//! multi-agent trading analysis.
//!
//! Given a ticker and a trade date, a tradeflow run drives a directed
//! graph of cooperating LLM-backed agents — analysts in parallel, then a
//! research debate, a trader, a risk debate, and a final decision — and
//! returns one auditable [`DecisionReport`](report::DecisionReport) with a
//! `BUY`/`HOLD`/`SELL`/`ERROR` decision.
//!
//! This crate is the runtime: the shared state store, the node runtime,
//! the parallel dispatcher, the debate controller, and the graph driver,
//! plus the context compressor and the tool invoker. The agent nodes and
//! the standard topology live in `tradeflow-agents`; the LLM client and
//! data providers are *consumed* behind traits ([`llm::LlmClient`],
//! [`providers::DataProvider`]) and never implemented here.
//!
//! # Architecture
//!
//! ```text
//! start ─→ dispatcher(analysts: market │ news │ social │ fundamentals)
//!       ─→ aggregator (quorum)
//!       ─→ research debate (bull vs bear, research manager judging)
//!       ─→ trader
//!       ─→ risk debate (risky / safe / neutral, risk manager judging)
//!       ─→ final decision ─→ end
//! ```
//!
//! Design rules the runtime enforces:
//!
//! - **State is data, owned by the driver.** Nodes receive immutable
//!   snapshots and return patches; all merging happens at single-threaded
//!   merge points under declared per-field strategies
//!   ([`state::StateSchema`]). Parallel analysts write disjoint keys, so
//!   no locks exist anywhere in the run path.
//! - **Errors are data.** Node failures, timeouts, lost quorums and
//!   stalled debates degrade the run and show up in the report; only
//!   contract violations abort ([`error::PipelineError`]).
//! - **Everything terminates.** Debates are bounded by round counts and a
//!   circuit breaker; the run is bounded by a recursion limit and a
//!   wall-clock budget, both checked at every merge point.
//! - **Cooperative concurrency.** One event loop; analysts overlap on I/O
//!   waits. Blocking work goes through the invoker's worker-thread
//!   offload.
//!
//! # Example
//!
//! ```rust,no_run
//! use tradeflow_core::{
//!     driver::{FlowGraph, GraphDriver, Stage, END},
//!     node::{NodeRuntime, NodeSpec},
//!     state::{FieldKind, MergeStrategy, StatePatch, StateSchema},
//! };
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), tradeflow_core::error::PipelineError> {
//! let mut schema = StateSchema::new();
//! schema.declare_field("greeting", FieldKind::Text, MergeStrategy::Replace);
//! schema.declare_field("hello_status", FieldKind::Text, MergeStrategy::Replace);
//! schema.declare_field("hello_error", FieldKind::Text, MergeStrategy::Replace);
//! let initial = schema.initial_state()?;
//!
//! let mut graph = FlowGraph::new();
//! graph
//!     .add_node(NodeSpec::new("hello", vec!["greeting".into()], |_state| {
//!         Box::pin(async move { Ok(StatePatch::new().with("greeting", json!("hi"))) })
//!     }))
//!     .add_edge("hello", END)
//!     .set_entry("hello");
//!
//! let driver = GraphDriver::new(
//!     schema,
//!     graph,
//!     NodeRuntime::new(Duration::from_secs(60)),
//!     50,
//!     Duration::from_secs(180),
//! )?;
//! let output = driver.run(initial).await?;
//! assert_eq!(output.state.get_str("greeting"), Some("hi"));
//! # Ok(())
//! # }
//! ```

pub mod compress;
pub mod config;
pub mod debate;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod fields;
pub mod invoker;
pub mod llm;
pub mod node;
pub mod providers;
pub mod report;
pub mod state;
pub mod testing;

pub use compress::{ContextCompressor, Perspective, PerspectiveView};
pub use config::{AnalystKind, Config};
pub use debate::{DebateController, DebateRecord, DebateSpec};
pub use driver::{FlowGraph, GraphDriver, RunOutput, Stage, END};
pub use error::{PipelineError, Result};
pub use invoker::{RetryPolicy, ToolError, ToolInvoker};
pub use llm::{ChatRequest, Completion, LlmClient, LlmError, Message};
pub use node::{NodeRuntime, NodeSpec, NodeStatus, RunBudget, RunRecorder};
pub use providers::{DataProvider, IndicatorEngine, ProviderError};
pub use report::{Decision, DecisionReport};
pub use state::{AnalysisState, FieldKind, MergeStrategy, StatePatch, StateSchema};
