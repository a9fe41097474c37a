//! Node runtime — the wrapper around every agent node invocation.
//!
//! A node is an async function from an immutable state snapshot to a
//! [`StatePatch`]. The runtime guarantees the graph never sees an
//! exception: every invocation produces a valid patch, with the node's
//! status (`success`, `failed`, `timeout`) recorded under
//! `<node>_status` and any error text under `<node>_error`. Whether a
//! failure is fatal is decided downstream by edge semantics, not here.
//!
//! On top of capture, the runtime enforces the node's *write-set
//! contract*: patch keys must be a subset of the keys declared at graph
//! build time. A violation is a programming error and aborts the run —
//! the one class of failure this layer does not absorb.
//!
//! Every invocation also increments the run's shared invocation counter
//! (recursion-limit accounting) and records a [`NodeSpan`] with timing,
//! written keys, status, and reported token usage.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};
use crate::invoker::ToolError;
use crate::llm::LlmError;
use crate::providers::ProviderError;
use crate::state::{AnalysisState, StateError, StatePatch};

/// Execution status of a node, recorded under `<node>_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Declared but not yet dispatched.
    Pending,
    /// Currently executing.
    Running,
    /// Completed and its patch was accepted.
    Success,
    /// Returned an error; error text is under `<node>_error`.
    Failed,
    /// Cancelled at the per-node or global deadline.
    Timeout,
}

impl NodeStatus {
    /// Stable lowercase name as stored in state.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Running => "running",
            NodeStatus::Success => "success",
            NodeStatus::Failed => "failed",
            NodeStatus::Timeout => "timeout",
        }
    }

    /// Whether this status counts as a failure for quorum purposes.
    pub fn is_failure(self) -> bool {
        matches!(self, NodeStatus::Failed | NodeStatus::Timeout)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned from inside a node body. Always captured, never
/// propagated past the runtime.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct NodeError(pub String);

impl NodeError {
    /// Construct from anything printable.
    pub fn msg(msg: impl fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

impl From<ToolError> for NodeError {
    fn from(err: ToolError) -> Self {
        Self(err.to_string())
    }
}

impl From<LlmError> for NodeError {
    fn from(err: LlmError) -> Self {
        Self(err.to_string())
    }
}

impl From<ProviderError> for NodeError {
    fn from(err: ProviderError) -> Self {
        Self(err.to_string())
    }
}

impl From<StateError> for NodeError {
    fn from(err: StateError) -> Self {
        Self(err.to_string())
    }
}

/// Node function signature: snapshot in, patch out.
pub type NodeFn =
    Arc<dyn Fn(AnalysisState) -> BoxFuture<'static, std::result::Result<StatePatch, NodeError>> + Send + Sync>;

/// A named node with its declared write-set and executor.
#[derive(Clone)]
pub struct NodeSpec {
    /// Unique node name; also the prefix for its status fields.
    pub name: String,
    /// Fields this node is allowed to write. The runtime-owned
    /// `<name>_status` and `<name>_error` keys are implicit.
    pub writes: Vec<String>,
    /// The node body.
    pub func: NodeFn,
}

impl NodeSpec {
    /// Build a node. Call sites typically pass `|state| Box::pin(async move { .. })`.
    pub fn new<F>(name: impl Into<String>, writes: Vec<String>, func: F) -> Self
    where
        F: Fn(AnalysisState) -> BoxFuture<'static, std::result::Result<StatePatch, NodeError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            writes,
            func: Arc::new(func),
        }
    }

    /// State field holding this node's status.
    pub fn status_field(&self) -> String {
        format!("{}_status", self.name)
    }

    /// State field holding this node's captured error text.
    pub fn error_field(&self) -> String {
        format!("{}_error", self.name)
    }
}

impl fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeSpec")
            .field("name", &self.name)
            .field("writes", &self.writes)
            .finish_non_exhaustive()
    }
}

/// Telemetry record for one node invocation.
#[derive(Debug, Clone)]
pub struct NodeSpan {
    /// Node name.
    pub node: String,
    /// Terminal status.
    pub status: NodeStatus,
    /// Wall-clock duration of the invocation.
    pub duration: Duration,
    /// Patch keys the node wrote.
    pub wrote: Vec<String>,
    /// Token usage the node reported via `llm_token_count`, if any.
    pub tokens: u64,
}

/// Result of one wrapped invocation: status plus the patch to merge.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    /// Node name.
    pub node: String,
    /// Terminal status.
    pub status: NodeStatus,
    /// Patch to merge; always valid, even on failure or timeout.
    pub patch: StatePatch,
}

#[derive(Debug, Default)]
struct RecorderInner {
    spans: Vec<NodeSpan>,
    failed: Vec<(String, NodeStatus)>,
}

/// Accumulates telemetry across a run. Shared by the driver, dispatcher
/// and debate controllers.
#[derive(Debug, Clone, Default)]
pub struct RunRecorder {
    inner: Arc<Mutex<RecorderInner>>,
}

impl RunRecorder {
    /// Fresh recorder for one run.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed invocation.
    pub fn record(&self, span: NodeSpan) {
        let mut inner = self.inner.lock();
        if span.status.is_failure() {
            inner.failed.push((span.node.clone(), span.status));
        }
        inner.spans.push(span);
    }

    /// All spans recorded so far.
    pub fn spans(&self) -> Vec<NodeSpan> {
        self.inner.lock().spans.clone()
    }

    /// Nodes that failed or timed out, in completion order.
    pub fn failed_nodes(&self) -> Vec<(String, NodeStatus)> {
        self.inner.lock().failed.clone()
    }

    /// Total invocations recorded.
    pub fn node_count(&self) -> usize {
        self.inner.lock().spans.len()
    }
}

/// Shared budget state for one run: the wall-clock deadline and the
/// invocation counter checked against the recursion limit.
///
/// The deadline is a `tokio::time::Instant` so paused-clock tests can
/// drive budget exhaustion deterministically.
#[derive(Clone)]
pub struct RunBudget {
    /// Absolute deadline for the whole run.
    pub deadline: Instant,
    /// Total node invocations so far.
    pub invocations: Arc<AtomicU32>,
    /// Cap on `invocations`.
    pub recursion_limit: u32,
}

impl RunBudget {
    /// Budget starting now with the given wall-clock allowance and limit.
    pub fn new(wall_clock: Duration, recursion_limit: u32) -> Self {
        Self {
            deadline: Instant::now() + wall_clock,
            invocations: Arc::new(AtomicU32::new(0)),
            recursion_limit,
        }
    }

    /// Time left before the deadline, zero if exhausted.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the wall clock has run out.
    pub fn exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Count one invocation; `false` when the recursion limit is hit.
    pub fn try_invoke(&self) -> bool {
        self.invocations.fetch_add(1, Ordering::SeqCst) < self.recursion_limit
    }

    /// Invocations so far.
    pub fn invocation_count(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// Executes nodes under timeout, error capture and contract validation.
#[derive(Clone)]
pub struct NodeRuntime {
    node_timeout: Duration,
}

impl NodeRuntime {
    /// Runtime with the per-node wall-clock bound.
    pub fn new(node_timeout: Duration) -> Self {
        Self { node_timeout }
    }

    /// Run `spec` against `snapshot`. The effective timeout is the lesser
    /// of the per-node bound and the run's remaining budget, so a global
    /// exhaustion cancels in-flight work at its next suspension point.
    ///
    /// Returns `Err` only for contract violations; every operational
    /// failure is absorbed into the outcome's patch.
    pub async fn run(
        &self,
        spec: &NodeSpec,
        snapshot: AnalysisState,
        budget: &RunBudget,
        recorder: &RunRecorder,
    ) -> Result<NodeOutcome> {
        if !budget.try_invoke() {
            return Err(PipelineError::RecursionLimit {
                node: spec.name.clone(),
                limit: budget.recursion_limit,
            });
        }

        let started = Instant::now();
        let effective = self.node_timeout.min(budget.remaining());
        debug!(node = %spec.name, timeout = ?effective, "invoking node");

        let (status, mut patch) = if effective.is_zero() {
            // Budget already exhausted: never start the body.
            (NodeStatus::Timeout, StatePatch::new())
        } else {
            match tokio::time::timeout(effective, (spec.func)(snapshot)).await {
                Ok(Ok(patch)) => (NodeStatus::Success, patch),
                Ok(Err(err)) => {
                    warn!(node = %spec.name, error = %err, "node failed");
                    let patch = StatePatch::new().with(spec.error_field(), Value::String(err.0));
                    (NodeStatus::Failed, patch)
                }
                Err(_) => {
                    warn!(node = %spec.name, timeout = ?effective, "node timed out");
                    (NodeStatus::Timeout, StatePatch::new())
                }
            }
        };

        if status == NodeStatus::Success {
            self.check_write_set(spec, &patch)?;
        }
        patch.set(spec.status_field(), Value::String(status.as_str().to_string()));

        let tokens = patch
            .get("llm_token_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        recorder.record(NodeSpan {
            node: spec.name.clone(),
            status,
            duration: started.elapsed(),
            wrote: patch.keys().map(str::to_string).collect(),
            tokens,
        });

        Ok(NodeOutcome {
            node: spec.name.clone(),
            status,
            patch,
        })
    }

    fn check_write_set(&self, spec: &NodeSpec, patch: &StatePatch) -> Result<()> {
        for key in patch.keys() {
            let implicit = key == spec.status_field() || key == spec.error_field();
            if !implicit && !spec.writes.iter().any(|w| w == key) {
                return Err(PipelineError::contract(
                    &spec.name,
                    format!("wrote undeclared field '{key}'"),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FieldKind, MergeStrategy, StateSchema};
    use serde_json::json;

    fn schema() -> StateSchema {
        let mut s = StateSchema::new();
        s.declare_field("market_report", FieldKind::Text, MergeStrategy::Replace);
        s.declare_field("market_analyst_status", FieldKind::Text, MergeStrategy::Replace);
        s.declare_field("market_analyst_error", FieldKind::Text, MergeStrategy::Replace);
        s
    }

    fn budget() -> RunBudget {
        RunBudget::new(Duration::from_secs(60), 50)
    }

    #[tokio::test]
    async fn success_patch_carries_status() {
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let spec = NodeSpec::new("market_analyst", vec!["market_report".into()], |_state| {
            Box::pin(async move {
                Ok(StatePatch::new().with("market_report", json!("uptrend intact")))
            })
        });
        let state = schema().initial_state().unwrap();
        let recorder = RunRecorder::new();
        let outcome = runtime.run(&spec, state, &budget(), &recorder).await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Success);
        assert_eq!(
            outcome.patch.get("market_analyst_status"),
            Some(&json!("success"))
        );
        assert_eq!(recorder.node_count(), 1);
        assert!(recorder.failed_nodes().is_empty());
    }

    #[tokio::test]
    async fn node_error_is_captured_not_raised() {
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let spec = NodeSpec::new("market_analyst", vec!["market_report".into()], |_state| {
            Box::pin(async move { Err(NodeError::msg("provider 502")) })
        });
        let state = schema().initial_state().unwrap();
        let recorder = RunRecorder::new();
        let outcome = runtime.run(&spec, state, &budget(), &recorder).await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Failed);
        assert_eq!(
            outcome.patch.get("market_analyst_error"),
            Some(&json!("provider 502"))
        );
        assert_eq!(
            recorder.failed_nodes(),
            vec![("market_analyst".to_string(), NodeStatus::Failed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_node_times_out() {
        let runtime = NodeRuntime::new(Duration::from_secs(30));
        let spec = NodeSpec::new("market_analyst", vec!["market_report".into()], |_state| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(120)).await;
                Ok(StatePatch::new())
            })
        });
        let state = schema().initial_state().unwrap();
        let recorder = RunRecorder::new();
        let outcome = runtime
            .run(&spec, state, &budget(), &recorder)
            .await
            .unwrap();
        assert_eq!(outcome.status, NodeStatus::Timeout);
        assert_eq!(
            outcome.patch.get("market_analyst_status"),
            Some(&json!("timeout"))
        );
    }

    #[tokio::test]
    async fn write_outside_declared_set_aborts() {
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let spec = NodeSpec::new("market_analyst", vec!["market_report".into()], |_state| {
            Box::pin(async move { Ok(StatePatch::new().with("news_report", json!("sneaky"))) })
        });
        let state = schema().initial_state().unwrap();
        let recorder = RunRecorder::new();
        let err = runtime
            .run(&spec, state, &budget(), &recorder)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation { .. }));
    }

    #[tokio::test]
    async fn recursion_limit_blocks_invocation() {
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let spec = NodeSpec::new("noop", vec![], |_state| {
            Box::pin(async move { Ok(StatePatch::new()) })
        });
        let state = schema().initial_state().unwrap();
        let recorder = RunRecorder::new();
        let budget = RunBudget::new(Duration::from_secs(60), 2);
        assert!(runtime.run(&spec, state.clone(), &budget, &recorder).await.is_ok());
        assert!(runtime.run(&spec, state.clone(), &budget, &recorder).await.is_ok());
        let err = runtime.run(&spec, state, &budget, &recorder).await.unwrap_err();
        assert!(matches!(err, PipelineError::RecursionLimit { limit: 2, .. }));
    }

    #[tokio::test]
    async fn exhausted_budget_skips_node_body() {
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let spec = NodeSpec::new("market_analyst", vec!["market_report".into()], |_state| {
            Box::pin(async move {
                panic!("body must not run once the budget is exhausted");
            })
        });
        let state = schema().initial_state().unwrap();
        let recorder = RunRecorder::new();
        let budget = RunBudget::new(Duration::ZERO, 50);
        let outcome = runtime.run(&spec, state, &budget, &recorder).await.unwrap();
        assert_eq!(outcome.status, NodeStatus::Timeout);
    }
}
