//! Graph driver — topology assembly and the run loop.
//!
//! A [`FlowGraph`] names stages and wires them with direct or conditional
//! edges. Stages come in three shapes: a single node, a parallel fan-out
//! over independent nodes (the analyst dispatcher/aggregator), and a
//! debate (the bounded adversarial loop). The topology is a DAG except for
//! the debate loops, which are internal to their controller and bounded by
//! an explicit counter — no cyclic object graphs exist.
//!
//! The driver owns the state for the duration of a run and serializes all
//! merges: each stage returns patches, the driver applies them at a
//! single-threaded merge point, evaluates the outgoing edge against the
//! new state, and moves on. Two global budgets are enforced at every merge
//! point:
//!
//! - **recursion limit**: total node invocations (composite stages count
//!   their inner invocations) — a cyclic conditional edge cannot loop
//!   forever; the run degrades to an `ERROR` decision with a diagnostic;
//! - **wall-clock budget**: once exhausted, no further stage starts and
//!   the run finalizes with whatever state it has.
//!
//! Given identical LLM outputs the driver is deterministic: analyst
//! scheduling order varies only across disjoint keys and commutative
//! merges, so the final state is the same.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::debate::{DebateController, DebateSpec};
use crate::dispatch::{error_sentinel_patch, run_fan_out};
use crate::error::{PipelineError, Result};
use crate::fields;
use crate::node::{NodeRuntime, NodeSpec, RunBudget, RunRecorder};
use crate::state::{AnalysisState, StateSchema};

/// Virtual terminal stage name. Edging to it ends the run.
pub const END: &str = "__end__";

/// One unit of the topology.
#[derive(Clone)]
pub enum Stage {
    /// A single node invocation.
    Node(NodeSpec),
    /// Parallel fan-out over independent nodes with quorum aggregation.
    FanOut(Vec<NodeSpec>),
    /// A bounded debate loop.
    Debate(DebateSpec),
}

/// Router function for conditional edges: inspects the state and returns a
/// branch key.
pub type EdgeRouter = Arc<dyn Fn(&AnalysisState) -> String + Send + Sync>;

/// Transition out of a stage.
#[derive(Clone)]
pub enum Edge {
    /// Unconditional transition.
    Direct(String),
    /// State-dependent routing. The router returns a branch key; the
    /// branches map resolves it to a target stage. Returning a key outside
    /// the declared branches is a contract violation.
    Conditional {
        /// Branch chooser.
        router: EdgeRouter,
        /// Branch key → target stage.
        branches: HashMap<String, String>,
    },
}

/// Named stages plus edges. Built once, validated before the first run.
#[derive(Default)]
pub struct FlowGraph {
    stages: HashMap<String, Stage>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
}

impl FlowGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a stage under `name`.
    pub fn add_stage(&mut self, name: impl Into<String>, stage: Stage) -> &mut Self {
        self.stages.insert(name.into(), stage);
        self
    }

    /// Convenience: add a single-node stage named after the node.
    pub fn add_node(&mut self, spec: NodeSpec) -> &mut Self {
        self.stages.insert(spec.name.clone(), Stage::Node(spec));
        self
    }

    /// Unconditional edge `from` → `to`.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.insert(from.into(), Edge::Direct(to.into()));
        self
    }

    /// Conditional edge out of `from`.
    pub fn add_conditional_edge<F>(
        &mut self,
        from: impl Into<String>,
        router: F,
        branches: HashMap<String, String>,
    ) -> &mut Self
    where
        F: Fn(&AnalysisState) -> String + Send + Sync + 'static,
    {
        self.edges.insert(
            from.into(),
            Edge::Conditional {
                router: Arc::new(router),
                branches,
            },
        );
        self
    }

    /// Set the entry stage.
    pub fn set_entry(&mut self, name: impl Into<String>) -> &mut Self {
        self.entry = Some(name.into());
        self
    }

    /// Structural validation: entry exists, every edge source and target
    /// names a known stage (or [`END`]).
    pub fn validate(&self) -> Result<()> {
        let entry = self
            .entry
            .as_ref()
            .ok_or_else(|| PipelineError::Validation("no entry stage set".into()))?;
        if !self.stages.contains_key(entry) {
            return Err(PipelineError::Validation(format!(
                "entry stage '{entry}' does not exist"
            )));
        }
        for (from, edge) in &self.edges {
            if !self.stages.contains_key(from) {
                return Err(PipelineError::Validation(format!(
                    "edge source '{from}' does not exist"
                )));
            }
            match edge {
                Edge::Direct(to) => self.check_target(from, to)?,
                Edge::Conditional { branches, .. } => {
                    if branches.is_empty() {
                        return Err(PipelineError::Validation(format!(
                            "conditional edge from '{from}' has no branches"
                        )));
                    }
                    for to in branches.values() {
                        self.check_target(from, to)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn check_target(&self, from: &str, to: &str) -> Result<()> {
        if to != END && !self.stages.contains_key(to) {
            return Err(PipelineError::Validation(format!(
                "edge target '{to}' (from '{from}') does not exist"
            )));
        }
        Ok(())
    }
}

/// Output of a completed run: the final state plus accounting.
#[derive(Debug)]
pub struct RunOutput {
    /// Final merged state.
    pub state: AnalysisState,
    /// Telemetry recorder with spans and failed nodes.
    pub recorder: RunRecorder,
    /// Measured wall clock of the run.
    pub wall_clock: Duration,
    /// Total node invocations.
    pub invocations: u32,
}

/// Drives a [`FlowGraph`] over a schema-governed state under global
/// resource budgets.
pub struct GraphDriver {
    schema: StateSchema,
    graph: FlowGraph,
    runtime: NodeRuntime,
    recursion_limit: u32,
    wall_clock: Duration,
}

impl GraphDriver {
    /// Build a driver, validating schema and topology up front.
    pub fn new(
        schema: StateSchema,
        graph: FlowGraph,
        runtime: NodeRuntime,
        recursion_limit: u32,
        wall_clock: Duration,
    ) -> Result<Self> {
        schema.validate().map_err(PipelineError::State)?;
        graph.validate()?;
        Ok(Self {
            schema,
            graph,
            runtime,
            recursion_limit,
            wall_clock,
        })
    }

    /// Execute the graph from its entry stage until [`END`], a budget
    /// stop, or a contract violation. Degradations never produce `Err`;
    /// they stamp the error sentinel and finish.
    pub async fn run(&self, initial: AnalysisState) -> Result<RunOutput> {
        let started = Instant::now();
        let budget = RunBudget::new(self.wall_clock, self.recursion_limit);
        let recorder = RunRecorder::new();
        let mut state = initial;
        // Entry presence is checked by validate() in new().
        let mut current = self
            .graph
            .entry
            .clone()
            .ok_or_else(|| PipelineError::Validation("no entry stage set".into()))?;

        loop {
            if current == END {
                break;
            }
            if budget.exhausted() {
                warn!(stage = %current, "wall-clock budget exhausted, finalizing run");
                state = self.stamp_if_undecided(
                    state,
                    &format!(
                        "wall-clock budget of {:?} exhausted before stage '{current}'",
                        self.wall_clock
                    ),
                )?;
                break;
            }

            let stage = self.graph.stages.get(&current).ok_or_else(|| {
                PipelineError::Validation(format!("stage '{current}' does not exist"))
            })?;

            debug!(stage = %current, "entering stage");
            let result = match stage {
                Stage::Node(spec) => match self
                    .runtime
                    .run(spec, state.clone(), &budget, &recorder)
                    .await
                {
                    Ok(outcome) => self
                        .schema
                        .apply_batch(&state, vec![outcome.patch])
                        .map_err(PipelineError::State),
                    Err(err) => Err(err),
                },
                Stage::FanOut(nodes) => {
                    run_fan_out(&self.runtime, &self.schema, nodes, &state, &budget, &recorder)
                        .await
                }
                Stage::Debate(spec) => {
                    DebateController::new(spec.clone())
                        .run(&self.runtime, &self.schema, state.clone(), &budget, &recorder)
                        .await
                }
            };

            state = match result {
                Ok(next) => next,
                Err(PipelineError::RecursionLimit { node, limit }) => {
                    warn!(stage = %current, node = %node, limit, "recursion limit exceeded");
                    let sentinel = error_sentinel_patch(&format!(
                        "recursion limit {limit} exceeded at '{node}' (conditional edges may be cycling)"
                    ));
                    state = self
                        .schema
                        .apply_batch(&state, vec![sentinel])
                        .map_err(PipelineError::State)?;
                    break;
                }
                Err(fatal) => return Err(fatal),
            };

            current = self.next_stage(&current, &state)?;
        }

        let wall_clock = started.elapsed();
        info!(
            ?wall_clock,
            invocations = budget.invocation_count(),
            "run complete"
        );
        Ok(RunOutput {
            state,
            recorder,
            wall_clock,
            invocations: budget.invocation_count(),
        })
    }

    fn next_stage(&self, current: &str, state: &AnalysisState) -> Result<String> {
        match self.graph.edges.get(current) {
            None => Ok(END.to_string()),
            Some(Edge::Direct(to)) => Ok(to.clone()),
            Some(Edge::Conditional { router, branches }) => {
                let key = router(state);
                branches.get(&key).cloned().ok_or_else(|| {
                    PipelineError::contract(
                        current,
                        format!("router returned undeclared branch '{key}'"),
                    )
                })
            }
        }
    }

    fn stamp_if_undecided(&self, state: AnalysisState, reason: &str) -> Result<AnalysisState> {
        let undecided = state
            .get_str(fields::FINAL_DECISION)
            .map(str::is_empty)
            .unwrap_or(true);
        if !undecided {
            return Ok(state);
        }
        self.schema
            .apply_batch(&state, vec![error_sentinel_patch(reason)])
            .map_err(PipelineError::State)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FieldKind, MergeStrategy, StatePatch};
    use serde_json::json;

    fn schema() -> StateSchema {
        let mut s = StateSchema::new();
        s.declare_field("step_log", FieldKind::Text, MergeStrategy::Concat);
        s.declare_field("route", FieldKind::Text, MergeStrategy::Replace);
        s.declare_field(fields::FINAL_DECISION, FieldKind::Text, MergeStrategy::Replace);
        s.declare_field(fields::ERROR_REASON, FieldKind::Text, MergeStrategy::Replace);
        for node in ["alpha", "beta", "gamma", "router_node"] {
            s.declare_field(format!("{node}_status"), FieldKind::Text, MergeStrategy::Replace);
            s.declare_field(format!("{node}_error"), FieldKind::Text, MergeStrategy::Replace);
        }
        s
    }

    fn logging_node(name: &str) -> NodeSpec {
        let log_line = name.to_string();
        NodeSpec::new(name, vec!["step_log".into()], move |_state| {
            let log_line = log_line.clone();
            Box::pin(async move { Ok(StatePatch::new().with("step_log", json!(log_line))) })
        })
    }

    fn driver(graph: FlowGraph) -> GraphDriver {
        GraphDriver::new(
            schema(),
            graph,
            NodeRuntime::new(Duration::from_secs(5)),
            50,
            Duration::from_secs(30),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn linear_flow_runs_stages_in_order() {
        let mut graph = FlowGraph::new();
        graph
            .add_node(logging_node("alpha"))
            .add_node(logging_node("beta"))
            .add_edge("alpha", "beta")
            .add_edge("beta", END)
            .set_entry("alpha");
        let d = driver(graph);
        let out = d.run(schema().initial_state().unwrap()).await.unwrap();
        assert_eq!(out.state.get_str("step_log"), Some("alpha\nbeta"));
        assert_eq!(out.invocations, 2);
    }

    #[tokio::test]
    async fn conditional_edge_routes_on_state() {
        let route_setter = NodeSpec::new("router_node", vec!["route".into()], |_state| {
            Box::pin(async move { Ok(StatePatch::new().with("route", json!("low"))) })
        });
        let mut graph = FlowGraph::new();
        graph
            .add_node(route_setter)
            .add_node(logging_node("alpha"))
            .add_node(logging_node("beta"))
            .add_conditional_edge(
                "router_node",
                |state: &AnalysisState| state.get_str("route").unwrap_or("high").to_string(),
                HashMap::from([
                    ("low".to_string(), "alpha".to_string()),
                    ("high".to_string(), "beta".to_string()),
                ]),
            )
            .add_edge("alpha", END)
            .add_edge("beta", END)
            .set_entry("router_node");
        let d = driver(graph);
        let out = d.run(schema().initial_state().unwrap()).await.unwrap();
        assert_eq!(out.state.get_str("step_log"), Some("alpha"));
    }

    #[tokio::test]
    async fn cyclic_conditional_edges_hit_recursion_limit() {
        let mut graph = FlowGraph::new();
        graph
            .add_node(logging_node("alpha"))
            .add_node(logging_node("beta"))
            .add_edge("alpha", "beta")
            .add_edge("beta", "alpha")
            .set_entry("alpha");
        let d = GraphDriver::new(
            schema(),
            graph,
            NodeRuntime::new(Duration::from_secs(5)),
            10,
            Duration::from_secs(30),
        )
        .unwrap();
        let out = d.run(schema().initial_state().unwrap()).await.unwrap();
        assert_eq!(out.state.get_str(fields::FINAL_DECISION), Some("ERROR"));
        let reason = out.state.get_str(fields::ERROR_REASON).unwrap();
        assert!(reason.contains("recursion limit 10"));
        assert!(out.invocations <= 11);
    }

    #[tokio::test]
    async fn zero_wall_clock_returns_error_without_invoking_nodes() {
        let mut graph = FlowGraph::new();
        graph
            .add_node(logging_node("alpha"))
            .add_edge("alpha", END)
            .set_entry("alpha");
        let d = GraphDriver::new(
            schema(),
            graph,
            NodeRuntime::new(Duration::from_secs(5)),
            50,
            Duration::ZERO,
        )
        .unwrap();
        let out = d.run(schema().initial_state().unwrap()).await.unwrap();
        assert_eq!(out.state.get_str(fields::FINAL_DECISION), Some("ERROR"));
        assert_eq!(out.recorder.node_count(), 0);
        assert_eq!(out.invocations, 0);
    }

    #[tokio::test]
    async fn undeclared_branch_is_a_contract_violation() {
        let mut graph = FlowGraph::new();
        graph
            .add_node(logging_node("alpha"))
            .add_node(logging_node("beta"))
            .add_conditional_edge(
                "alpha",
                |_state: &AnalysisState| "nowhere".to_string(),
                HashMap::from([("somewhere".to_string(), "beta".to_string())]),
            )
            .add_edge("beta", END)
            .set_entry("alpha");
        let d = driver(graph);
        let err = d.run(schema().initial_state().unwrap()).await.unwrap_err();
        assert!(matches!(err, PipelineError::ContractViolation { .. }));
    }

    #[test]
    fn validation_rejects_dangling_edge_target() {
        let mut graph = FlowGraph::new();
        graph
            .add_node(logging_node("alpha"))
            .add_edge("alpha", "ghost")
            .set_entry("alpha");
        let err = GraphDriver::new(
            schema(),
            graph,
            NodeRuntime::new(Duration::from_secs(5)),
            50,
            Duration::from_secs(30),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[test]
    fn validation_rejects_missing_entry() {
        let graph = FlowGraph::new();
        let err = GraphDriver::new(
            schema(),
            graph,
            NodeRuntime::new(Duration::from_secs(5)),
            50,
            Duration::from_secs(30),
        )
        .err()
        .unwrap();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
