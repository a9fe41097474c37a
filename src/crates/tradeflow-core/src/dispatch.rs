//! Parallel dispatcher and aggregator for independent analyst nodes.
//!
//! The dispatcher fans out N analyst nodes concurrently against a single
//! state snapshot; the aggregator joins them once *all* have terminated
//! (success, failure, or timeout — never a partial join) and merges their
//! patches into one batch.
//!
//! Concurrency is cooperative: the analysts are I/O-bound, so
//! `futures::future::join_all` on one event loop gets wall-clock near
//! max(individual times) without threads. Each task is independently
//! bounded by the lesser of the per-node timeout and the run's remaining
//! budget, which is how a global exhaustion cancels in-flight work.
//!
//! Because every analyst writes its own keys (`market_report`, never a
//! shared `report`), the merged batch is conflict-free by construction and
//! the aggregate is the same for any completion order — the commutativity
//! property the tests pin down.
//!
//! Partial failure follows a quorum rule: successful outputs are always
//! kept, but when more than half the dispatched analysts fail the
//! aggregator stamps the error sentinel so conditional edges route the run
//! to its terminal stage.

use tracing::{info, warn};

use crate::error::{PipelineError, Result};
use crate::fields;
use crate::node::{NodeOutcome, NodeRuntime, NodeSpec, RunBudget, RunRecorder};
use crate::state::{AnalysisState, StatePatch, StateSchema};
use serde_json::Value;

/// Fan out `nodes` concurrently against `snapshot` and wait for all of
/// them. Outcomes are returned in completion order.
///
/// A recursion-limit breach inside the fan-out surfaces as `Err`; the
/// caller decides whether to degrade or abort.
pub async fn dispatch(
    runtime: &NodeRuntime,
    nodes: &[NodeSpec],
    snapshot: &AnalysisState,
    budget: &RunBudget,
    recorder: &RunRecorder,
) -> Result<Vec<NodeOutcome>> {
    let tasks = nodes
        .iter()
        .map(|spec| runtime.run(spec, snapshot.clone(), budget, recorder));
    let results = futures::future::join_all(tasks).await;

    let mut outcomes = Vec::with_capacity(results.len());
    for result in results {
        outcomes.push(result?);
    }
    Ok(outcomes)
}

/// Merge analyst `outcomes` into `state` with quorum enforcement.
///
/// - zero dispatched analysts is an immediate error sentinel;
/// - more than ⌊N/2⌋ failures is a quorum failure: successful patches are
///   still merged, then the sentinel is stamped with a reason naming the
///   failed analysts.
pub fn aggregate(
    schema: &StateSchema,
    state: &AnalysisState,
    outcomes: &[NodeOutcome],
) -> Result<AnalysisState> {
    if outcomes.is_empty() {
        let sentinel = error_sentinel_patch("no analysts selected: empty analyst set");
        return Ok(schema.apply_batch(state, vec![sentinel])?);
    }

    let mut patches: Vec<StatePatch> = outcomes.iter().map(|o| o.patch.clone()).collect();

    let failed: Vec<&str> = outcomes
        .iter()
        .filter(|o| o.status.is_failure())
        .map(|o| o.node.as_str())
        .collect();
    let quorum_lost = failed.len() * 2 > outcomes.len();

    if quorum_lost {
        warn!(
            failed = failed.len(),
            dispatched = outcomes.len(),
            "analyst quorum not met"
        );
        patches.push(error_sentinel_patch(&format!(
            "analyst quorum not met: {} of {} analysts failed ({})",
            failed.len(),
            outcomes.len(),
            failed.join(", ")
        )));
    } else {
        info!(
            succeeded = outcomes.len() - failed.len(),
            dispatched = outcomes.len(),
            "analyst fan-out aggregated"
        );
    }

    Ok(schema.apply_batch(state, patches)?)
}

/// Run the full fan-out/fan-in for one stage.
pub async fn run_fan_out(
    runtime: &NodeRuntime,
    schema: &StateSchema,
    nodes: &[NodeSpec],
    state: &AnalysisState,
    budget: &RunBudget,
    recorder: &RunRecorder,
) -> Result<AnalysisState> {
    match dispatch(runtime, nodes, state, budget, recorder).await {
        Ok(outcomes) => aggregate(schema, state, &outcomes),
        Err(PipelineError::RecursionLimit { node, limit }) => {
            let sentinel = error_sentinel_patch(&format!(
                "recursion limit {limit} exceeded at '{node}' during analyst fan-out"
            ));
            Ok(schema.apply_batch(state, vec![sentinel])?)
        }
        Err(other) => Err(other),
    }
}

pub(crate) fn error_sentinel_patch(reason: &str) -> StatePatch {
    StatePatch::new()
        .with(fields::FINAL_DECISION, Value::String(fields::ERROR_SENTINEL.to_string()))
        .with(fields::ERROR_REASON, Value::String(reason.to_string()))
}
