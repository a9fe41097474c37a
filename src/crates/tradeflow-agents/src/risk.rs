//! Risk debate nodes: aggressive, conservative and neutral debators plus
//! the risk manager who judges and writes the final decision, and the
//! terminal node that normalizes it.

use serde_json::json;
use std::sync::Arc;

use tradeflow_core::compress::{history_tail, Perspective};
use tradeflow_core::debate::{DebateRecord, DebateSpec};
use tradeflow_core::fields;
use tradeflow_core::node::{NodeError, NodeSpec};
use tradeflow_core::report::Decision;
use tradeflow_core::state::{AnalysisState, StatePatch};

use crate::collaborators::AgentContext;
use crate::prompts;

pub const RISKY: &str = "risky_debator";
pub const SAFE: &str = "safe_debator";
pub const NEUTRAL: &str = "neutral_debator";
pub const JUDGE: &str = "risk_manager";
pub const FINAL: &str = "final_decision_node";

/// Bytes of shared risk history handed to each debator.
const HISTORY_BUDGET: usize = 4096;

fn risk_debator_node(
    ctx: Arc<AgentContext>,
    name: &'static str,
    perspective: Perspective,
    role: &'static str,
) -> NodeSpec {
    let writes = vec![
        format!("{name}_argument"),
        fields::LLM_TOKEN_COUNT.to_string(),
    ];
    NodeSpec::new(name, writes, move |state| {
        let ctx = ctx.clone();
        Box::pin(async move { argue_risk(ctx, name, perspective, role, state).await })
    })
}

async fn argue_risk(
    ctx: Arc<AgentContext>,
    name: &str,
    perspective: Perspective,
    role: &str,
    state: AnalysisState,
) -> Result<StatePatch, NodeError> {
    let ticker = state.get_str(fields::TICKER).unwrap_or_default();
    let trade_date = state.get_str(fields::TRADE_DATE).unwrap_or_default();
    let record = DebateRecord::load(&state, fields::RISK_DEBATE);
    let view = ctx.compressor.compress(&state, perspective);

    let trade_plan = state.get_str(fields::TRADER_PLAN).unwrap_or_default();
    // Hand each debator a bounded tail of the shared history, not the
    // whole transcript.
    let mut bounded = record.clone();
    bounded.history = history_tail(&record.history, HISTORY_BUDGET);
    let mut prompt = prompts::debator_prompt(ticker, trade_date, &view, &bounded, "");
    if !trade_plan.is_empty() {
        prompt.push_str("\n\nTrade plan under review:\n");
        prompt.push_str(trade_plan);
    }

    let completion = ctx.complete(&ctx.llm.deep_model, role, &prompt).await?;
    Ok(StatePatch::new()
        .with(format!("{name}_argument"), json!(completion.content))
        .with(fields::LLM_TOKEN_COUNT, json!(completion.usage.total())))
}

/// The risk manager: judges the trio and writes the final decision text.
fn risk_manager_node(ctx: Arc<AgentContext>) -> NodeSpec {
    let writes = vec![
        format!("{JUDGE}_verdict"),
        fields::FINAL_DECISION.to_string(),
        fields::LLM_TOKEN_COUNT.to_string(),
    ];
    NodeSpec::new(JUDGE, writes, move |state| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let ticker = state.get_str(fields::TICKER).unwrap_or_default();
            let trade_date = state.get_str(fields::TRADE_DATE).unwrap_or_default();
            let record = DebateRecord::load(&state, fields::RISK_DEBATE);
            let mut prompt = prompts::judge_prompt(ticker, trade_date, &record);
            if let Some(plan) = state.get_str(fields::TRADER_PLAN).filter(|p| !p.is_empty()) {
                prompt.push_str("\n\nTrade plan under review:\n");
                prompt.push_str(plan);
            }
            let completion = ctx
                .complete(&ctx.llm.deep_model, prompts::RISK_MANAGER_ROLE, &prompt)
                .await?;
            Ok(StatePatch::new()
                .with(format!("{JUDGE}_verdict"), json!(completion.content))
                .with(fields::FINAL_DECISION, json!(completion.content))
                .with(fields::LLM_TOKEN_COUNT, json!(completion.usage.total())))
        })
    })
}

/// Assemble the risk debate from config.
pub fn risk_debate(ctx: Arc<AgentContext>, config: &tradeflow_core::Config) -> DebateSpec {
    DebateSpec {
        name: "risk_debate".to_string(),
        state_field: fields::RISK_DEBATE.to_string(),
        perspectives: vec![
            risk_debator_node(ctx.clone(), RISKY, Perspective::Risky, prompts::RISKY_DEBATOR_ROLE),
            risk_debator_node(ctx.clone(), SAFE, Perspective::Safe, prompts::SAFE_DEBATOR_ROLE),
            risk_debator_node(
                ctx.clone(),
                NEUTRAL,
                Perspective::Neutral,
                prompts::NEUTRAL_DEBATOR_ROLE,
            ),
        ],
        judge: risk_manager_node(ctx),
        max_rounds: config.debate.max_risk_rounds,
        min_rounds: config.debate.min_rounds,
        quality_threshold: config.debate.force_consensus_quality,
        circuit_breaker_attempts: config.debate.circuit_breaker_attempts,
        consensus_lexicon: config.debate.consensus_lexicon.clone(),
    }
}

/// Terminal node. LLM-free: makes sure a decision exists, falling back to
/// a HOLD derived from the trade plan when the risk debate produced
/// nothing, and leaves error sentinels untouched.
pub fn final_decision_node() -> NodeSpec {
    NodeSpec::new(FINAL, vec![fields::FINAL_DECISION.to_string()], |state| {
        Box::pin(async move {
            let current = state.get_str(fields::FINAL_DECISION).unwrap_or_default();
            if !current.is_empty() {
                // Already decided (or an error sentinel); nothing to add.
                return Ok(StatePatch::new());
            }
            let plan = state.get_str(fields::TRADER_PLAN).unwrap_or_default();
            let fallback = if plan.is_empty() {
                "HOLD — no plan was produced".to_string()
            } else {
                format!("{} — derived from trade plan:\n{plan}", Decision::parse(plan).as_str())
            };
            Ok(StatePatch::new().with(fields::FINAL_DECISION, json!(fallback)))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tradeflow_core::node::{NodeRuntime, RunBudget, RunRecorder};
    use tradeflow_core::state::{FieldKind, MergeStrategy, StateSchema};

    fn schema() -> StateSchema {
        let mut s = StateSchema::new();
        s.declare_field(fields::FINAL_DECISION, FieldKind::Text, MergeStrategy::Replace);
        s.declare_field(fields::TRADER_PLAN, FieldKind::Text, MergeStrategy::Replace);
        s.declare_field(
            format!("{FINAL}_status"),
            FieldKind::Text,
            MergeStrategy::Replace,
        );
        s.declare_field(
            format!("{FINAL}_error"),
            FieldKind::Text,
            MergeStrategy::Replace,
        );
        s
    }

    #[tokio::test]
    async fn final_node_leaves_existing_decision_alone() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let state = s
            .apply_batch(
                &state,
                vec![StatePatch::new().with(fields::FINAL_DECISION, json!("BUY — strong case"))],
            )
            .unwrap();
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let outcome = runtime
            .run(
                &final_decision_node(),
                state,
                &RunBudget::new(Duration::from_secs(10), 10),
                &RunRecorder::new(),
            )
            .await
            .unwrap();
        assert!(outcome.patch.get(fields::FINAL_DECISION).is_none());
    }

    #[tokio::test]
    async fn final_node_derives_hold_from_empty_state() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let outcome = runtime
            .run(
                &final_decision_node(),
                state.clone(),
                &RunBudget::new(Duration::from_secs(10), 10),
                &RunRecorder::new(),
            )
            .await
            .unwrap();
        let next = s.apply_batch(&state, vec![outcome.patch]).unwrap();
        assert!(next.get_str(fields::FINAL_DECISION).unwrap().starts_with("HOLD"));
    }

    #[tokio::test]
    async fn final_node_parses_decision_out_of_trade_plan() {
        let s = schema();
        let state = s.initial_state().unwrap();
        let state = s
            .apply_batch(
                &state,
                vec![StatePatch::new()
                    .with(fields::TRADER_PLAN, json!("Scale in over two days. Final: buy."))],
            )
            .unwrap();
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let outcome = runtime
            .run(
                &final_decision_node(),
                state.clone(),
                &RunBudget::new(Duration::from_secs(10), 10),
                &RunRecorder::new(),
            )
            .await
            .unwrap();
        let next = s.apply_batch(&state, vec![outcome.patch]).unwrap();
        assert!(next.get_str(fields::FINAL_DECISION).unwrap().starts_with("BUY"));
    }
}
