//! Research debate nodes: bull and bear researchers plus the research
//! manager who judges the debate and writes the investment plan.

use serde_json::json;
use std::sync::Arc;

use tradeflow_core::compress::Perspective;
use tradeflow_core::debate::{DebateRecord, DebateSpec};
use tradeflow_core::fields;
use tradeflow_core::node::{NodeError, NodeSpec};
use tradeflow_core::state::{AnalysisState, StatePatch};

use crate::collaborators::AgentContext;
use crate::prompts;

pub const BULL: &str = "bull_researcher";
pub const BEAR: &str = "bear_researcher";
pub const JUDGE: &str = "research_manager";

/// One side of the research debate.
fn researcher_node(
    ctx: Arc<AgentContext>,
    name: &'static str,
    opponent: &'static str,
    perspective: Perspective,
    role: &'static str,
) -> NodeSpec {
    let writes = vec![
        format!("{name}_argument"),
        fields::LLM_TOKEN_COUNT.to_string(),
    ];
    NodeSpec::new(name, writes, move |state| {
        let ctx = ctx.clone();
        Box::pin(async move {
            argue(ctx, name, opponent, perspective, role, state).await
        })
    })
}

async fn argue(
    ctx: Arc<AgentContext>,
    name: &str,
    opponent: &str,
    perspective: Perspective,
    role: &str,
    state: AnalysisState,
) -> Result<StatePatch, NodeError> {
    let ticker = state.get_str(fields::TICKER).unwrap_or_default();
    let trade_date = state.get_str(fields::TRADE_DATE).unwrap_or_default();
    let record = DebateRecord::load(&state, fields::RESEARCH_DEBATE);
    let view = ctx.compressor.compress(&state, perspective);
    let opponent_latest = record
        .perspectives
        .get(opponent)
        .map(|p| p.latest.as_str())
        .unwrap_or_default();

    let completion = ctx
        .complete(
            &ctx.llm.deep_model,
            role,
            &prompts::debator_prompt(ticker, trade_date, &view, &record, opponent_latest),
        )
        .await?;

    Ok(StatePatch::new()
        .with(format!("{name}_argument"), json!(completion.content))
        .with(fields::LLM_TOKEN_COUNT, json!(completion.usage.total())))
}

/// The research manager: judges the debate and writes the investment plan.
fn research_manager_node(ctx: Arc<AgentContext>) -> NodeSpec {
    let writes = vec![
        format!("{JUDGE}_verdict"),
        fields::INVESTMENT_PLAN.to_string(),
        fields::LLM_TOKEN_COUNT.to_string(),
    ];
    NodeSpec::new(JUDGE, writes, move |state| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let ticker = state.get_str(fields::TICKER).unwrap_or_default();
            let trade_date = state.get_str(fields::TRADE_DATE).unwrap_or_default();
            let record = DebateRecord::load(&state, fields::RESEARCH_DEBATE);
            let completion = ctx
                .complete(
                    &ctx.llm.deep_model,
                    prompts::RESEARCH_MANAGER_ROLE,
                    &prompts::judge_prompt(ticker, trade_date, &record),
                )
                .await?;
            // The verdict doubles as the investment plan handed to the
            // trader; the controller scans it for consensus and quality.
            Ok(StatePatch::new()
                .with(format!("{JUDGE}_verdict"), json!(completion.content))
                .with(fields::INVESTMENT_PLAN, json!(completion.content))
                .with(fields::LLM_TOKEN_COUNT, json!(completion.usage.total())))
        })
    })
}

/// Assemble the research debate from config.
pub fn research_debate(ctx: Arc<AgentContext>, config: &tradeflow_core::Config) -> DebateSpec {
    DebateSpec {
        name: "research_debate".to_string(),
        state_field: fields::RESEARCH_DEBATE.to_string(),
        perspectives: vec![
            researcher_node(
                ctx.clone(),
                BULL,
                BEAR,
                Perspective::Bull,
                prompts::BULL_RESEARCHER_ROLE,
            ),
            researcher_node(
                ctx.clone(),
                BEAR,
                BULL,
                Perspective::Bear,
                prompts::BEAR_RESEARCHER_ROLE,
            ),
        ],
        judge: research_manager_node(ctx),
        max_rounds: config.debate.max_research_rounds,
        min_rounds: config.debate.min_rounds,
        quality_threshold: config.debate.force_consensus_quality,
        circuit_breaker_attempts: config.debate.circuit_breaker_attempts,
        consensus_lexicon: config.debate.consensus_lexicon.clone(),
    }
}
