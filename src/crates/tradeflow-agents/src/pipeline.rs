//! Standard topology assembly and the `run_analysis` entry point.
//!
//! ```text
//! analysts (fan-out) ─→ research debate ─→ trader ─→ risk debate ─→ final ─→ end
//! ```
//!
//! Conditional edges degrade the path: an error sentinel routes straight
//! to the terminal stage, and the research debate is skipped when fewer
//! than two analyst reports are non-empty (there is nothing to debate).

use chrono::NaiveDate;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use tradeflow_core::config::{AnalystKind, Config};
use tradeflow_core::driver::{FlowGraph, GraphDriver, Stage, END};
use tradeflow_core::error::{PipelineError, Result};
use tradeflow_core::fields;
use tradeflow_core::node::NodeRuntime;
use tradeflow_core::report::DecisionReport;
use tradeflow_core::state::{AnalysisState, FieldKind, MergeStrategy, StatePatch, StateSchema};

use crate::analysts::analyst_node;
use crate::collaborators::{AgentContext, Collaborators};
use crate::research::{self, research_debate};
use crate::risk::{self, final_decision_node, risk_debate};
use crate::trader::{trader_node, TRADER};

const ANALYSTS: &str = "analysts";
const RESEARCH_DEBATE: &str = "research_debate";
const RISK_DEBATE: &str = "risk_debate";

/// Declare every field the standard topology touches. All four analysts'
/// fields exist even when only some are selected, so report extraction is
/// uniform and unselected reports read as `""`.
pub fn build_schema() -> StateSchema {
    let mut schema = StateSchema::new();

    for field in [fields::TICKER, fields::TRADE_DATE, fields::RUN_ID] {
        schema.declare_field(field, FieldKind::Text, MergeStrategy::Replace);
    }

    for kind in AnalystKind::all() {
        schema.declare_field(kind.report_field(), FieldKind::Text, MergeStrategy::Replace);
        schema.declare_field(kind.tool_calls_field(), FieldKind::Integer, MergeStrategy::Add);
        declare_node_fields(&mut schema, &kind.node_name());
    }

    for node in [
        research::BULL,
        research::BEAR,
        risk::RISKY,
        risk::SAFE,
        risk::NEUTRAL,
    ] {
        declare_node_fields(&mut schema, node);
        schema.declare_field(format!("{node}_argument"), FieldKind::Text, MergeStrategy::Replace);
    }
    for judge in [research::JUDGE, risk::JUDGE] {
        declare_node_fields(&mut schema, judge);
        schema.declare_field(format!("{judge}_verdict"), FieldKind::Text, MergeStrategy::Replace);
    }
    declare_node_fields(&mut schema, TRADER);
    declare_node_fields(&mut schema, risk::FINAL);

    schema.declare_field(fields::RESEARCH_DEBATE, FieldKind::Object, MergeStrategy::Replace);
    schema.declare_field(fields::RISK_DEBATE, FieldKind::Object, MergeStrategy::Replace);

    for field in [
        fields::INVESTMENT_PLAN,
        fields::TRADER_PLAN,
        fields::FINAL_DECISION,
        fields::ERROR_REASON,
    ] {
        schema.declare_field(field, FieldKind::Text, MergeStrategy::Replace);
    }
    schema.declare_field(fields::LLM_TOKEN_COUNT, FieldKind::Integer, MergeStrategy::Add);

    schema
}

fn declare_node_fields(schema: &mut StateSchema, node: &str) {
    schema.declare_field(format!("{node}_status"), FieldKind::Text, MergeStrategy::Replace);
    schema.declare_field(format!("{node}_error"), FieldKind::Text, MergeStrategy::Replace);
}

fn has_error_sentinel(state: &AnalysisState) -> bool {
    state
        .get_str(fields::FINAL_DECISION)
        .map(|d| !d.is_empty() && fields::is_error_sentinel(d))
        .unwrap_or(false)
}

fn non_empty_reports(state: &AnalysisState) -> usize {
    AnalystKind::all()
        .into_iter()
        .filter(|kind| {
            state
                .get_str(&kind.report_field())
                .map(|r| !r.is_empty())
                .unwrap_or(false)
        })
        .count()
}

/// Assemble the standard graph over the given context and config.
pub fn build_graph(ctx: Arc<AgentContext>, config: &Config) -> FlowGraph {
    let analysts: Vec<_> = config
        .selected_analysts
        .iter()
        .map(|kind| analyst_node(ctx.clone(), *kind))
        .collect();

    let mut graph = FlowGraph::new();
    graph
        .add_stage(ANALYSTS, Stage::FanOut(analysts))
        .add_stage(RESEARCH_DEBATE, Stage::Debate(research_debate(ctx.clone(), config)))
        .add_stage(TRADER, Stage::Node(trader_node(ctx.clone())))
        .add_stage(RISK_DEBATE, Stage::Debate(risk_debate(ctx, config)))
        .add_stage(risk::FINAL, Stage::Node(final_decision_node()))
        .set_entry(ANALYSTS);

    graph.add_conditional_edge(
        ANALYSTS,
        |state: &AnalysisState| {
            if has_error_sentinel(state) {
                "error".to_string()
            } else if non_empty_reports(state) < 2 {
                // One report is not a debate; hand it straight to the trader.
                "skip_debate".to_string()
            } else {
                "debate".to_string()
            }
        },
        HashMap::from([
            ("error".to_string(), risk::FINAL.to_string()),
            ("skip_debate".to_string(), TRADER.to_string()),
            ("debate".to_string(), RESEARCH_DEBATE.to_string()),
        ]),
    );
    graph.add_conditional_edge(
        RESEARCH_DEBATE,
        |state: &AnalysisState| {
            if has_error_sentinel(state) {
                "error".to_string()
            } else {
                "continue".to_string()
            }
        },
        HashMap::from([
            ("error".to_string(), risk::FINAL.to_string()),
            ("continue".to_string(), TRADER.to_string()),
        ]),
    );
    graph.add_conditional_edge(
        TRADER,
        |state: &AnalysisState| {
            if has_error_sentinel(state) {
                "error".to_string()
            } else {
                "continue".to_string()
            }
        },
        HashMap::from([
            ("error".to_string(), risk::FINAL.to_string()),
            ("continue".to_string(), RISK_DEBATE.to_string()),
        ]),
    );
    graph.add_edge(RISK_DEBATE, risk::FINAL);
    graph.add_edge(risk::FINAL, END);
    graph
}

/// Run the full analysis pipeline for one ticker and trade date.
///
/// Always returns a [`DecisionReport`] for well-formed inputs; degraded
/// runs carry `decision = ERROR` with the reason in the rationale.
/// `Err` is reserved for invalid inputs and programming errors
/// (contract violations, broken topology).
pub async fn run_analysis(
    ticker: &str,
    trade_date: &str,
    config: Config,
    collaborators: Collaborators,
) -> Result<DecisionReport> {
    let ticker = ticker.trim();
    if ticker.is_empty() {
        return Err(PipelineError::InvalidInput("ticker must be non-empty".into()));
    }
    NaiveDate::parse_from_str(trade_date, "%Y-%m-%d").map_err(|e| {
        PipelineError::InvalidInput(format!("trade date '{trade_date}' is not ISO (YYYY-MM-DD): {e}"))
    })?;

    let run_id = uuid::Uuid::new_v4().to_string();
    info!(ticker, trade_date, run_id, "starting analysis run");

    let ctx = AgentContext::new(&config, collaborators);
    let schema = build_schema();
    let initial = schema.initial_state().map_err(PipelineError::State)?;
    let initial = schema
        .apply_batch(
            &initial,
            vec![StatePatch::new()
                .with(fields::TICKER, json!(ticker))
                .with(fields::TRADE_DATE, json!(trade_date))
                .with(fields::RUN_ID, json!(run_id))],
        )
        .map_err(PipelineError::State)?;

    let graph = build_graph(ctx, &config);
    let driver = GraphDriver::new(
        schema,
        graph,
        NodeRuntime::new(config.runtime.node_timeout()),
        config.runtime.recursion_limit,
        config.runtime.wall_clock(),
    )?;

    let output = driver.run(initial).await?;
    let report = DecisionReport::from_run(&output);
    info!(
        ticker,
        decision = report.decision.as_str(),
        wall_clock_s = report.metrics.wall_clock_s,
        failed = report.metrics.failed_nodes.len(),
        "analysis run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_declares_every_history_field_as_text() {
        let schema = build_schema();
        schema.validate().unwrap();
        let state = schema.initial_state().unwrap();
        for field in [
            "market_report",
            "news_report",
            "social_report",
            "fundamentals_report",
            fields::INVESTMENT_PLAN,
            fields::TRADER_PLAN,
            fields::FINAL_DECISION,
        ] {
            assert_eq!(state.get_str(field), Some(""), "field {field}");
        }
        assert!(state.get_object(fields::RESEARCH_DEBATE).is_some());
        assert!(state.get_object(fields::RISK_DEBATE).is_some());
    }

    #[tokio::test]
    async fn empty_ticker_is_rejected_before_any_node_runs() {
        let collaborators = Collaborators::new(
            Arc::new(tradeflow_core::testing::MockLlm::new("x")),
            Arc::new(tradeflow_core::testing::MockIndicatorEngine),
        );
        let err = run_analysis("  ", "2024-01-15", Config::default(), collaborators)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn malformed_date_is_rejected() {
        let collaborators = Collaborators::new(
            Arc::new(tradeflow_core::testing::MockLlm::new("x")),
            Arc::new(tradeflow_core::testing::MockIndicatorEngine),
        );
        let err = run_analysis("AAPL", "01/15/2024", Config::default(), collaborators)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidInput(_)));
    }
}
