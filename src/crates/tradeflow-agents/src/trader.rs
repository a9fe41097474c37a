//! Trader node: turns the investment plan into a trade plan.

use serde_json::json;
use std::sync::Arc;

use tradeflow_core::fields;
use tradeflow_core::node::NodeSpec;
use tradeflow_core::state::StatePatch;

use crate::collaborators::AgentContext;
use crate::prompts;

pub const TRADER: &str = "trader";

/// The trader synthesizes researcher output into a concrete plan. It reads
/// the investment plan plus a compressed view of the reports.
pub fn trader_node(ctx: Arc<AgentContext>) -> NodeSpec {
    let writes = vec![
        fields::TRADER_PLAN.to_string(),
        fields::LLM_TOKEN_COUNT.to_string(),
    ];
    NodeSpec::new(TRADER, writes, move |state| {
        let ctx = ctx.clone();
        Box::pin(async move {
            let ticker = state.get_str(fields::TICKER).unwrap_or_default();
            let trade_date = state.get_str(fields::TRADE_DATE).unwrap_or_default();
            let plan = state.get_str(fields::INVESTMENT_PLAN).unwrap_or_default();
            let context = [
                state.get_str("market_report").unwrap_or_default(),
                state.get_str("news_report").unwrap_or_default(),
                state.get_str("social_report").unwrap_or_default(),
                state.get_str("fundamentals_report").unwrap_or_default(),
            ]
            .iter()
            .filter(|r| !r.is_empty())
            .map(|r| ctx.compressor.summarize(r))
            .collect::<Vec<_>>()
            .join("\n\n");

            let completion = ctx
                .complete(
                    &ctx.llm.deep_model,
                    prompts::TRADER_ROLE,
                    &prompts::trader_prompt(ticker, trade_date, plan, &context),
                )
                .await?;
            Ok(StatePatch::new()
                .with(fields::TRADER_PLAN, json!(completion.content))
                .with(fields::LLM_TOKEN_COUNT, json!(completion.usage.total())))
        })
    })
}
