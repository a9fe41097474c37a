//! Well-known state field names and sentinel values.
//!
//! Keeping the names in one place pins the stable surface the report
//! extractor and conditional edges rely on.

/// Ticker symbol under analysis (immutable input).
pub const TICKER: &str = "ticker";
/// ISO trade date (immutable input).
pub const TRADE_DATE: &str = "trade_date";
/// Opaque run identifier (immutable input).
pub const RUN_ID: &str = "run_id";

/// Investment plan produced by the research-debate judge.
pub const INVESTMENT_PLAN: &str = "investment_plan";
/// Trade plan produced by the trader.
pub const TRADER_PLAN: &str = "trader_plan";
/// Final decision text: `BUY`/`HOLD`/`SELL` plus rationale, or the
/// [`ERROR_SENTINEL`] prefix on degraded runs.
pub const FINAL_DECISION: &str = "final_decision";
/// Human-readable reason accompanying an `ERROR` decision.
pub const ERROR_REASON: &str = "error_reason";

/// Research debate record (object field).
pub const RESEARCH_DEBATE: &str = "research_debate";
/// Risk debate record (object field).
pub const RISK_DEBATE: &str = "risk_debate";

/// Add-merged token counter accumulated across all LLM calls.
pub const LLM_TOKEN_COUNT: &str = "llm_token_count";

/// Value written to [`FINAL_DECISION`] when a run degrades to an error.
pub const ERROR_SENTINEL: &str = "ERROR";

/// Whether a final-decision value is the error sentinel.
pub fn is_error_sentinel(decision: &str) -> bool {
    decision == ERROR_SENTINEL || decision.starts_with("ERROR")
}
