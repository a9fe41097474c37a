//! Decision report — the single output of a run.
//!
//! A run always returns exactly one [`DecisionReport`], whether it
//! succeeded or degraded. `decision = ERROR` with `metrics.failed_nodes`
//! lets the caller distinguish graceful degradation from success. Field
//! names and enum values are stable; no wire format is mandated — callers
//! serialize the report however they wish (it derives `Serialize`).

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::debate::DebateRecord;
use crate::driver::RunOutput;
use crate::fields;
use crate::node::NodeStatus;

/// Final trade decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    /// Open or add to a position.
    Buy,
    /// Keep the current position.
    Hold,
    /// Reduce or exit.
    Sell,
    /// The run degraded; see the rationale and failed nodes.
    Error,
}

impl Decision {
    /// Stable uppercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Buy => "BUY",
            Decision::Hold => "HOLD",
            Decision::Sell => "SELL",
            Decision::Error => "ERROR",
        }
    }

    /// Parse a decision out of free-form text. The *last* standalone
    /// buy/sell/hold mention wins (models restate the options before
    /// concluding); anything unparseable falls back to `Hold`.
    pub fn parse(text: &str) -> Decision {
        if fields::is_error_sentinel(text.trim()) {
            return Decision::Error;
        }
        static WORD: OnceLock<regex::Regex> = OnceLock::new();
        let word = WORD.get_or_init(|| {
            regex::Regex::new(r"(?i)\b(buy|sell|hold)\b").expect("static regex")
        });
        let mut last = None;
        for caps in word.captures_iter(text) {
            last = Some(caps[1].to_lowercase());
        }
        match last.as_deref() {
            Some("buy") => Decision::Buy,
            Some("sell") => Decision::Sell,
            _ => Decision::Hold,
        }
    }
}

/// A node that failed or timed out during the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedNode {
    /// Node name.
    pub node: String,
    /// Terminal status (`failed` or `timeout`).
    pub status: NodeStatus,
}

/// Run accounting.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunMetrics {
    /// Measured wall clock in seconds.
    pub wall_clock_s: f64,
    /// Total node invocations.
    pub node_count: u32,
    /// Tokens consumed across all LLM calls (as reported by nodes).
    pub llm_token_count: u64,
    /// Nodes that failed or timed out, in completion order.
    pub failed_nodes: Vec<FailedNode>,
}

/// Supporting evidence behind the decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Evidence {
    /// Market technicals report.
    pub market: String,
    /// News report.
    pub news: String,
    /// Social sentiment report.
    pub social: String,
    /// Fundamentals report.
    pub fundamentals: String,
    /// Research debate record.
    pub research_debate: DebateRecord,
    /// Risk debate record.
    pub risk_debate: DebateRecord,
}

/// The auditable result of one `run_analysis` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionReport {
    /// Ticker analyzed.
    pub ticker: String,
    /// Trade date analyzed.
    pub trade_date: String,
    /// The decision.
    pub decision: Decision,
    /// Free-text rationale (the final decision text, or the error reason).
    pub rationale: String,
    /// Evidence trail.
    pub evidence: Evidence,
    /// Accounting.
    pub metrics: RunMetrics,
}

impl DecisionReport {
    /// Extract the report from a finished run.
    pub fn from_run(output: &RunOutput) -> Self {
        let state = &output.state;
        let decision_text = state.get_str(fields::FINAL_DECISION).unwrap_or_default();
        let decision = Decision::parse(decision_text);
        let rationale = if decision == Decision::Error {
            let reason = state.get_str(fields::ERROR_REASON).unwrap_or_default();
            if reason.is_empty() {
                decision_text.to_string()
            } else {
                reason.to_string()
            }
        } else if decision_text.is_empty() {
            "no rationale produced".to_string()
        } else {
            decision_text.to_string()
        };

        let failed_nodes = output
            .recorder
            .failed_nodes()
            .into_iter()
            .map(|(node, status)| FailedNode { node, status })
            .collect();

        DecisionReport {
            ticker: state.get_str(fields::TICKER).unwrap_or_default().to_string(),
            trade_date: state
                .get_str(fields::TRADE_DATE)
                .unwrap_or_default()
                .to_string(),
            decision,
            rationale,
            evidence: Evidence {
                market: state.get_str("market_report").unwrap_or_default().to_string(),
                news: state.get_str("news_report").unwrap_or_default().to_string(),
                social: state.get_str("social_report").unwrap_or_default().to_string(),
                fundamentals: state
                    .get_str("fundamentals_report")
                    .unwrap_or_default()
                    .to_string(),
                research_debate: DebateRecord::load(state, fields::RESEARCH_DEBATE),
                risk_debate: DebateRecord::load(state, fields::RISK_DEBATE),
            },
            metrics: RunMetrics {
                wall_clock_s: output.wall_clock.as_secs_f64(),
                node_count: output.invocations,
                llm_token_count: state.get_u64(fields::LLM_TOKEN_COUNT).unwrap_or(0),
                failed_nodes,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefers_the_concluding_mention() {
        assert_eq!(
            Decision::parse("We considered SELL but conclude: BUY on strength."),
            Decision::Buy
        );
        assert_eq!(
            Decision::parse("Options were buy, hold, sell. Final: hold."),
            Decision::Hold
        );
        assert_eq!(Decision::parse("FINAL TRANSACTION: SELL"), Decision::Sell);
    }

    #[test]
    fn parse_falls_back_to_hold() {
        assert_eq!(Decision::parse(""), Decision::Hold);
        assert_eq!(Decision::parse("the committee was undecided"), Decision::Hold);
    }

    #[test]
    fn parse_detects_error_sentinel() {
        assert_eq!(Decision::parse("ERROR"), Decision::Error);
        assert_eq!(
            Decision::parse("ERROR: analyst quorum not met"),
            Decision::Error
        );
    }

    #[test]
    fn parse_ignores_substrings_of_larger_words() {
        // "buyback" must not read as BUY, "household" not as HOLD.
        assert_eq!(Decision::parse("a large buyback program"), Decision::Hold);
        assert_eq!(Decision::parse("household names. sell"), Decision::Sell);
    }

    #[test]
    fn decision_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Decision::Buy).unwrap(), "\"BUY\"");
        assert_eq!(serde_json::to_string(&Decision::Error).unwrap(), "\"ERROR\"");
    }
}
