//! Role instructions and prompt assembly.
//!
//! The runtime fixes *where* context is injected and the contract each
//! prompt must satisfy, not the wording: every prompt names the ticker and
//! trade date, analysts receive their fetched data digest, debators
//! receive a compressed perspective view plus the debate history, and
//! judges are required to state a quality score out of 10 and an explicit
//! consensus phrase when the sides have converged, concluding with BUY,
//! HOLD, or SELL.

use tradeflow_core::compress::PerspectiveView;
use tradeflow_core::debate::DebateRecord;

pub const MARKET_ANALYST_ROLE: &str = "You are the market analyst on a trading research desk. \
Summarize the price action and technical indicators you are given into a concise report of the \
current technical picture. Report only what the data supports.";

pub const NEWS_ANALYST_ROLE: &str = "You are the news analyst on a trading research desk. \
Summarize the supplied headlines into a report of the news flow relevant to the ticker, noting \
catalysts and risks. Report only what the articles support.";

pub const SOCIAL_ANALYST_ROLE: &str = "You are the social sentiment analyst on a trading research \
desk. Summarize the supplied posts into a report of retail sentiment and its direction.";

pub const FUNDAMENTALS_ANALYST_ROLE: &str = "You are the fundamentals analyst on a trading \
research desk. Summarize the supplied financial snapshot into a report on valuation and balance \
sheet quality.";

pub const BULL_RESEARCHER_ROLE: &str = "You are the bull researcher in an investment debate. \
Argue the strongest evidence-based case for buying, directly countering the bear's latest \
argument.";

pub const BEAR_RESEARCHER_ROLE: &str = "You are the bear researcher in an investment debate. \
Argue the strongest evidence-based case against buying, directly countering the bull's latest \
argument.";

pub const RESEARCH_MANAGER_ROLE: &str = "You are the research manager judging a bull/bear \
debate. Weigh both argument histories, state a debate quality score out of 10, and if the sides \
have converged say so explicitly (e.g. 'consensus reached'). Conclude with an investment plan \
and a BUY, HOLD, or SELL recommendation.";

pub const TRADER_ROLE: &str = "You are the trader. Turn the investment plan into a concrete \
trade plan: direction, sizing approach, entry and exit conditions. Conclude with BUY, HOLD, or \
SELL.";

pub const RISKY_DEBATOR_ROLE: &str = "You are the aggressive risk debator. Argue for taking the \
opportunity, emphasizing upside the trade plan leaves on the table.";

pub const SAFE_DEBATOR_ROLE: &str = "You are the conservative risk debator. Argue for protecting \
capital, emphasizing drawdown and exposure the trade plan underweights.";

pub const NEUTRAL_DEBATOR_ROLE: &str = "You are the neutral risk debator. Weigh both risk \
positions and argue for the balanced course.";

pub const RISK_MANAGER_ROLE: &str = "You are the risk manager judging the risk debate. Weigh all \
three perspectives against the trade plan, state a debate quality score out of 10, say so \
explicitly if the perspectives have converged, and conclude with the final BUY, HOLD, or SELL \
decision and its rationale.";

/// Header naming the run's subject, injected into every prompt.
pub fn subject_line(ticker: &str, trade_date: &str) -> String {
    format!("Ticker: {ticker}\nTrade date: {trade_date}")
}

/// Analyst user prompt: subject plus the fetched data digest.
pub fn analyst_prompt(ticker: &str, trade_date: &str, digest: &str) -> String {
    format!("{}\n\nData:\n{digest}", subject_line(ticker, trade_date))
}

/// Debator user prompt: subject, shared context, perspective slice, the
/// debate so far, and the opponent's latest argument.
pub fn debator_prompt(
    ticker: &str,
    trade_date: &str,
    view: &PerspectiveView,
    record: &DebateRecord,
    opponent_latest: &str,
) -> String {
    let mut prompt = format!(
        "{}\n\nShared context:\n{}\n\nYour angle:\n{}",
        subject_line(ticker, trade_date),
        view.shared,
        view.slice,
    );
    if !record.history.is_empty() {
        prompt.push_str("\n\nDebate so far:\n");
        prompt.push_str(&record.history);
    }
    if !opponent_latest.is_empty() {
        prompt.push_str("\n\nCounter this argument:\n");
        prompt.push_str(opponent_latest);
    }
    prompt
}

/// Judge user prompt: subject plus the full debate history.
pub fn judge_prompt(ticker: &str, trade_date: &str, record: &DebateRecord) -> String {
    format!(
        "{}\n\nRound {} complete. Debate history:\n{}",
        subject_line(ticker, trade_date),
        record.round_count,
        record.history,
    )
}

/// Trader user prompt: subject, the investment plan, and the report
/// summaries.
pub fn trader_prompt(ticker: &str, trade_date: &str, plan: &str, context: &str) -> String {
    format!(
        "{}\n\nInvestment plan:\n{plan}\n\nSupporting context:\n{context}",
        subject_line(ticker, trade_date)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_prompt_names_the_subject() {
        let record = DebateRecord::default();
        let view = PerspectiveView {
            shared: "shared".into(),
            slice: "slice".into(),
        };
        for prompt in [
            analyst_prompt("AAPL", "2024-01-15", "digest"),
            debator_prompt("AAPL", "2024-01-15", &view, &record, ""),
            judge_prompt("AAPL", "2024-01-15", &record),
            trader_prompt("AAPL", "2024-01-15", "plan", "ctx"),
        ] {
            assert!(prompt.contains("AAPL"));
            assert!(prompt.contains("2024-01-15"));
        }
    }

    #[test]
    fn debator_prompt_includes_history_and_counter_only_when_present() {
        let view = PerspectiveView {
            shared: "s".into(),
            slice: "p".into(),
        };
        let empty = DebateRecord::default();
        let first_round = debator_prompt("AAPL", "2024-01-15", &view, &empty, "");
        assert!(!first_round.contains("Debate so far"));
        assert!(!first_round.contains("Counter this argument"));

        let mut record = DebateRecord::default();
        record.history = "bull_researcher: up".into();
        let later = debator_prompt("AAPL", "2024-01-15", &view, &record, "down");
        assert!(later.contains("Debate so far"));
        assert!(later.contains("Counter this argument:\ndown"));
    }
}
