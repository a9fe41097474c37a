//! Context compressor — perspective-filtered views of the shared state.
//!
//! Downstream consumers (researchers, debators) must not receive the full
//! state: four analyst reports plus two debate transcripts run well past
//! what a debate prompt should carry. The compressor builds each consumer a
//! *perspective view*: a shared summary of all reports within one budget,
//! plus a perspective-specific slice (positive signals for the bull,
//! negative for the bear, risk-relevant lines for each risk debator).
//!
//! Compression is lossy but **idempotent and side-effect-free**: applying
//! it to its own output changes nothing, and the original state is never
//! touched. Idempotence comes from two rules:
//!
//! - byte truncation reserves room for its ellipsis marker, so a truncated
//!   text is always within budget and passes through unchanged;
//! - slices are filtered and truncated on *line* boundaries, so a slice
//!   re-filtered against the same markers keeps every line.
//!
//! News is reduced to the top-N articles by the ranking the provider
//! supplied; the compressor never re-ranks.

use serde::{Deserialize, Serialize};

use crate::fields;
use crate::providers::Article;
use crate::state::AnalysisState;

/// Byte budgets for compressed views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressConfig {
    /// Budget per individual report summary.
    pub report_summary_bytes: usize,
    /// Budget for the shared all-reports context.
    pub shared_budget_bytes: usize,
    /// Budget for a perspective-specific slice.
    pub slice_budget_bytes: usize,
    /// Articles kept for news-heavy stages.
    pub news_top_n: usize,
}

impl Default for CompressConfig {
    fn default() -> Self {
        Self {
            report_summary_bytes: 1024,
            shared_budget_bytes: 8192,
            slice_budget_bytes: 3072,
            news_top_n: 15,
        }
    }
}

/// The consumer a view is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Perspective {
    /// Bull researcher: positive signals emphasized.
    Bull,
    /// Bear researcher: negative signals emphasized.
    Bear,
    /// Aggressive risk debator: upside and momentum lines.
    Risky,
    /// Conservative risk debator: drawdown and caution lines.
    Safe,
    /// Neutral risk debator: balanced head of each report.
    Neutral,
}

const BULL_MARKERS: [&str; 8] = [
    "growth", "beat", "upgrade", "bullish", "record", "strong", "surge", "outperform",
];
const BEAR_MARKERS: [&str; 8] = [
    "decline", "miss", "downgrade", "bearish", "weak", "drop", "risk", "underperform",
];
const RISKY_MARKERS: [&str; 6] = ["upside", "momentum", "breakout", "surge", "growth", "volume"];
const SAFE_MARKERS: [&str; 6] = ["risk", "drawdown", "debt", "volatility", "caution", "decline"];

/// A compressed, perspective-filtered snapshot handed to one consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerspectiveView {
    /// Summary of all reports, shared across perspectives of a debate.
    pub shared: String,
    /// The perspective-specific slice.
    pub slice: String,
}

/// Builds perspective views under configured byte budgets.
#[derive(Debug, Clone, Default)]
pub struct ContextCompressor {
    cfg: CompressConfig,
}

impl ContextCompressor {
    /// Compressor with the given budgets.
    pub fn new(cfg: CompressConfig) -> Self {
        Self { cfg }
    }

    /// Build the view for `perspective` from `state`. Pure.
    pub fn compress(&self, state: &AnalysisState, perspective: Perspective) -> PerspectiveView {
        let sections = [
            ("market", state.get_str("market_report").unwrap_or_default()),
            ("news", state.get_str("news_report").unwrap_or_default()),
            ("social", state.get_str("social_report").unwrap_or_default()),
            (
                "fundamentals",
                state.get_str("fundamentals_report").unwrap_or_default(),
            ),
        ];

        let mut shared = String::new();
        for (label, text) in sections {
            if text.is_empty() {
                continue;
            }
            if !shared.is_empty() {
                shared.push_str("\n\n");
            }
            shared.push_str(&label.to_uppercase());
            shared.push_str(":\n");
            shared.push_str(&self.summarize(text));
        }
        let shared = truncate_lines(&shared, self.cfg.shared_budget_bytes);

        let combined: String = sections
            .iter()
            .map(|(_, text)| *text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n");
        let slice = self.compress_section(&combined, perspective);

        PerspectiveView { shared, slice }
    }

    /// Summarize one report to its per-report budget. Idempotent.
    pub fn summarize(&self, text: &str) -> String {
        truncate_bytes(text, self.cfg.report_summary_bytes)
    }

    /// Filter `text` down to the lines relevant to `perspective`, bounded
    /// by the slice budget. Idempotent: the output re-filtered against the
    /// same perspective is unchanged.
    pub fn compress_section(&self, text: &str, perspective: Perspective) -> String {
        let markers: &[&str] = match perspective {
            Perspective::Bull => &BULL_MARKERS,
            Perspective::Bear => &BEAR_MARKERS,
            Perspective::Risky => &RISKY_MARKERS,
            Perspective::Safe => &SAFE_MARKERS,
            Perspective::Neutral => &[],
        };

        let filtered: Vec<&str> = if markers.is_empty() {
            text.lines().collect()
        } else {
            let matching: Vec<&str> = text
                .lines()
                .filter(|line| {
                    let lowered = line.to_lowercase();
                    markers.iter().any(|m| lowered.contains(m))
                })
                .collect();
            // Nothing matched: keep the whole text rather than handing the
            // debator an empty context.
            if matching.is_empty() {
                text.lines().collect()
            } else {
                matching
            }
        };

        truncate_lines(&filtered.join("\n"), self.cfg.slice_budget_bytes)
    }

    /// Top-N articles by the input ranking (lower rank first, stable).
    /// No re-ranking.
    pub fn top_articles<'a>(&self, articles: &'a [Article]) -> Vec<&'a Article> {
        let mut selected: Vec<&Article> = articles.iter().collect();
        selected.sort_by_key(|a| a.rank);
        selected.truncate(self.cfg.news_top_n);
        selected
    }
}

/// Truncate to at most `budget` bytes at a char boundary, appending an
/// ellipsis. Room for the marker is reserved inside the budget, so output
/// length never exceeds `budget` and re-truncation is a no-op.
pub fn truncate_bytes(text: &str, budget: usize) -> String {
    const MARKER: &str = "…";
    if text.len() <= budget {
        return text.to_string();
    }
    if budget <= MARKER.len() {
        return String::new();
    }
    let mut cut = budget - MARKER.len();
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &text[..cut], MARKER)
}

/// Keep whole leading lines while the total stays within `budget` bytes.
/// Never cuts mid-line, so re-application is a no-op.
pub fn truncate_lines(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut kept = String::new();
    for line in text.lines() {
        let extra = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + extra > budget {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
    }
    kept
}

/// Compact debate context: the shared history tail within `budget` bytes.
pub fn history_tail(history: &str, budget: usize) -> String {
    if history.len() <= budget {
        return history.to_string();
    }
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0usize;
    for line in history.lines().rev() {
        let extra = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if used + extra > budget {
            break;
        }
        used += extra;
        kept.push(line);
    }
    kept.reverse();
    kept.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{FieldKind, MergeStrategy, StatePatch, StateSchema};
    use serde_json::json;

    fn state_with_reports() -> AnalysisState {
        let mut s = StateSchema::new();
        for field in [
            "market_report",
            "news_report",
            "social_report",
            "fundamentals_report",
        ] {
            s.declare_field(field, FieldKind::Text, MergeStrategy::Replace);
        }
        let state = s.initial_state().unwrap();
        s.apply_batch(
            &state,
            vec![StatePatch::new()
                .with(
                    "market_report",
                    json!("Strong uptrend with record volume.\nSome risk of pullback near resistance."),
                )
                .with("news_report", json!("Earnings beat expectations.\nAnalyst downgrade from one bank."))
                .with("social_report", json!("Bullish chatter is growing.\nA few bearish threads on debt."))
                .with("fundamentals_report", json!("Revenue growth 12% YoY.\nDebt load is a decline risk."))],
        )
        .unwrap()
    }

    #[test]
    fn bull_slice_keeps_positive_lines() {
        let compressor = ContextCompressor::default();
        let view = compressor.compress(&state_with_reports(), Perspective::Bull);
        assert!(view.slice.contains("Strong uptrend"));
        assert!(view.slice.contains("growth"));
        assert!(!view.slice.contains("downgrade"));
    }

    #[test]
    fn bear_slice_is_symmetric() {
        let compressor = ContextCompressor::default();
        let view = compressor.compress(&state_with_reports(), Perspective::Bear);
        assert!(view.slice.contains("downgrade"));
        assert!(view.slice.contains("risk"));
        assert!(!view.slice.contains("Earnings beat"));
    }

    #[test]
    fn compression_is_idempotent_per_perspective() {
        let compressor = ContextCompressor::default();
        for perspective in [
            Perspective::Bull,
            Perspective::Bear,
            Perspective::Risky,
            Perspective::Safe,
            Perspective::Neutral,
        ] {
            let state = state_with_reports();
            let combined = [
                state.get_str("market_report").unwrap(),
                state.get_str("news_report").unwrap(),
                state.get_str("social_report").unwrap(),
                state.get_str("fundamentals_report").unwrap(),
            ]
            .join("\n");
            let once = compressor.compress_section(&combined, perspective);
            let twice = compressor.compress_section(&once, perspective);
            assert_eq!(once, twice, "perspective {perspective:?} not idempotent");
        }
    }

    #[test]
    fn summarize_is_idempotent_at_any_budget() {
        for budget in [8usize, 64, 1024] {
            let compressor = ContextCompressor::new(CompressConfig {
                report_summary_bytes: budget,
                ..Default::default()
            });
            let text = "long report ".repeat(100);
            let once = compressor.summarize(&text);
            assert!(once.len() <= budget);
            assert_eq!(compressor.summarize(&once), once);
        }
    }

    #[test]
    fn truncate_bytes_respects_char_boundaries() {
        let text = "ααααααααααα"; // 2 bytes per char
        let out = truncate_bytes(text, 10);
        assert!(out.len() <= 10);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn truncate_lines_never_cuts_mid_line() {
        let text = "first line\nsecond line\nthird line";
        let out = truncate_lines(text, 22);
        assert_eq!(out, "first line\nsecond line");
        assert_eq!(truncate_lines(&out, 22), out);
    }

    #[test]
    fn top_articles_honors_input_rank_without_reranking() {
        let articles: Vec<Article> = (0..20)
            .map(|i| Article {
                title: format!("article {i}"),
                source: "wire".into(),
                published_at: None,
                summary: String::new(),
                rank: (20 - i) as u32,
            })
            .collect();
        let compressor = ContextCompressor::default();
        let top = compressor.top_articles(&articles);
        assert_eq!(top.len(), 15);
        assert_eq!(top[0].rank, 1);
        assert!(top.windows(2).all(|w| w[0].rank <= w[1].rank));
    }

    #[test]
    fn history_tail_keeps_most_recent_lines() {
        let history = "r1: a\nr2: b\nr3: c";
        let tail = history_tail(history, 11);
        assert_eq!(tail, "r2: b\nr3: c");
        assert_eq!(history_tail(history, 5), "r3: c");
    }

    #[test]
    fn original_state_is_unchanged() {
        let state = state_with_reports();
        let before = state.get_str("market_report").unwrap().to_string();
        let compressor = ContextCompressor::default();
        let _ = compressor.compress(&state, Perspective::Bull);
        assert_eq!(state.get_str("market_report").unwrap(), before);
    }
}
