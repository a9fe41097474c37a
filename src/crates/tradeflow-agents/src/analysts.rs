//! Analyst nodes: one per data dimension.
//!
//! Each analyst fetches its data through the invoker (provider chain with
//! fallback), digests it, and asks the quick model for a report. The node
//! writes only its own keys — `<kind>_report`, `<kind>_tool_calls`, and
//! the shared token counter — so parallel analysts never collide.

use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

use tradeflow_core::config::AnalystKind;
use tradeflow_core::fields;
use tradeflow_core::invoker::ToolError;
use tradeflow_core::node::{NodeError, NodeSpec};
use tradeflow_core::providers::{
    Article, DataKind, DateRange, Fundamentals, Indicator, OhlcvTable, Post,
};
use tradeflow_core::state::{AnalysisState, StatePatch};

use crate::collaborators::AgentContext;
use crate::prompts;

/// Trailing window analysts look back over.
const LOOKBACK_DAYS: i64 = 30;

/// Indicator set the market analyst requests.
const MARKET_INDICATORS: [Indicator; 4] = [
    Indicator::Sma(50),
    Indicator::Ema(20),
    Indicator::Rsi(14),
    Indicator::Macd,
];

/// Build the node for one analyst kind.
pub fn analyst_node(ctx: Arc<AgentContext>, kind: AnalystKind) -> NodeSpec {
    let writes = vec![
        kind.report_field(),
        kind.tool_calls_field(),
        fields::LLM_TOKEN_COUNT.to_string(),
    ];
    NodeSpec::new(kind.node_name(), writes, move |state| {
        let ctx = ctx.clone();
        Box::pin(async move { run_analyst(ctx, kind, state).await })
    })
}

async fn run_analyst(
    ctx: Arc<AgentContext>,
    kind: AnalystKind,
    state: AnalysisState,
) -> Result<StatePatch, NodeError> {
    let ticker = state
        .get_str(fields::TICKER)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| NodeError::msg("missing ticker input"))?
        .to_string();
    let trade_date = state
        .get_str(fields::TRADE_DATE)
        .unwrap_or_default()
        .to_string();
    let date = NaiveDate::parse_from_str(&trade_date, "%Y-%m-%d")
        .map_err(|e| NodeError::msg(format!("invalid trade date '{trade_date}': {e}")))?;
    let range = DateRange::trailing(date, LOOKBACK_DAYS);

    let mut tool_calls = 0u64;
    let (role, digest) = match kind {
        AnalystKind::Market => {
            let table: OhlcvTable = ctx
                .fetch_chain(DataKind::Ohlcv, &json!({ "ticker": ticker, "range": range }), |p| {
                    let ticker = ticker.clone();
                    async move { p.fetch_ohlcv(&ticker, range).await.map_err(ToolError::from) }
                })
                .await?;
            tool_calls += 1;

            // Indicator math is CPU-bound; never run it on the event loop.
            let engine = ctx.collaborators.indicators.clone();
            let table_for_compute = table.clone();
            let indicators = ctx
                .invoker
                .offload(move || engine.compute(&table_for_compute, &MARKET_INDICATORS))
                .await?
                .map_err(ToolError::from)?;
            tool_calls += 1;

            (prompts::MARKET_ANALYST_ROLE, market_digest(&table, &indicators.values))
        }
        AnalystKind::News => {
            let articles = fetch_news(&ctx, &ticker, range).await?;
            tool_calls += 1;
            let top = ctx.compressor.top_articles(&articles);
            (prompts::NEWS_ANALYST_ROLE, news_digest(&top))
        }
        AnalystKind::Social => {
            let posts: Vec<Post> = ctx
                .fetch_chain(DataKind::Social, &json!({ "ticker": ticker }), |p| {
                    let ticker = ticker.clone();
                    async move { p.fetch_social(&ticker).await.map_err(ToolError::from) }
                })
                .await?;
            tool_calls += 1;
            (prompts::SOCIAL_ANALYST_ROLE, social_digest(&posts))
        }
        AnalystKind::Fundamentals => {
            let fundamentals: Fundamentals = ctx
                .fetch_chain(
                    DataKind::Fundamentals,
                    &json!({ "ticker": ticker }),
                    |p| {
                        let ticker = ticker.clone();
                        async move { p.fetch_fundamentals(&ticker).await.map_err(ToolError::from) }
                    },
                )
                .await?;
            tool_calls += 1;
            (
                prompts::FUNDAMENTALS_ANALYST_ROLE,
                fundamentals_digest(&fundamentals),
            )
        }
    };

    debug!(analyst = kind.as_str(), tool_calls, "data gathered, summarizing");
    let completion = ctx
        .complete(
            &ctx.llm.quick_model,
            role,
            &prompts::analyst_prompt(&ticker, &trade_date, &digest),
        )
        .await?;

    Ok(StatePatch::new()
        .with(kind.report_field(), json!(completion.content))
        .with(kind.tool_calls_field(), json!(tool_calls))
        .with(fields::LLM_TOKEN_COUNT, json!(completion.usage.total())))
}

/// News goes through the declared secondary when the primary fails or
/// returns nothing; partial results merge rather than replace.
async fn fetch_news(
    ctx: &AgentContext,
    ticker: &str,
    range: DateRange,
) -> Result<Vec<Article>, ToolError> {
    let chain = ctx.collaborators.chain(DataKind::News);
    let args = json!({ "ticker": ticker, "range": range });
    if chain.len() >= 2 {
        let primary = chain[0].clone();
        let secondary = chain[1].clone();
        let primary_endpoint = format!("{}:news", primary.name());
        let secondary_endpoint = format!("{}:news", secondary.name());
        let ticker_owned = ticker.to_string();
        ctx.invoker
            .invoke_with_fallback(
                &primary_endpoint,
                &args,
                || {
                    let p = primary.clone();
                    let ticker = ticker_owned.clone();
                    async move { p.fetch_news(&ticker, range).await.map_err(ToolError::from) }
                },
                &secondary_endpoint,
                || {
                    let p = secondary.clone();
                    let ticker = ticker_owned.clone();
                    async move { p.fetch_news(&ticker, range).await.map_err(ToolError::from) }
                },
                |articles: &Vec<Article>| articles.is_empty(),
                |mut a, b| {
                    a.extend(b);
                    a
                },
            )
            .await
    } else {
        ctx.fetch_chain(DataKind::News, &args, |p| {
            let ticker = ticker.to_string();
            async move { p.fetch_news(&ticker, range).await.map_err(ToolError::from) }
        })
        .await
    }
}

fn market_digest(table: &OhlcvTable, indicators: &std::collections::BTreeMap<String, f64>) -> String {
    let mut digest = format!("Sessions: {}\n", table.candles.len());
    if let Some(close) = table.last_close() {
        digest.push_str(&format!("Last close: {close:.2}\n"));
    }
    if let (Some(first), Some(last)) = (table.candles.first(), table.candles.last()) {
        let change = (last.close - first.close) / first.close * 100.0;
        digest.push_str(&format!("Window change: {change:.1}%\n"));
    }
    digest.push_str("Indicators:\n");
    for (label, value) in indicators {
        digest.push_str(&format!("  {label}: {value:.2}\n"));
    }
    digest
}

fn news_digest(articles: &[&Article]) -> String {
    if articles.is_empty() {
        return "No articles in window.".to_string();
    }
    articles
        .iter()
        .map(|a| format!("[{}] {} — {}", a.source, a.title, a.summary))
        .collect::<Vec<_>>()
        .join("\n")
}

fn social_digest(posts: &[Post]) -> String {
    if posts.is_empty() {
        return "No posts in window.".to_string();
    }
    let mut digest = format!("Posts: {}\n", posts.len());
    for post in posts.iter().take(10) {
        digest.push_str(&format!("({}) {}: {}\n", post.score, post.author, post.content));
    }
    digest
}

fn fundamentals_digest(f: &Fundamentals) -> String {
    let fmt = |v: Option<f64>| v.map(|x| format!("{x:.2}")).unwrap_or_else(|| "n/a".into());
    let mut digest = format!(
        "Market cap: {}\nP/E: {}\nEPS: {}\nRevenue: {}",
        fmt(f.market_cap),
        fmt(f.pe_ratio),
        fmt(f.eps),
        fmt(f.revenue),
    );
    if !f.notes.is_empty() {
        digest.push_str(&format!("\nNotes: {}", f.notes));
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use std::time::Duration;
    use tradeflow_core::config::Config;
    use tradeflow_core::node::{NodeRuntime, RunBudget, RunRecorder};
    use tradeflow_core::providers::ProviderError;
    use tradeflow_core::state::{FieldKind, MergeStrategy, StateSchema};
    use tradeflow_core::testing::{
        sample_articles, sample_fundamentals, sample_ohlcv, sample_posts, MockIndicatorEngine,
        MockLlm, MockProvider,
    };

    fn schema() -> StateSchema {
        let mut s = StateSchema::new();
        s.declare_field(fields::TICKER, FieldKind::Text, MergeStrategy::Replace);
        s.declare_field(fields::TRADE_DATE, FieldKind::Text, MergeStrategy::Replace);
        s.declare_field(fields::LLM_TOKEN_COUNT, FieldKind::Integer, MergeStrategy::Add);
        for kind in AnalystKind::all() {
            s.declare_field(kind.report_field(), FieldKind::Text, MergeStrategy::Replace);
            s.declare_field(kind.tool_calls_field(), FieldKind::Integer, MergeStrategy::Add);
            s.declare_field(
                format!("{}_status", kind.node_name()),
                FieldKind::Text,
                MergeStrategy::Replace,
            );
            s.declare_field(
                format!("{}_error", kind.node_name()),
                FieldKind::Text,
                MergeStrategy::Replace,
            );
        }
        s
    }

    fn initial_state(s: &StateSchema) -> AnalysisState {
        let state = s.initial_state().unwrap();
        s.apply_batch(
            &state,
            vec![StatePatch::new()
                .with(fields::TICKER, json!("AAPL"))
                .with(fields::TRADE_DATE, json!("2024-01-15"))],
        )
        .unwrap()
    }

    fn full_collaborators(llm: MockLlm) -> Collaborators {
        let provider = Arc::new(
            MockProvider::new("finnhub")
                .with_ohlcv(sample_ohlcv())
                .with_news(sample_articles(20))
                .with_social(sample_posts(5))
                .with_fundamentals(sample_fundamentals()),
        );
        Collaborators::new(Arc::new(llm), Arc::new(MockIndicatorEngine))
            .with_provider(DataKind::Ohlcv, provider.clone())
            .with_provider(DataKind::News, provider.clone())
            .with_provider(DataKind::Social, provider.clone())
            .with_provider(DataKind::Fundamentals, provider)
    }

    #[tokio::test]
    async fn market_analyst_produces_report_and_counters() {
        let llm = MockLlm::new("generic").respond_when("market analyst", "uptrend intact");
        let ctx = AgentContext::new(&Config::default(), full_collaborators(llm));
        let s = schema();
        let state = initial_state(&s);
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let budget = RunBudget::new(Duration::from_secs(60), 50);
        let recorder = RunRecorder::new();

        let outcome = runtime
            .run(&analyst_node(ctx, AnalystKind::Market), state.clone(), &budget, &recorder)
            .await
            .unwrap();
        let next = s.apply_batch(&state, vec![outcome.patch]).unwrap();
        assert_eq!(next.get_str("market_report"), Some("uptrend intact"));
        assert_eq!(next.get_u64("market_tool_calls"), Some(2));
        assert!(next.get_u64(fields::LLM_TOKEN_COUNT).unwrap() > 0);
        assert_eq!(next.get_str("market_analyst_status"), Some("success"));
    }

    #[tokio::test]
    async fn news_analyst_merges_fallback_when_primary_is_empty() {
        let llm = MockLlm::new("news summary");
        let empty_primary = Arc::new(MockProvider::new("finnhub").with_news(vec![]));
        let backup = Arc::new(MockProvider::new("yahoo").with_news(sample_articles(3)));
        let collaborators =
            Collaborators::new(Arc::new(llm), Arc::new(MockIndicatorEngine))
                .with_provider(DataKind::News, empty_primary)
                .with_provider(DataKind::News, backup);
        let ctx = AgentContext::new(&Config::default(), collaborators);

        let articles = fetch_news(
            &ctx,
            "AAPL",
            DateRange::trailing(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(), 30),
        )
        .await
        .unwrap();
        assert_eq!(articles.len(), 3);
    }

    #[tokio::test]
    async fn failing_provider_surfaces_as_node_failure() {
        let llm = MockLlm::new("unused");
        let broken = Arc::new(MockProvider::failing(
            "finnhub",
            ProviderError::Permanent("unknown ticker".into()),
        ));
        let collaborators = Collaborators::new(Arc::new(llm), Arc::new(MockIndicatorEngine))
            .with_provider(DataKind::Fundamentals, broken);
        let ctx = AgentContext::new(&Config::default(), collaborators);
        let s = schema();
        let state = initial_state(&s);
        let runtime = NodeRuntime::new(Duration::from_secs(5));
        let budget = RunBudget::new(Duration::from_secs(60), 50);
        let recorder = RunRecorder::new();

        let outcome = runtime
            .run(
                &analyst_node(ctx, AnalystKind::Fundamentals),
                state,
                &budget,
                &recorder,
            )
            .await
            .unwrap();
        assert_eq!(outcome.status, tradeflow_core::node::NodeStatus::Failed);
    }

    #[test]
    fn digests_render_available_data() {
        let table = sample_ohlcv();
        let mut indicators = std::collections::BTreeMap::new();
        indicators.insert("rsi_14".to_string(), 62.0);
        let digest = market_digest(&table, &indicators);
        assert!(digest.contains("Sessions: 30"));
        assert!(digest.contains("rsi_14: 62.00"));

        assert_eq!(news_digest(&[]), "No articles in window.");
        let fundamentals = sample_fundamentals();
        assert!(fundamentals_digest(&fundamentals).contains("P/E: 29.50"));
    }
}
