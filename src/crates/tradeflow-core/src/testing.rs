//! Mock collaborators for tests.
//!
//! The integration suite drives the full graph against these mocks: a
//! keyword-scripted [`MockLlm`], a canned-data [`MockProvider`], and a
//! fixed-value [`MockIndicatorEngine`]. All are deterministic, which is
//! what makes the determinism law testable (two runs with identical config
//! and inputs produce identical reports).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::llm::{ChatRequest, Completion, LlmClient, LlmError, TokenUsage};
use crate::providers::{
    Article, Candle, DataProvider, DateRange, Fundamentals, Indicator, IndicatorEngine,
    Indicators, OhlcvTable, Post, ProviderError,
};

enum MockOutcome {
    Respond(String),
    Fail(LlmError),
}

struct Rule {
    needle: String,
    outcome: MockOutcome,
    delay: Option<Duration>,
}

/// Scripted LLM: the first rule whose needle appears (case-insensitively)
/// in the request's message contents decides the outcome. Rules can add a
/// per-rule delay, which is how tests make one analyst slow while its
/// siblings stay fast.
#[derive(Default)]
pub struct MockLlm {
    rules: Vec<Rule>,
    default_response: String,
    latency: Option<Duration>,
    calls: AtomicU64,
    prompts: Mutex<Vec<String>>,
}

impl MockLlm {
    /// Mock answering every request with `default_response`.
    pub fn new(default_response: impl Into<String>) -> Self {
        Self {
            default_response: default_response.into(),
            ..Default::default()
        }
    }

    /// Respond with `response` when `needle` appears in the prompt.
    pub fn respond_when(mut self, needle: impl Into<String>, response: impl Into<String>) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            outcome: MockOutcome::Respond(response.into()),
            delay: None,
        });
        self
    }

    /// Like [`respond_when`](Self::respond_when), but the response arrives
    /// after `delay`.
    pub fn respond_when_delayed(
        mut self,
        needle: impl Into<String>,
        response: impl Into<String>,
        delay: Duration,
    ) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            outcome: MockOutcome::Respond(response.into()),
            delay: Some(delay),
        });
        self
    }

    /// Add a fixed latency to every call (budget-exhaustion tests).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail with `error` when `needle` appears in the prompt.
    pub fn fail_when(mut self, needle: impl Into<String>, error: LlmError) -> Self {
        self.rules.push(Rule {
            needle: needle.into(),
            outcome: MockOutcome::Fail(error),
            delay: None,
        });
        self
    }

    /// Number of completed calls.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts seen so far (joined message contents per call).
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn complete(&self, request: ChatRequest) -> Result<Completion, LlmError> {
        let haystack = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
            .to_lowercase();

        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(haystack.clone());

        let matched = self
            .rules
            .iter()
            .find(|rule| haystack.contains(&rule.needle.to_lowercase()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(delay) = matched.and_then(|r| r.delay) {
            tokio::time::sleep(delay).await;
        }

        let content = match matched.map(|r| &r.outcome) {
            Some(MockOutcome::Fail(err)) => return Err(err.clone()),
            Some(MockOutcome::Respond(text)) => text.clone(),
            None => self.default_response.clone(),
        };

        // Deterministic, roughly 4-bytes-per-token accounting.
        let usage = TokenUsage {
            prompt_tokens: (haystack.len() / 4) as u64,
            completion_tokens: (content.len() / 4) as u64,
        };
        Ok(Completion { content, usage })
    }
}

/// Canned-data provider. Configure the kinds it serves; unset kinds report
/// `Unsupported`, and `failing` makes every kind return the given error.
pub struct MockProvider {
    name: String,
    ohlcv: Option<OhlcvTable>,
    news: Option<Vec<Article>>,
    social: Option<Vec<Post>>,
    fundamentals: Option<Fundamentals>,
    fail_with: Option<ProviderError>,
}

impl MockProvider {
    /// Provider named `name` serving nothing yet.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ohlcv: None,
            news: None,
            social: None,
            fundamentals: None,
            fail_with: None,
        }
    }

    /// Provider that fails every fetch with `error`.
    pub fn failing(name: impl Into<String>, error: ProviderError) -> Self {
        Self {
            fail_with: Some(error),
            ..Self::new(name)
        }
    }

    /// Serve this OHLCV table.
    pub fn with_ohlcv(mut self, table: OhlcvTable) -> Self {
        self.ohlcv = Some(table);
        self
    }

    /// Serve these articles.
    pub fn with_news(mut self, articles: Vec<Article>) -> Self {
        self.news = Some(articles);
        self
    }

    /// Serve these posts.
    pub fn with_social(mut self, posts: Vec<Post>) -> Self {
        self.social = Some(posts);
        self
    }

    /// Serve these fundamentals.
    pub fn with_fundamentals(mut self, fundamentals: Fundamentals) -> Self {
        self.fundamentals = Some(fundamentals);
        self
    }

    fn check_failure(&self) -> Result<(), ProviderError> {
        match &self.fail_with {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_ohlcv(&self, _ticker: &str, _range: DateRange) -> Result<OhlcvTable, ProviderError> {
        self.check_failure()?;
        self.ohlcv.clone().ok_or_else(|| ProviderError::Permanent(
            format!("mock '{}' has no ohlcv data", self.name),
        ))
    }

    async fn fetch_news(&self, _ticker: &str, _range: DateRange) -> Result<Vec<Article>, ProviderError> {
        self.check_failure()?;
        self.news.clone().ok_or_else(|| ProviderError::Permanent(
            format!("mock '{}' has no news data", self.name),
        ))
    }

    async fn fetch_social(&self, _ticker: &str) -> Result<Vec<Post>, ProviderError> {
        self.check_failure()?;
        self.social.clone().ok_or_else(|| ProviderError::Permanent(
            format!("mock '{}' has no social data", self.name),
        ))
    }

    async fn fetch_fundamentals(&self, _ticker: &str) -> Result<Fundamentals, ProviderError> {
        self.check_failure()?;
        self.fundamentals.clone().ok_or_else(|| ProviderError::Permanent(
            format!("mock '{}' has no fundamentals data", self.name),
        ))
    }
}

/// Fixed-value indicator engine: every requested indicator maps to 50.0.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockIndicatorEngine;

impl IndicatorEngine for MockIndicatorEngine {
    fn compute(
        &self,
        _ohlcv: &OhlcvTable,
        indicators: &[Indicator],
    ) -> Result<Indicators, ProviderError> {
        let mut out = Indicators::default();
        for indicator in indicators {
            let label = match indicator {
                Indicator::Sma(n) => format!("sma_{n}"),
                Indicator::Ema(n) => format!("ema_{n}"),
                Indicator::Rsi(n) => format!("rsi_{n}"),
                Indicator::Macd => "macd".to_string(),
            };
            out.values.insert(label, 50.0);
        }
        Ok(out)
    }
}

/// A flat 30-day OHLCV table ending 2024-01-15.
pub fn sample_ohlcv() -> OhlcvTable {
    let end = chrono::NaiveDate::from_ymd_opt(2024, 1, 15).expect("valid date");
    let candles = (0..30)
        .rev()
        .map(|i| Candle {
            date: end - chrono::Duration::days(i),
            open: 100.0,
            high: 102.0,
            low: 99.0,
            close: 101.0,
            volume: 1_000_000,
        })
        .collect();
    OhlcvTable { candles }
}

/// `n` ranked sample articles.
pub fn sample_articles(n: usize) -> Vec<Article> {
    (0..n)
        .map(|i| Article {
            title: format!("headline {i}"),
            source: "wire".to_string(),
            published_at: chrono::NaiveDate::from_ymd_opt(2024, 1, 14),
            summary: "earnings beat expectations".to_string(),
            rank: i as u32 + 1,
        })
        .collect()
}

/// `n` sample posts.
pub fn sample_posts(n: usize) -> Vec<Post> {
    (0..n)
        .map(|i| Post {
            author: format!("user{i}"),
            content: "bullish on this one".to_string(),
            score: 10 + i as i64,
        })
        .collect()
}

/// Plausible sample fundamentals.
pub fn sample_fundamentals() -> Fundamentals {
    Fundamentals {
        market_cap: Some(2.9e12),
        pe_ratio: Some(29.5),
        eps: Some(6.42),
        revenue: Some(3.8e11),
        notes: "stable margins".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Message;

    #[tokio::test]
    async fn rules_match_on_prompt_content() {
        let llm = MockLlm::new("generic answer")
            .respond_when("bull researcher", "growth looks strong")
            .fail_when("broken", LlmError::Permanent("401".into()));

        let bull = llm
            .complete(ChatRequest::new(
                "quick",
                vec![Message::system("You are the bull researcher.")],
            ))
            .await
            .unwrap();
        assert_eq!(bull.content, "growth looks strong");

        let fallback = llm
            .complete(ChatRequest::new("quick", vec![Message::user("hello")]))
            .await
            .unwrap();
        assert_eq!(fallback.content, "generic answer");

        let err = llm
            .complete(ChatRequest::new("quick", vec![Message::user("broken call")]))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Permanent(_)));
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn failing_provider_fails_every_kind() {
        let provider = MockProvider::failing("finnhub", ProviderError::Permanent("403".into()));
        let range = DateRange::trailing(
            chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            30,
        );
        assert!(provider.fetch_ohlcv("AAPL", range).await.is_err());
        assert!(provider.fetch_news("AAPL", range).await.is_err());
        assert!(provider.fetch_social("AAPL").await.is_err());
        assert!(provider.fetch_fundamentals("AAPL").await.is_err());
    }

    #[test]
    fn indicator_engine_labels_are_stable() {
        let engine = MockIndicatorEngine;
        let out = engine
            .compute(
                &sample_ohlcv(),
                &[Indicator::Sma(50), Indicator::Rsi(14), Indicator::Macd],
            )
            .unwrap();
        assert_eq!(out.values.len(), 3);
        assert!(out.values.contains_key("sma_50"));
        assert!(out.values.contains_key("rsi_14"));
        assert!(out.values.contains_key("macd"));
    }
}
