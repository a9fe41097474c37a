//! Data-provider and indicator-engine collaborator traits.
//!
//! Market, news, social and fundamentals data come from external async HTTP
//! clients that the core consumes behind [`DataProvider`]. A provider
//! implements the kinds it supports and leaves the rest at the default
//! (`unsupported`), which the invoker's fallback chain skips past.
//! Recoverable conditions are typed [`ProviderError`]s, never panics.
//!
//! Technical indicators are CPU-bound numeric work ([`IndicatorEngine`] is
//! a synchronous trait); callers must route `compute` through
//! [`ToolInvoker::offload`](crate::invoker::ToolInvoker::offload) so it runs
//! on a worker thread instead of the event loop.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::invoker::ErrorClass;

/// The four data dimensions an analyst can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    /// Price/volume history.
    Ohlcv,
    /// News articles.
    News,
    /// Social posts.
    Social,
    /// Company fundamentals.
    Fundamentals,
}

impl DataKind {
    /// Stable lowercase name, used as endpoint key and config key.
    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Ohlcv => "ohlcv",
            DataKind::News => "news",
            DataKind::Social => "social",
            DataKind::Fundamentals => "fundamentals",
        }
    }
}

/// Inclusive date range for a fetch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DateRange {
    /// First day, inclusive.
    pub start: NaiveDate,
    /// Last day, inclusive.
    pub end: NaiveDate,
}

impl DateRange {
    /// Range ending at `end`, spanning `days` calendar days.
    pub fn trailing(end: NaiveDate, days: i64) -> Self {
        Self {
            start: end - chrono::Duration::days(days.max(0)),
            end,
        }
    }
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    /// Trading day.
    pub date: NaiveDate,
    /// Opening price.
    pub open: f64,
    /// Session high.
    pub high: f64,
    /// Session low.
    pub low: f64,
    /// Closing price.
    pub close: f64,
    /// Shares traded.
    pub volume: u64,
}

/// Price/volume table for one ticker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OhlcvTable {
    /// Candles in ascending date order.
    pub candles: Vec<Candle>,
}

impl OhlcvTable {
    /// Most recent close, if any data was returned.
    pub fn last_close(&self) -> Option<f64> {
        self.candles.last().map(|c| c.close)
    }
}

/// A news article. `rank` is the upstream relevance ranking; the compressor
/// honors it and never re-ranks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    /// Headline.
    pub title: String,
    /// Publishing outlet.
    pub source: String,
    /// Publication day, when known.
    pub published_at: Option<NaiveDate>,
    /// Body or abstract.
    pub summary: String,
    /// Upstream relevance rank, lower is more relevant.
    pub rank: u32,
}

/// A social post.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    /// Author handle.
    pub author: String,
    /// Post body.
    pub content: String,
    /// Platform score (upvotes, likes).
    pub score: i64,
}

/// Company fundamentals snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Fundamentals {
    /// Market capitalization in USD.
    pub market_cap: Option<f64>,
    /// Trailing P/E.
    pub pe_ratio: Option<f64>,
    /// Earnings per share.
    pub eps: Option<f64>,
    /// Trailing-twelve-month revenue in USD.
    pub revenue: Option<f64>,
    /// Free-form provider notes.
    pub notes: String,
}

/// Typed, recoverable provider failures.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// 5xx, timeout, rate limit — retryable.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// 4xx, auth failure, unknown ticker — not retryable.
    #[error("permanent provider error: {0}")]
    Permanent(String),

    /// This provider does not serve the requested data kind; the fallback
    /// chain moves on without retrying.
    #[error("provider '{provider}' does not support {kind}")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Requested data kind name.
        kind: &'static str,
    },
}

impl ProviderError {
    /// Retry classification for the invoker.
    pub fn class(&self) -> ErrorClass {
        match self {
            ProviderError::Transient(_) => ErrorClass::Transient,
            ProviderError::Permanent(_) | ProviderError::Unsupported { .. } => {
                ErrorClass::Permanent
            }
        }
    }

    fn unsupported(provider: &str, kind: DataKind) -> Self {
        ProviderError::Unsupported {
            provider: provider.to_string(),
            kind: kind.as_str(),
        }
    }
}

/// Async market-data source. All methods are non-blocking; providers wrap
/// their own HTTP stack. Implement only the kinds the upstream API serves.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Provider name for endpoint keys, circuit breakers and logs.
    fn name(&self) -> &str;

    /// Price/volume history for `ticker` over `range`.
    async fn fetch_ohlcv(&self, _ticker: &str, _range: DateRange) -> Result<OhlcvTable, ProviderError> {
        Err(ProviderError::unsupported(self.name(), DataKind::Ohlcv))
    }

    /// News about `ticker` over `range`, ranked by upstream relevance.
    async fn fetch_news(&self, _ticker: &str, _range: DateRange) -> Result<Vec<Article>, ProviderError> {
        Err(ProviderError::unsupported(self.name(), DataKind::News))
    }

    /// Recent social posts mentioning `ticker`.
    async fn fetch_social(&self, _ticker: &str) -> Result<Vec<Post>, ProviderError> {
        Err(ProviderError::unsupported(self.name(), DataKind::Social))
    }

    /// Fundamentals snapshot for `ticker`.
    async fn fetch_fundamentals(&self, _ticker: &str) -> Result<Fundamentals, ProviderError> {
        Err(ProviderError::unsupported(self.name(), DataKind::Fundamentals))
    }
}

/// A technical indicator request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Indicator {
    /// Simple moving average over `0` days.
    Sma(usize),
    /// Exponential moving average over `0` days.
    Ema(usize),
    /// Relative strength index over `0` days.
    Rsi(usize),
    /// MACD (12/26/9).
    Macd,
}

/// Computed indicator values keyed by a stable label ("sma_50", "rsi_14").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Indicators {
    /// Label → latest value.
    pub values: BTreeMap<String, f64>,
}

/// CPU-bound indicator computation. Synchronous by design — callers must
/// offload it to a worker thread; invoking it directly on the event loop is
/// a defect.
pub trait IndicatorEngine: Send + Sync {
    /// Compute `indicators` over `ohlcv`.
    fn compute(&self, ohlcv: &OhlcvTable, indicators: &[Indicator]) -> Result<Indicators, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NewsOnly;

    #[async_trait]
    impl DataProvider for NewsOnly {
        fn name(&self) -> &str {
            "newsonly"
        }

        async fn fetch_news(
            &self,
            _ticker: &str,
            _range: DateRange,
        ) -> Result<Vec<Article>, ProviderError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn unimplemented_kinds_report_unsupported() {
        let p = NewsOnly;
        let range = DateRange::trailing(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(), 30);
        let err = p.fetch_ohlcv("AAPL", range).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported { .. }));
        assert_eq!(err.class(), ErrorClass::Permanent);
        assert!(p.fetch_news("AAPL", range).await.is_ok());
    }

    #[test]
    fn trailing_range_spans_backwards() {
        let end = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let range = DateRange::trailing(end, 14);
        assert_eq!(range.start, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(range.end, end);
    }
}
