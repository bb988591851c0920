//! Market data capability and Yahoo Finance adapter
//!
//! Typed access to quote search, fundamentals, price history and analyst
//! ratings. The live adapter targets the public Yahoo Finance JSON
//! endpoints; tests use `MockMarketData`.

use crate::error::WorkflowError;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{debug, info};

/// One quote-search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockMatch {
    pub symbol: String,
    pub name: String,
    pub exchange: String,
}

/// Fundamentals snapshot for a single ticker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StockInfo {
    pub symbol: String,
    pub name: String,
    pub current_price: f64,
    pub previous_close: f64,
    pub open: f64,
    pub day_high: f64,
    pub day_low: f64,
    pub market_cap: f64,
    pub pe_ratio: Option<f64>,
    pub forward_pe: Option<f64>,
    pub dividend_yield: f64,
    #[serde(rename = "52week_high")]
    pub week52_high: f64,
    #[serde(rename = "52week_low")]
    pub week52_low: f64,
    pub volume: u64,
    pub avg_volume: u64,
    pub sector: String,
    pub industry: String,
    pub country: String,
    pub website: String,
    pub summary: String,
}

/// One OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricePoint {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Aggregated analyst view for a ticker.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RatingsSummary {
    pub recommendation: String,
    pub analyst_count: u32,
    pub target_mean: Option<f64>,
    pub target_low: Option<f64>,
    pub target_high: Option<f64>,
    pub current_price: f64,
}

/// Trait for market data access
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<StockMatch>>;
    async fn get_info(&self, ticker: &str) -> Result<StockInfo>;
    async fn get_history(
        &self,
        ticker: &str,
        period: &str,
        interval: &str,
    ) -> Result<Vec<PricePoint>>;
    async fn get_ratings(&self, ticker: &str) -> Result<RatingsSummary>;
}

/// Live adapter over the public Yahoo Finance endpoints.
#[derive(Clone)]
pub struct YahooFinanceClient {
    client: Client,
    base_url: String,
}

impl YahooFinanceClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .user_agent("Mozilla/5.0 (compatible; financial-qa-orchestrator)")
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: env::var("MARKET_DATA_BASE_URL")
                .unwrap_or_else(|_| "https://query1.finance.yahoo.com".to_string()),
        }
    }

    /// Request builder for an endpoint path; reqwest percent-encodes the
    /// query pairs (tickers like 삼성전자 search terms included).
    fn request(&self, path: &str, query: &[(&str, &str)]) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let response = self.request(path, query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Tool(format!(
                "Market data endpoint returned {}: {}",
                status, body
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| WorkflowError::Tool(format!("Invalid market data response: {}", e)))
    }
}

impl Default for YahooFinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketData for YahooFinanceClient {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<StockMatch>> {
        info!(query = %query, "Searching quotes");

        let count = max_results.to_string();
        let response: SearchResponse = self
            .get_json(
                "/v1/finance/search",
                &[("q", query), ("quotesCount", &count), ("newsCount", "0")],
            )
            .await?;

        Ok(response
            .quotes
            .into_iter()
            .take(max_results)
            .map(|q| StockMatch {
                name: q
                    .longname
                    .or(q.shortname)
                    .unwrap_or_else(|| "이름 없음".to_string()),
                exchange: q.exchange.unwrap_or_else(|| "거래소 정보 없음".to_string()),
                symbol: q.symbol,
            })
            .collect())
    }

    async fn get_info(&self, ticker: &str) -> Result<StockInfo> {
        info!(ticker = %ticker, "Fetching stock info");

        let response: QuoteSummaryResponse = self
            .get_json(
                &format!("/v10/finance/quoteSummary/{}", ticker),
                &[("modules", "price,summaryDetail,assetProfile,financialData")],
            )
            .await?;

        let result = response
            .quote_summary
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .ok_or_else(|| {
                WorkflowError::Tool(format!("No quote summary returned for {}", ticker))
            })?;

        let price = result.price.unwrap_or_default();
        let detail = result.summary_detail.unwrap_or_default();
        let profile = result.asset_profile.unwrap_or_default();

        Ok(StockInfo {
            symbol: price.symbol.unwrap_or_else(|| ticker.to_string()),
            name: price
                .long_name
                .or(price.short_name)
                .unwrap_or_else(|| "N/A".to_string()),
            current_price: price.regular_market_price.value(),
            previous_close: price.regular_market_previous_close.value(),
            open: price.regular_market_open.value(),
            day_high: price.regular_market_day_high.value(),
            day_low: price.regular_market_day_low.value(),
            market_cap: price.market_cap.value(),
            pe_ratio: detail.trailing_pe.raw,
            forward_pe: detail.forward_pe.raw,
            dividend_yield: detail.dividend_yield.value(),
            week52_high: detail.fifty_two_week_high.value(),
            week52_low: detail.fifty_two_week_low.value(),
            volume: price.regular_market_volume.value() as u64,
            avg_volume: detail.average_volume.value() as u64,
            sector: profile.sector.unwrap_or_else(|| "N/A".to_string()),
            industry: profile.industry.unwrap_or_else(|| "N/A".to_string()),
            country: profile.country.unwrap_or_else(|| "N/A".to_string()),
            website: profile.website.unwrap_or_else(|| "N/A".to_string()),
            summary: profile
                .long_business_summary
                .unwrap_or_else(|| "N/A".to_string()),
        })
    }

    async fn get_history(
        &self,
        ticker: &str,
        period: &str,
        interval: &str,
    ) -> Result<Vec<PricePoint>> {
        info!(ticker = %ticker, period = %period, interval = %interval, "Fetching price history");

        let response: ChartResponse = self
            .get_json(
                &format!("/v8/finance/chart/{}", ticker),
                &[("range", period), ("interval", interval)],
            )
            .await?;

        let data = response
            .chart
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .ok_or_else(|| {
                WorkflowError::Tool(format!("No price history returned for {}", ticker))
            })?;

        let timestamps = data.timestamp.unwrap_or_default();
        let quote = data
            .indicators
            .quote
            .into_iter()
            .next()
            .unwrap_or_default();

        let mut points = Vec::with_capacity(timestamps.len());
        for (i, ts) in timestamps.iter().enumerate() {
            let Some(date) = Utc.timestamp_opt(*ts, 0).single() else {
                continue;
            };
            points.push(PricePoint {
                date,
                open: series_at(&quote.open, i),
                high: series_at(&quote.high, i),
                low: series_at(&quote.low, i),
                close: series_at(&quote.close, i),
                volume: quote
                    .volume
                    .as_ref()
                    .and_then(|v| v.get(i).copied().flatten())
                    .unwrap_or(0),
            });
        }

        debug!(ticker = %ticker, rows = points.len(), "Price history fetched");
        Ok(points)
    }

    async fn get_ratings(&self, ticker: &str) -> Result<RatingsSummary> {
        info!(ticker = %ticker, "Fetching analyst ratings");

        let response: QuoteSummaryResponse = self
            .get_json(
                &format!("/v10/finance/quoteSummary/{}", ticker),
                &[("modules", "financialData")],
            )
            .await?;

        let financial = response
            .quote_summary
            .result
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) })
            .and_then(|r| r.financial_data)
            .ok_or_else(|| {
                WorkflowError::Tool(format!("No analyst data returned for {}", ticker))
            })?;

        Ok(RatingsSummary {
            recommendation: financial
                .recommendation_key
                .unwrap_or_else(|| "N/A".to_string()),
            analyst_count: financial.number_of_analyst_opinions.value() as u32,
            target_mean: financial.target_mean_price.raw,
            target_low: financial.target_low_price.raw,
            target_high: financial.target_high_price.raw,
            current_price: financial.current_price.value(),
        })
    }
}

fn series_at(series: &Option<Vec<Option<f64>>>, i: usize) -> f64 {
    series
        .as_ref()
        .and_then(|v| v.get(i).copied().flatten())
        .unwrap_or(0.0)
}

//
// ================= Wire structs =================
//

/// Yahoo wraps numbers as {"raw": 1.0, "fmt": "1.0"}.
#[derive(Debug, Deserialize, Default)]
struct RawNum {
    raw: Option<f64>,
}

impl RawNum {
    fn value(&self) -> f64 {
        self.raw.unwrap_or(0.0)
    }
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    quotes: Vec<SearchQuote>,
}

#[derive(Debug, Deserialize)]
struct SearchQuote {
    symbol: String,
    shortname: Option<String>,
    longname: Option<String>,
    exchange: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QuoteSummaryResponse {
    #[serde(rename = "quoteSummary")]
    quote_summary: QuoteSummary,
}

#[derive(Debug, Deserialize)]
struct QuoteSummary {
    result: Option<Vec<QuoteSummaryResult>>,
}

#[derive(Debug, Deserialize, Default)]
struct QuoteSummaryResult {
    price: Option<PriceModule>,
    #[serde(rename = "summaryDetail")]
    summary_detail: Option<SummaryDetailModule>,
    #[serde(rename = "assetProfile")]
    asset_profile: Option<AssetProfileModule>,
    #[serde(rename = "financialData")]
    financial_data: Option<FinancialDataModule>,
}

#[derive(Debug, Deserialize, Default)]
struct PriceModule {
    symbol: Option<String>,
    #[serde(rename = "longName")]
    long_name: Option<String>,
    #[serde(rename = "shortName")]
    short_name: Option<String>,
    #[serde(rename = "regularMarketPrice", default)]
    regular_market_price: RawNum,
    #[serde(rename = "regularMarketPreviousClose", default)]
    regular_market_previous_close: RawNum,
    #[serde(rename = "regularMarketOpen", default)]
    regular_market_open: RawNum,
    #[serde(rename = "regularMarketDayHigh", default)]
    regular_market_day_high: RawNum,
    #[serde(rename = "regularMarketDayLow", default)]
    regular_market_day_low: RawNum,
    #[serde(rename = "regularMarketVolume", default)]
    regular_market_volume: RawNum,
    #[serde(rename = "marketCap", default)]
    market_cap: RawNum,
}

#[derive(Debug, Deserialize, Default)]
struct SummaryDetailModule {
    #[serde(rename = "trailingPE", default)]
    trailing_pe: RawNum,
    #[serde(rename = "forwardPE", default)]
    forward_pe: RawNum,
    #[serde(rename = "dividendYield", default)]
    dividend_yield: RawNum,
    #[serde(rename = "fiftyTwoWeekHigh", default)]
    fifty_two_week_high: RawNum,
    #[serde(rename = "fiftyTwoWeekLow", default)]
    fifty_two_week_low: RawNum,
    #[serde(rename = "averageVolume", default)]
    average_volume: RawNum,
}

#[derive(Debug, Deserialize, Default)]
struct AssetProfileModule {
    sector: Option<String>,
    industry: Option<String>,
    country: Option<String>,
    website: Option<String>,
    #[serde(rename = "longBusinessSummary")]
    long_business_summary: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct FinancialDataModule {
    #[serde(rename = "recommendationKey")]
    recommendation_key: Option<String>,
    #[serde(rename = "numberOfAnalystOpinions", default)]
    number_of_analyst_opinions: RawNum,
    #[serde(rename = "targetMeanPrice", default)]
    target_mean_price: RawNum,
    #[serde(rename = "targetLowPrice", default)]
    target_low_price: RawNum,
    #[serde(rename = "targetHighPrice", default)]
    target_high_price: RawNum,
    #[serde(rename = "currentPrice", default)]
    current_price: RawNum,
}

#[derive(Debug, Deserialize)]
struct ChartResponse {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartData>>,
}

#[derive(Debug, Deserialize)]
struct ChartData {
    timestamp: Option<Vec<i64>>,
    indicators: Indicators,
}

#[derive(Debug, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteBlock>,
}

#[derive(Debug, Deserialize, Default)]
struct QuoteBlock {
    open: Option<Vec<Option<f64>>>,
    high: Option<Vec<Option<f64>>>,
    low: Option<Vec<Option<f64>>>,
    close: Option<Vec<Option<f64>>>,
    volume: Option<Vec<Option<u64>>>,
}

/// Mock market data for development & testing.
pub struct MockMarketData;

#[async_trait]
impl MarketData for MockMarketData {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<StockMatch>> {
        let matches = vec![
            StockMatch {
                symbol: "AAPL".to_string(),
                name: "Apple Inc.".to_string(),
                exchange: "NMS".to_string(),
            },
            StockMatch {
                symbol: "MSFT".to_string(),
                name: "Microsoft Corporation".to_string(),
                exchange: "NMS".to_string(),
            },
        ];
        let _ = query;
        Ok(matches.into_iter().take(max_results).collect())
    }

    async fn get_info(&self, ticker: &str) -> Result<StockInfo> {
        Ok(StockInfo {
            symbol: ticker.to_string(),
            name: "Apple Inc.".to_string(),
            current_price: 178.25,
            previous_close: 176.10,
            open: 176.80,
            day_high: 179.10,
            day_low: 176.20,
            market_cap: 2_800_000_000_000.0,
            pe_ratio: Some(29.5),
            forward_pe: Some(26.1),
            dividend_yield: 0.0052,
            week52_high: 199.62,
            week52_low: 164.08,
            volume: 48_000_000,
            avg_volume: 55_000_000,
            sector: "Technology".to_string(),
            industry: "Consumer Electronics".to_string(),
            country: "United States".to_string(),
            website: "https://www.apple.com".to_string(),
            summary: "Designs, manufactures and markets smartphones.".to_string(),
        })
    }

    async fn get_history(
        &self,
        _ticker: &str,
        _period: &str,
        _interval: &str,
    ) -> Result<Vec<PricePoint>> {
        let base = Utc.timestamp_opt(1_700_000_000, 0).single().ok_or_else(|| {
            WorkflowError::Tool("invalid mock timestamp".to_string())
        })?;
        Ok((0..10)
            .map(|i| PricePoint {
                date: base + chrono::Duration::days(i),
                open: 170.0 + i as f64,
                high: 172.0 + i as f64,
                low: 169.0 + i as f64,
                close: 171.0 + i as f64,
                volume: 50_000_000,
            })
            .collect())
    }

    async fn get_ratings(&self, ticker: &str) -> Result<RatingsSummary> {
        Ok(RatingsSummary {
            recommendation: "buy".to_string(),
            analyst_count: 38,
            target_mean: Some(205.0),
            target_low: Some(160.0),
            target_high: Some(250.0),
            current_price: if ticker == "AAPL" { 178.25 } else { 100.0 },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_query_is_percent_encoded() {
        let client = YahooFinanceClient::new();
        let request = client
            .request(
                "/v1/finance/search",
                &[("q", "삼성전자"), ("quotesCount", "10"), ("newsCount", "0")],
            )
            .build()
            .unwrap();

        let url = request.url().as_str();
        assert!(url.contains("/v1/finance/search?"));
        assert!(url.contains("q=%EC%82%BC%EC%84%B1%EC%A0%84%EC%9E%90"));
        assert!(url.contains("newsCount=0"));
    }

    #[tokio::test]
    async fn test_transport_error_maps_to_http() {
        let client = YahooFinanceClient {
            client: Client::new(),
            base_url: "http://127.0.0.1:9".to_string(),
        };
        let result = client.get_info("AAPL").await;
        assert!(matches!(result, Err(WorkflowError::Http(_))));
    }

    #[test]
    fn test_quote_summary_deserialization() {
        let raw = r#"{
            "quoteSummary": {
                "result": [{
                    "price": {
                        "symbol": "AAPL",
                        "longName": "Apple Inc.",
                        "regularMarketPrice": {"raw": 178.25, "fmt": "178.25"},
                        "marketCap": {"raw": 2800000000000.0}
                    },
                    "summaryDetail": {
                        "trailingPE": {"raw": 29.5},
                        "fiftyTwoWeekHigh": {"raw": 199.62},
                        "fiftyTwoWeekLow": {"raw": 164.08}
                    }
                }]
            }
        }"#;

        let parsed: QuoteSummaryResponse = serde_json::from_str(raw).unwrap();
        let result = parsed.quote_summary.result.unwrap().remove(0);
        let price = result.price.unwrap();
        assert_eq!(price.regular_market_price.value(), 178.25);
        assert_eq!(price.long_name.as_deref(), Some("Apple Inc."));
        let detail = result.summary_detail.unwrap();
        assert_eq!(detail.fifty_two_week_high.value(), 199.62);
    }

    #[tokio::test]
    async fn test_mock_market_data() {
        let market = MockMarketData;
        let info = market.get_info("AAPL").await.unwrap();
        assert_eq!(info.symbol, "AAPL");
        assert!(info.current_price > 0.0);

        let history = market.get_history("AAPL", "1mo", "1d").await.unwrap();
        assert_eq!(history.len(), 10);
        assert!(history[9].close > history[0].close);
    }
}
