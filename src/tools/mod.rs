//! Tool trait and registry
//!
//! Tools are the analyst's only way to touch the outside world. Each tool
//! takes a JSON object of parameters and returns a formatted observation
//! string for the model to read on the next loop turn.

use crate::error::WorkflowError;
use crate::Result;
use chrono::Local;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub mod market;
pub mod web;

pub use market::{MarketData, MockMarketData, YahooFinanceClient};
pub use web::{MockWebSearch, TavilyClient, WebSearch};

/// Trait for a single tool
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    async fn execute(&self, input: &Value) -> Result<String>;
}

/// Tool registry for looking up and executing tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    /// Registry restricted to the named tools (used by the report stage
    /// to only expose what the request actually asked for).
    pub fn restricted_to(&self, names: &[&str]) -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        for name in names {
            if let Some(tool) = self.get(name) {
                registry.register(tool);
            }
        }
        registry
    }

    /// "name: description" lines for prompt construction.
    pub fn describe(&self) -> String {
        let mut lines: Vec<String> = self
            .tools
            .values()
            .map(|t| format!("- {}: {}", t.name(), t.description()))
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

fn require_str<'a>(input: &'a Value, key: &str) -> Result<&'a str> {
    input.get(key).and_then(Value::as_str).ok_or_else(|| {
        WorkflowError::InvalidToolInput(format!("Expected '{}' in tool input", key))
    })
}

fn optional_str<'a>(input: &'a Value, key: &str, default: &'a str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or(default)
}

//
// ================= Analyst tools =================
//

/// Find ticker symbols by company name, keyword or industry.
pub struct SearchStocksTool {
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl Tool for SearchStocksTool {
    fn name(&self) -> &'static str {
        "search_stocks"
    }

    fn description(&self) -> &'static str {
        "Search stocks by company name, keyword or industry and return ticker symbols"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let query = require_str(input, "query")?;
        let max_results = input
            .get("max_results")
            .and_then(Value::as_u64)
            .unwrap_or(10) as usize;

        let matches = self.market.search(query, max_results).await?;
        if matches.is_empty() {
            return Ok(format!("'{}'에 대한 검색 결과가 없습니다.", query));
        }

        let mut output = format!("'{}' 검색 결과:\n{}\n", query, "-".repeat(70));
        for item in &matches {
            output.push_str(&format!(
                "• {} - {} [{}]\n",
                item.symbol, item.name, item.exchange
            ));
        }
        output.push_str("\n상세 정보를 보려면 get_stock_info 도구를 사용하세요.");

        info!(query = %query, results = matches.len(), "Stock search complete");
        Ok(output)
    }
}

/// Current price, valuation metrics and company profile for one ticker.
pub struct GetStockInfoTool {
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl Tool for GetStockInfoTool {
    fn name(&self) -> &'static str {
        "get_stock_info"
    }

    fn description(&self) -> &'static str {
        "Get current stock information (price, market cap, P/E, 52-week range, profile)"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let ticker = require_str(input, "ticker")?;
        let info = self.market.get_info(ticker).await?;
        // The model consumes this as JSON and copies fields into its
        // final record, so keep the key names stable.
        Ok(serde_json::to_string_pretty(&info)?)
    }
}

/// OHLCV history for chart generation and trend analysis.
pub struct GetHistoricalPricesTool {
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl Tool for GetHistoricalPricesTool {
    fn name(&self) -> &'static str {
        "get_historical_prices"
    }

    fn description(&self) -> &'static str {
        "Get historical OHLCV price data for a ticker over a period (e.g. 1mo, 3mo, 1y)"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let ticker = require_str(input, "ticker")?;
        let period = optional_str(input, "period", "1mo");
        let interval = optional_str(input, "interval", "1d");

        let history = self.market.get_history(ticker, period, interval).await?;
        if history.is_empty() {
            return Ok(format!("{}의 과거 가격 데이터를 찾을 수 없습니다.", ticker));
        }

        let mut output = format!("{} 과거 가격 ({}, {} 간격):\n", ticker, period, interval);
        output.push_str(&"=".repeat(80));
        output.push('\n');
        output.push_str("date        open      high      low       close     volume\n");

        // Last 10 rows are enough for the model.
        let tail = history.len().saturating_sub(10);
        for point in &history[tail..] {
            output.push_str(&format!(
                "{}  {:>8.2}  {:>8.2}  {:>8.2}  {:>8.2}  {:>10}\n",
                point.date.format("%Y-%m-%d"),
                point.open,
                point.high,
                point.low,
                point.close,
                point.volume
            ));
        }
        output.push_str(&format!("\n총 {}개 데이터 포인트", history.len()));

        Ok(output)
    }
}

/// Recommendation key, target prices and upside for one ticker.
pub struct GetAnalystRecommendationsTool {
    market: Arc<dyn MarketData>,
}

#[async_trait::async_trait]
impl Tool for GetAnalystRecommendationsTool {
    fn name(&self) -> &'static str {
        "get_analyst_recommendations"
    }

    fn description(&self) -> &'static str {
        "Get analyst recommendation summary (rating, target prices, upside) for a ticker"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let ticker = require_str(input, "ticker")?;
        let ratings = self.market.get_ratings(ticker).await?;

        let mut output = format!("{} 애널리스트 추천:\n{}\n\n", ticker, "=".repeat(80));
        output.push_str("현재 추천 요약:\n");
        output.push_str(&format!(
            "  • 추천 등급: {}\n",
            ratings.recommendation.to_uppercase()
        ));
        output.push_str(&format!("  • 애널리스트 수: {}명\n", ratings.analyst_count));

        if let Some(target_mean) = ratings.target_mean {
            output.push_str(&format!("  • 평균 목표가: ${:.2}\n", target_mean));
            output.push_str(&format!(
                "  • 목표가 범위: ${:.2} ~ ${:.2}\n",
                ratings.target_low.unwrap_or(0.0),
                ratings.target_high.unwrap_or(0.0)
            ));

            if ratings.current_price > 0.0 {
                let upside = (target_mean - ratings.current_price) / ratings.current_price * 100.0;
                output.push_str(&format!("  • 현재가: ${:.2}\n", ratings.current_price));
                output.push_str(&format!("  • 상승여력: {:+.2}%\n", upside));
            }
        }

        Ok(output)
    }
}

/// Web search with a JSON artifact of the raw results for later inspection.
pub struct WebSearchTool {
    web: Arc<dyn WebSearch>,
    data_dir: PathBuf,
}

#[async_trait::async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &'static str {
        "web_search"
    }

    fn description(&self) -> &'static str {
        "Search the web for latest news and information not covered by market data"
    }

    async fn execute(&self, input: &Value) -> Result<String> {
        let query = require_str(input, "query")?;
        let hits = self.web.search(query).await?;

        if hits.is_empty() {
            return Ok(format!("'{}'에 대한 검색 결과가 없습니다.", query));
        }

        // Raw result dump so an analyst (human or otherwise) can trace
        // what the model actually read.
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let artifact = self.data_dir.join(format!("resources_{}.json", timestamp));
        let dump = json!({ "query": query, "results": hits });
        if let Err(e) = persist_artifact(&self.data_dir, &artifact, &dump).await {
            warn!("Web search artifact save failed: {}", e);
        }

        let mut output = format!("'{}' 웹 검색 완료\n\n", query);
        output.push_str(&format!("검색 결과: {}개\n", hits.len()));
        output.push_str(&format!("저장 위치: {}\n\n", artifact.display()));
        output.push_str("주요 결과:\n");

        for (idx, hit) in hits.iter().take(5).enumerate() {
            let preview: String = hit.content.chars().take(150).collect();
            output.push_str(&format!("\n[{}] {}\n", idx + 1, hit.title));
            output.push_str(&format!("    URL: {}\n", hit.url));
            output.push_str(&format!("    내용: {}...\n", preview));
        }

        info!(query = %query, results = hits.len(), "Web search complete");
        Ok(output)
    }
}

async fn persist_artifact(dir: &PathBuf, path: &PathBuf, value: &Value) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, serde_json::to_vec_pretty(value)?).await?;
    Ok(())
}

/// Create the analyst's tool registry over the given market/web adapters.
pub fn create_analyst_registry(
    market: Arc<dyn MarketData>,
    web: Arc<dyn WebSearch>,
    data_dir: PathBuf,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(SearchStocksTool {
        market: market.clone(),
    }));
    registry.register(Arc::new(GetStockInfoTool {
        market: market.clone(),
    }));
    registry.register(Arc::new(GetHistoricalPricesTool {
        market: market.clone(),
    }));
    registry.register(Arc::new(GetAnalystRecommendationsTool { market }));
    registry.register(Arc::new(WebSearchTool { web, data_dir }));

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        create_analyst_registry(
            Arc::new(MockMarketData),
            Arc::new(MockWebSearch),
            std::env::temp_dir().join("qa-orchestrator-test-data"),
        )
    }

    #[test]
    fn test_registry_contains_analyst_tools() {
        let registry = registry();
        for name in [
            "search_stocks",
            "get_stock_info",
            "get_historical_prices",
            "get_analyst_recommendations",
            "web_search",
        ] {
            assert!(registry.get(name).is_some(), "missing tool {}", name);
        }
    }

    #[test]
    fn test_restricted_registry() {
        let registry = registry().restricted_to(&["web_search", "no_such_tool"]);
        assert_eq!(registry.list(), vec!["web_search"]);
    }

    #[tokio::test]
    async fn test_search_stocks_formats_matches() {
        let registry = registry();
        let tool = registry.get("search_stocks").unwrap();
        let output = tool
            .execute(&json!({"query": "apple", "max_results": 2}))
            .await
            .unwrap();
        assert!(output.contains("AAPL"));
        assert!(output.contains("Apple Inc."));
    }

    #[tokio::test]
    async fn test_get_stock_info_returns_json_with_stable_keys() {
        let registry = registry();
        let tool = registry.get("get_stock_info").unwrap();
        let output = tool.execute(&json!({"ticker": "AAPL"})).await.unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["symbol"], "AAPL");
        assert!(parsed["52week_high"].as_f64().unwrap() > 0.0);
    }

    #[tokio::test]
    async fn test_missing_parameter_is_invalid_input() {
        let registry = registry();
        let tool = registry.get("get_stock_info").unwrap();
        let result = tool.execute(&json!({})).await;
        assert!(matches!(
            result,
            Err(WorkflowError::InvalidToolInput(_))
        ));
    }
}
