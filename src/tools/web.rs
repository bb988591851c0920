//! Web search capability and Tavily adapter
//!
//! Used by the analyst to find the "why" behind price moves and anything
//! the market data feed does not carry. Hits missing raw content are
//! backfilled by fetching the page directly.

use crate::error::WorkflowError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use tracing::{info, warn};

/// One web search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_content: Option<String>,
}

/// Trait for web search access
#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>>;
}

/// Live Tavily adapter.
pub struct TavilyClient {
    client: Client,
    api_key: String,
    base_url: String,
}

impl TavilyClient {
    pub fn new(api_key: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            base_url: env::var("TAVILY_BASE_URL")
                .unwrap_or_else(|_| "https://api.tavily.com".to_string()),
        }
    }

    /// Fetch a page and return its text with excess whitespace collapsed.
    async fn load_web_page(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| WorkflowError::Tool(format!("Page fetch failed for {}: {}", url, e)))?;

        let body = response
            .text()
            .await
            .map_err(|e| WorkflowError::Tool(format!("Page body read failed for {}: {}", url, e)))?;

        if body.trim().is_empty() {
            return Err(WorkflowError::Tool(format!("Empty page content: {}", url)));
        }

        let mut text = body.trim().to_string();
        while text.contains("\n\n\n") || text.contains("\t\t\t") {
            text = text.replace("\n\n\n", "\n\n").replace("\t\t\t", "\t\t");
        }

        Ok(text)
    }
}

#[async_trait]
impl WebSearch for TavilyClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        if self.api_key.is_empty() {
            return Err(WorkflowError::Tool(
                "TAVILY_API_KEY is not configured".to_string(),
            ));
        }

        info!(query = %query, "Running web search");

        let request = TavilyRequest {
            api_key: self.api_key.clone(),
            query: query.to_string(),
            search_depth: "advanced".to_string(),
            include_raw_content: true,
        };

        let url = format!("{}/search", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| WorkflowError::Tool(format!("Web search request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Tool(format!(
                "Web search returned {}: {}",
                status, body
            )));
        }

        let tavily: TavilyResponse = response
            .json()
            .await
            .map_err(|e| WorkflowError::Tool(format!("Invalid web search response: {}", e)))?;

        let mut hits = Vec::with_capacity(tavily.results.len());
        for result in tavily.results {
            let raw_content = match result.raw_content {
                Some(raw) if !raw.trim().is_empty() => Some(raw),
                _ => match self.load_web_page(&result.url).await {
                    Ok(page) => Some(page),
                    Err(e) => {
                        warn!(url = %result.url, "Raw content backfill failed: {}", e);
                        Some(result.content.clone())
                    }
                },
            };

            hits.push(SearchHit {
                title: result.title,
                url: result.url,
                content: result.content,
                raw_content,
            });
        }

        Ok(hits)
    }
}

#[derive(Debug, Serialize)]
struct TavilyRequest {
    api_key: String,
    query: String,
    search_depth: String,
    include_raw_content: bool,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyResult>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    raw_content: Option<String>,
}

/// Mock web search for development & testing.
pub struct MockWebSearch;

#[async_trait]
impl WebSearch for MockWebSearch {
    async fn search(&self, query: &str) -> Result<Vec<SearchHit>> {
        Ok(vec![SearchHit {
            title: format!("{} 관련 최신 뉴스", query),
            url: "https://example.com/news/1".to_string(),
            content: "실적 발표 이후 주가가 강세를 보이고 있습니다.".to_string(),
            raw_content: Some("실적 발표 이후 주가가 강세를 보이고 있습니다.".to_string()),
        }])
    }
}
