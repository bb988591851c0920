//! Core domain models for the QA workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Where the state machine goes next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    End,
    Supervisor,
    FinancialAnalyst,
    ReportGenerator,
}

/// Which pipeline produced the data the report stage consumes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    Rag,
    FinancialAnalyst,
}

/// Mutable state carried through one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub session_id: String,
    pub question: String,
    pub answer: String,
    pub route: Route,
    pub request_type: Option<RequestType>,
    pub rag_search_results: Vec<String>,
    pub analysis_data: Option<AnalysisRecord>,
    pub quality_passed: bool,
    pub quality_detail: Option<QualityResult>,
    pub retries: u32,
    pub charts: Vec<String>,
    pub saved_path: Option<String>,
}

impl WorkflowState {
    pub fn new(session_id: String, question: &str) -> Self {
        Self {
            session_id,
            question: question.to_string(),
            answer: String::new(),
            route: Route::Supervisor,
            request_type: None,
            rag_search_results: Vec::new(),
            analysis_data: None,
            quality_passed: false,
            quality_detail: None,
            retries: 0,
            charts: Vec::new(),
            saved_path: None,
        }
    }
}

fn default_period() -> String {
    "3mo".to_string()
}

/// Structured output of the analysis/retrieval stages.
///
/// The `analysis_type` discriminant is part of the wire contract with the
/// model prompts, so the serde tag must stay stable. Error results from the
/// analyst are carried as a `single` record with ticker "ERROR".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "analysis_type", rename_all = "snake_case")]
pub enum AnalysisRecord {
    #[serde(alias = "error")]
    Single(StockReport),
    Comparison(ComparisonReport),
    Rag(RetrievalRecord),
}

impl AnalysisRecord {
    pub fn type_name(&self) -> &'static str {
        match self {
            AnalysisRecord::Single(_) => "single",
            AnalysisRecord::Comparison(_) => "comparison",
            AnalysisRecord::Rag(_) => "rag",
        }
    }
}

/// One analyzed stock. Model output regularly omits numeric fields,
/// so everything except the ticker defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StockReport {
    pub ticker: String,
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub analysis: String,
    #[serde(default)]
    pub metrics: StockMetrics,
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub news_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyst_recommendation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StockMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pe_ratio: Option<f64>,
    #[serde(default)]
    pub market_cap: f64,
    #[serde(rename = "52week_high", default)]
    pub week52_high: f64,
    #[serde(rename = "52week_low", default)]
    pub week52_low: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dividend_yield: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ComparisonReport {
    #[serde(default)]
    pub stocks: Vec<StockReport>,
    #[serde(default, alias = "comparison_analysis")]
    pub comparison_summary: String,
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RetrievalRecord {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub documents: Vec<String>,
}

//
// ================= Quality evaluation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QualityStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    Empty,
    Error,
    Incorrect,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Empty => "empty",
            FailureReason::Error => "error",
            FailureReason::Incorrect => "incorrect",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the quality gate for one answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityResult {
    pub status: QualityStatus,
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

impl QualityResult {
    pub fn pass(score: u8) -> Self {
        Self {
            status: QualityStatus::Pass,
            score,
            failure_reason: None,
        }
    }

    pub fn fail(score: u8, reason: FailureReason) -> Self {
        Self {
            status: QualityStatus::Fail,
            score,
            failure_reason: Some(reason),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == QualityStatus::Pass
    }
}

//
// ================= Report generation =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Error,
}

/// What the report stage hands back to the workflow. Always contains a
/// non-empty report, even on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportOutput {
    pub report: String,
    pub status: ReportStatus,
    pub charts: Vec<String>,
    pub saved_path: Option<String>,
}

//
// ================= Query rewrite =================
//

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteOutcome {
    pub rewritten_query: String,
    pub needs_user_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_question: Option<String>,
}

//
// ================= Transcript store =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    Success,
    Failed,
}

impl TurnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStatus::Success => "success",
            TurnStatus::Failed => "failed",
        }
    }
}

/// One appended transcript entry. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub agent_name: Option<String>,
    pub status: TurnStatus,
    pub failure_reason: Option<FailureReason>,
    pub quality_score: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            agent_name: None,
            status: TurnStatus::Success,
            failure_reason: None,
            quality_score: None,
            metadata: None,
            timestamp: Utc::now(),
        }
    }
}

/// Per-session aggregates over the transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatistics {
    pub total_messages: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub success_rate: f64,
    pub failure_reasons: HashMap<String, u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analysis_record_tag_round_trip() {
        let record = AnalysisRecord::Single(StockReport {
            ticker: "AAPL".to_string(),
            company_name: "Apple Inc.".to_string(),
            current_price: 178.25,
            analysis: "Strong fundamentals".to_string(),
            metrics: StockMetrics {
                pe_ratio: Some(29.5),
                market_cap: 2_800_000_000_000.0,
                week52_high: 199.62,
                week52_low: 164.08,
                dividend_yield: None,
                sector: Some("Technology".to_string()),
                industry: Some("Consumer Electronics".to_string()),
            },
            period: "3mo".to_string(),
            news_summary: None,
            analyst_recommendation: Some("Buy".to_string()),
            error: None,
        });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["analysis_type"], "single");
        assert_eq!(json["metrics"]["52week_high"], 199.62);

        let back: AnalysisRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_error_tag_maps_to_single() {
        let raw = r#"{
            "analysis_type": "error",
            "ticker": "ERROR",
            "company_name": "Error",
            "current_price": 0,
            "analysis": "분석 중 오류가 발생했습니다",
            "metrics": {},
            "period": "3mo",
            "error": "timeout"
        }"#;

        let record: AnalysisRecord = serde_json::from_str(raw).unwrap();
        match record {
            AnalysisRecord::Single(stock) => {
                assert_eq!(stock.ticker, "ERROR");
                assert_eq!(stock.error.as_deref(), Some("timeout"));
            }
            other => panic!("expected single record, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_numerics_default_to_zero() {
        let raw = r#"{
            "analysis_type": "single",
            "ticker": "MSFT",
            "analysis": "partial output",
            "metrics": {"pe_ratio": 35.2}
        }"#;

        let record: AnalysisRecord = serde_json::from_str(raw).unwrap();
        let AnalysisRecord::Single(stock) = record else {
            panic!("expected single record");
        };
        assert_eq!(stock.current_price, 0.0);
        assert_eq!(stock.metrics.week52_high, 0.0);
        assert_eq!(stock.metrics.market_cap, 0.0);
        assert_eq!(stock.period, "3mo");
    }

    #[test]
    fn test_comparison_summary_alias() {
        let raw = r#"{
            "analysis_type": "comparison",
            "stocks": [
                {"ticker": "AAPL", "current_price": 178.25},
                {"ticker": "MSFT", "current_price": 420.5}
            ],
            "comparison_analysis": "Both show strong fundamentals"
        }"#;

        let record: AnalysisRecord = serde_json::from_str(raw).unwrap();
        let AnalysisRecord::Comparison(cmp) = record else {
            panic!("expected comparison record");
        };
        assert_eq!(cmp.stocks.len(), 2);
        assert_eq!(cmp.comparison_summary, "Both show strong fundamentals");
    }

    #[test]
    fn test_quality_result_constructors() {
        let pass = QualityResult::pass(4);
        assert!(pass.passed());
        assert!(pass.failure_reason.is_none());

        let fail = QualityResult::fail(0, FailureReason::Empty);
        assert!(!fail.passed());
        assert_eq!(fail.failure_reason, Some(FailureReason::Empty));
    }
}
