//! Report generation
//!
//! Turns an analysis record into the user-facing answer. Plain requests
//! get a direct one-shot report; requests that mention charts or saving
//! run a restricted tool loop that only exposes the tools the request
//! actually asked for. The structured record is injected into every tool
//! call as `analysis_data`.

pub mod tools;

use crate::llm::LanguageModel;
use crate::models::{AnalysisRecord, ReportOutput, ReportStatus};
use crate::tools::ToolRegistry;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use tools::{
    find_path_token, ChartRenderer, DrawStockChartTool, DrawValuationRadarTool, ReportSink,
    SaveReportToFileTool,
};

const CHART_KEYWORDS: &[&str] = &["차트", "그래프", "chart", "그려", "시각화"];
const SAVE_KEYWORDS: &[&str] = &["저장", "파일", "save", "md", "pdf", "txt"];

const CHART_TOOLS: &[&str] = &["draw_stock_chart", "draw_valuation_radar"];
const SAVE_TOOLS: &[&str] = &["save_report_to_file"];

// Two charts, one save, plus room for format corrections.
const MAX_REPORT_ITERATIONS: u32 = 10;

const OBSERVATION_STOPS: &[&str] = &["\nObservation:", "Observation:"];

const CHART_FILE_EXTENSIONS: &[&str] = &["svg", "png", "jpg", "jpeg", "webp"];
const REPORT_FILE_EXTENSIONS: &[&str] = &["md", "txt", "pdf"];

pub struct ReportGenerator {
    llm: Arc<dyn LanguageModel>,
    registry: ToolRegistry,
}

impl ReportGenerator {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        renderer: Arc<dyn ChartRenderer>,
        sink: Arc<dyn ReportSink>,
        charts_dir: PathBuf,
        reports_dir: PathBuf,
    ) -> Self {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(DrawStockChartTool {
            renderer: renderer.clone(),
            charts_dir: charts_dir.clone(),
        }));
        registry.register(Arc::new(DrawValuationRadarTool {
            renderer,
            charts_dir,
        }));
        registry.register(Arc::new(SaveReportToFileTool { sink, reports_dir }));

        Self { llm, registry }
    }

    /// Generate the user-facing report for one analysis record.
    ///
    /// Infallible: every failure mode produces an error report the
    /// quality gate will catch.
    pub async fn generate(&self, user_request: &str, record: &AnalysisRecord) -> ReportOutput {
        info!(
            analysis_type = record.type_name(),
            "Starting report generation"
        );

        if let AnalysisRecord::Comparison(comparison) = record {
            if comparison.stocks.len() < 2 {
                warn!(
                    stocks = comparison.stocks.len(),
                    "Comparison record with fewer than two stocks"
                );
            }
        }

        let request_lower = user_request.to_lowercase();
        let wants_charts = CHART_KEYWORDS.iter().any(|k| request_lower.contains(k));
        let wants_save = SAVE_KEYWORDS.iter().any(|k| request_lower.contains(k));
        info!(wants_charts, wants_save, "Request intent");

        if !wants_charts && !wants_save {
            return match self.generate_directly(record).await {
                Ok(report) => ReportOutput {
                    report,
                    status: ReportStatus::Success,
                    charts: Vec::new(),
                    saved_path: None,
                },
                Err(e) => error_report(record, &e.to_string()),
            };
        }

        let mut allowed: Vec<&str> = Vec::new();
        if wants_charts {
            allowed.extend_from_slice(CHART_TOOLS);
        }
        if wants_save {
            allowed.extend_from_slice(SAVE_TOOLS);
        }
        let registry = self.registry.restricted_to(&allowed);

        match self.run_tool_loop(user_request, record, &registry).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Report tool loop failed: {}", e);
                error_report(record, &e.to_string())
            }
        }
    }

    async fn run_tool_loop(
        &self,
        user_request: &str,
        record: &AnalysisRecord,
        registry: &ToolRegistry,
    ) -> crate::Result<ReportOutput> {
        let record_json = serde_json::to_string_pretty(record)?;
        let mut scratchpad = String::new();
        let mut charts: Vec<String> = Vec::new();
        let mut saved_path: Option<String> = None;

        for _ in 0..MAX_REPORT_ITERATIONS {
            let prompt = self.build_loop_prompt(user_request, &record_json, registry, &scratchpad);
            let response = self.llm.generate_with_stop(&prompt, OBSERVATION_STOPS).await?;

            if let Some(final_answer) = response.split("Final Answer:").nth(1) {
                return Ok(ReportOutput {
                    report: final_answer.trim().to_string(),
                    status: ReportStatus::Success,
                    charts,
                    saved_path,
                });
            }

            let Some((tool_name, mut tool_input)) = parse_action(&response) else {
                scratchpad.push_str(&response);
                scratchpad.push_str(
                    "\nObservation: 형식 오류입니다. 'Action: 도구이름'과 \
                     'Action Input: {JSON}'을 정확히 사용하거나 'Final Answer:'로 답하세요.\n",
                );
                continue;
            };

            // The tools read the record from the call input, never from
            // shared state.
            if let Value::Object(map) = &mut tool_input {
                map.insert(
                    "analysis_data".to_string(),
                    serde_json::to_value(record)?,
                );
            }

            let observation = match registry.get(&tool_name) {
                Some(tool) => match tool.execute(&tool_input).await {
                    Ok(observation) => observation,
                    Err(e) => format!("도구 실행 오류: {}", e),
                },
                None => format!(
                    "'{}' 도구는 사용할 수 없습니다. 사용 가능한 도구: {:?}",
                    tool_name,
                    registry.list()
                ),
            };

            if CHART_TOOLS.contains(&tool_name.as_str()) {
                if let Some(path) = find_path_token(&observation, CHART_FILE_EXTENSIONS) {
                    if !charts.contains(&path) {
                        info!(chart = %path, "Chart path captured");
                        charts.push(path);
                    }
                }
            } else if SAVE_TOOLS.contains(&tool_name.as_str()) {
                if let Some(path) = find_path_token(&observation, REPORT_FILE_EXTENSIONS) {
                    info!(report = %path, "Report path captured");
                    saved_path = Some(path);
                }
            }

            scratchpad.push_str(&response);
            scratchpad.push_str("\nObservation: ");
            scratchpad.push_str(&observation);
            scratchpad.push('\n');
        }

        // Loop budget exhausted: fall back to a direct report, keeping
        // whatever artifacts were produced.
        warn!("Report iteration cap reached, generating report directly");
        let report = self.generate_directly(record).await?;
        Ok(ReportOutput {
            report,
            status: ReportStatus::Success,
            charts,
            saved_path,
        })
    }

    fn build_loop_prompt(
        &self,
        user_request: &str,
        record_json: &str,
        registry: &ToolRegistry,
        scratchpad: &str,
    ) -> String {
        format!(
            r#"당신은 금융 분석 보고서를 작성하는 전문가입니다. 필요한 경우 도구를 사용해 차트를 그리거나 보고서를 저장한 뒤, 최종 보고서를 작성하십시오.

사용 가능한 도구:
{tools}

분석 데이터:
```json
{record_json}
```

다음 형식을 정확히 따르십시오 (마크다운 금지):

Thought: 무엇을 해야 하는지 생각
Action: 도구 이름 (위 목록 중 하나, 정확히)
Action Input: {{"key": "value"}} 형태의 JSON
Observation: 도구 실행 결과 (시스템이 제공)
... (필요한 만큼 반복)
Thought: 보고서 작성 준비 완료
Final Answer: 마크다운 형식의 최종 보고서 전문

사용자 요청: {user_request}

{scratchpad}"#,
            tools = registry.describe(),
            record_json = record_json,
            user_request = user_request,
            scratchpad = scratchpad
        )
    }

    async fn generate_directly(&self, record: &AnalysisRecord) -> crate::Result<String> {
        let prompt = match record {
            AnalysisRecord::Single(report) => {
                let record_json = serde_json::to_string_pretty(record)?;
                format!(
                    r#"다음 주식 분석 데이터를 바탕으로 전문적인 마크다운 형식의 보고서를 작성해주세요.

분석 데이터:
```json
{record_json}
```

다음 구조로 상세한 보고서를 작성해주세요:

## {company} ({ticker}) 주식 분석 보고서

### 1. 기업 개요
- 회사명, 티커, 섹터, 산업 정보 정리

### 2. 주가 정보
- 현재가, 52주 최고/최저, 거래량 등

### 3. 밸류에이션 지표
- P/E Ratio, 시가총액, 배당수익률 등

### 4. 분석 의견
- 제공된 analysis 내용을 상세히 설명

### 5. 최신 뉴스 요약
- news_summary 내용 정리 (있는 경우)

### 6. 애널리스트 추천
- analyst_recommendation 내용

### 7. 투자 의견
- 전체 데이터를 종합한 투자 의견 및 리스크 요인

**요구사항:**
- 최소 300단어 이상
- 마크다운 형식 사용
- 구체적인 수치 포함
- 전문적이고 객관적인 톤
"#,
                    record_json = record_json,
                    company = report.company_name,
                    ticker = report.ticker
                )
            }
            AnalysisRecord::Comparison(comparison) => {
                let record_json = serde_json::to_string_pretty(record)?;
                let tickers: Vec<&str> =
                    comparison.stocks.iter().map(|s| s.ticker.as_str()).collect();
                format!(
                    r#"다음 주식 비교 분석 데이터를 바탕으로 전문적인 마크다운 형식의 비교 보고서를 작성해주세요.

분석 데이터:
```json
{record_json}
```

다음 구조로 상세한 비교 보고서를 작성해주세요:

## 주식 비교 분석 보고서: {versus}

### 1. 비교 대상 개요
- 각 주식의 기본 정보 (회사명, 티커, 섹터, 산업)

### 2. 주가 비교
- 현재가, 52주 최고/최저 비교
- 주가 위치 분석

### 3. 밸류에이션 비교
- P/E Ratio, 시가총액 등 주요 지표 비교
- 표 형식 권장

### 4. 개별 주식 분석
- 각 주식의 장단점 상세 분석

### 5. 종합 비교 분석
- comparison_summary 내용 정리
- 상대적 강점/약점 비교

### 6. 투자 추천
- 추천 주식 및 이유
- 리스크 분석
- 투자 전략 제안

**요구사항:**
- 최소 400단어 이상
- 마크다운 형식 사용
- 구체적인 수치 비교
- 전문적이고 객관적인 톤
- 비교 표 사용 권장
"#,
                    record_json = record_json,
                    versus = tickers.join(" vs ")
                )
            }
            AnalysisRecord::Rag(retrieval) => {
                if retrieval.documents.is_empty() {
                    return Ok(format!(
                        "## 검색 결과 안내\n\n'{}' 질문과 관련된 문서가 검색되지 않았습니다.\n\n질문을 좀 더 구체적으로 바꾸어 다시 시도해 주세요.",
                        retrieval.query
                    ));
                }

                let documents = retrieval
                    .documents
                    .iter()
                    .enumerate()
                    .map(|(idx, doc)| format!("[문서 {}]\n{}", idx + 1, doc))
                    .collect::<Vec<_>>()
                    .join("\n\n");

                format!(
                    r#"다음 검색된 문서들을 근거로 사용자 질문에 대한 마크다운 형식의 답변을 작성해주세요.

사용자 질문: {query}

검색된 문서:
{documents}

**요구사항:**
- 문서에 있는 내용만 근거로 사용
- 용어는 정확하게 정의하고 쉬운 예시를 덧붙일 것
- 마크다운 형식 사용
"#,
                    query = retrieval.query,
                    documents = documents
                )
            }
        };

        let report = self.llm.generate(&prompt).await?;
        Ok(report.trim().to_string())
    }
}

fn parse_action(response: &str) -> Option<(String, Value)> {
    let action_line = response
        .lines()
        .find_map(|line| line.trim().strip_prefix("Action:"))?;
    let tool_name = action_line.trim().trim_matches('*').trim().to_string();
    if tool_name.is_empty() {
        return None;
    }

    let input_idx = response.find("Action Input:")?;
    let input_text = &response[input_idx + "Action Input:".len()..];
    let json_text = crate::analyst::extract_json_object(input_text)?;
    let input: Value = serde_json::from_str(json_text).ok()?;

    Some((tool_name, input))
}

fn error_report(record: &AnalysisRecord, error: &str) -> ReportOutput {
    let record_json =
        serde_json::to_string_pretty(record).unwrap_or_else(|_| "{}".to_string());
    ReportOutput {
        report: format!(
            "# Report Generation Error\n\nAn error occurred: {}\n\n## Analysis Data\n```json\n{}\n```\n\n⚠️ 재시도를 요청하거나 데이터를 확인해주세요.",
            error, record_json
        ),
        status: ReportStatus::Error,
        charts: Vec::new(),
        saved_path: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::models::{ComparisonReport, RetrievalRecord, StockMetrics, StockReport};
    use tools::{FileReportSink, SvgChartRenderer};

    fn generator(responses: Vec<&str>) -> ReportGenerator {
        let base = std::env::temp_dir().join(format!("report-gen-{}", uuid::Uuid::new_v4()));
        ReportGenerator::new(
            Arc::new(ScriptedModel::new(responses)),
            Arc::new(SvgChartRenderer),
            Arc::new(FileReportSink),
            base.join("charts"),
            base.join("reports"),
        )
    }

    fn single_record() -> AnalysisRecord {
        AnalysisRecord::Single(StockReport {
            ticker: "AAPL".to_string(),
            company_name: "Apple Inc.".to_string(),
            current_price: 178.25,
            analysis: "강한 펀더멘털".to_string(),
            metrics: StockMetrics {
                pe_ratio: Some(29.5),
                market_cap: 2.8e12,
                week52_high: 199.62,
                week52_low: 164.08,
                ..StockMetrics::default()
            },
            ..StockReport::default()
        })
    }

    #[tokio::test]
    async fn test_plain_request_generates_directly() {
        let generator = generator(vec!["## Apple Inc. (AAPL) 주식 분석 보고서\n\n상세 내용"]);
        let output = generator.generate("애플 주식 분석해줘", &single_record()).await;

        assert_eq!(output.status, ReportStatus::Success);
        assert!(output.report.contains("AAPL"));
        assert!(output.charts.is_empty());
        assert!(output.saved_path.is_none());
    }

    #[tokio::test]
    async fn test_chart_request_collects_chart_paths() {
        let generator = generator(vec![
            "Thought: 차트 필요\nAction: draw_stock_chart\nAction Input: {\"output_path\": \"aapl.svg\"}",
            "Thought: 완료\nFinal Answer: ## 보고서\n\n차트를 포함한 분석입니다.",
        ]);
        let output = generator
            .generate("애플 주가 차트 그려줘", &single_record())
            .await;

        assert_eq!(output.status, ReportStatus::Success);
        assert_eq!(output.charts.len(), 1);
        assert!(output.charts[0].ends_with("aapl.svg"));
        assert!(output.report.contains("보고서"));
    }

    #[tokio::test]
    async fn test_save_request_captures_path() {
        let generator = generator(vec![
            "Action: save_report_to_file\nAction Input: {\"report_text\": \"# 요약\", \"format\": \"md\", \"output_path\": \"summary.md\"}",
            "Final Answer: ## 저장 완료 보고서",
        ]);
        let output = generator
            .generate("분석 결과를 md 파일로 저장해줘", &single_record())
            .await;

        assert_eq!(output.status, ReportStatus::Success);
        let saved = output.saved_path.expect("saved path");
        assert!(saved.ends_with("summary.md"));
    }

    #[tokio::test]
    async fn test_rag_without_documents_reports_absence() {
        let generator = generator(vec![]);
        let record = AnalysisRecord::Rag(RetrievalRecord {
            query: "나스닥이 뭐야?".to_string(),
            documents: Vec::new(),
        });
        let output = generator.generate("나스닥이 뭐야?", &record).await;

        assert_eq!(output.status, ReportStatus::Success);
        assert!(output.report.contains("검색되지 않았습니다"));
    }

    #[tokio::test]
    async fn test_llm_failure_yields_error_report() {
        let generator = generator(vec![]);
        let output = generator.generate("애플 분석", &single_record()).await;

        assert_eq!(output.status, ReportStatus::Error);
        assert!(output.report.contains("Report Generation Error"));
        assert!(output.report.contains("analysis_type"));
    }

    #[tokio::test]
    async fn test_comparison_direct_report() {
        let generator = generator(vec!["## 주식 비교 분석 보고서: AAPL vs MSFT"]);
        let record = AnalysisRecord::Comparison(ComparisonReport {
            stocks: vec![
                StockReport {
                    ticker: "AAPL".to_string(),
                    ..StockReport::default()
                },
                StockReport {
                    ticker: "MSFT".to_string(),
                    ..StockReport::default()
                },
            ],
            comparison_summary: "비교 요약".to_string(),
            ..ComparisonReport::default()
        });
        let output = generator.generate("애플과 마소 비교해줘", &record).await;

        assert_eq!(output.status, ReportStatus::Success);
        assert!(output.report.contains("AAPL vs MSFT"));
    }
}
