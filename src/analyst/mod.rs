//! Financial analyst agent
//!
//! Runs a reason-act loop over the market data tools: the model thinks,
//! names a tool, the tool's observation is appended to the scratchpad, and
//! the loop repeats until the model emits a Final Answer or the iteration
//! cap is hit. The final answer is parsed into a structured
//! [`AnalysisRecord`]; `analyze` never fails, every failure mode degrades
//! into an error record the rest of the pipeline can render.

use crate::llm::LanguageModel;
use crate::models::{AnalysisRecord, StockMetrics, StockReport};
use crate::tools::ToolRegistry;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_ANALYSIS_ITERATIONS: u32 = 15;

/// Stop sequences that cut generation before the model hallucinates its
/// own tool observations.
const OBSERVATION_STOPS: &[&str] = &["\nObservation:", "Observation:"];

/// Truncation limit when wrapping unparseable output into a record.
const FALLBACK_ANALYSIS_CHARS: usize = 1000;

pub struct FinancialAnalyst {
    llm: Arc<dyn LanguageModel>,
    registry: ToolRegistry,
}

impl FinancialAnalyst {
    pub fn new(llm: Arc<dyn LanguageModel>, registry: ToolRegistry) -> Self {
        Self { llm, registry }
    }

    /// Analyze a finance question using the market data tools.
    ///
    /// Infallible: LLM failures produce an error record, unparseable
    /// output is wrapped as free-text analysis.
    pub async fn analyze(&self, query: &str) -> AnalysisRecord {
        info!(query = %query, "Starting financial analysis");

        let output = match self.run_tool_loop(query).await {
            Ok(output) => output,
            Err(e) => {
                warn!("Financial analysis failed: {}", e);
                return error_record(&e.to_string());
            }
        };

        let record = parse_record(&output);
        info!(analysis_type = record.type_name(), "Financial analysis complete");
        record
    }

    async fn run_tool_loop(&self, query: &str) -> crate::Result<String> {
        let mut scratchpad = String::new();

        for iteration in 0..MAX_ANALYSIS_ITERATIONS {
            let prompt = self.build_prompt(query, &scratchpad);
            let response = self.llm.generate_with_stop(&prompt, OBSERVATION_STOPS).await?;
            debug!(iteration, response_chars = response.chars().count(), "Loop step");

            if response.contains("Final Answer:") {
                return Ok(response);
            }

            let Some((tool_name, tool_input)) = parse_action(&response) else {
                // Nudge the model back into the expected format.
                scratchpad.push_str(&response);
                scratchpad.push_str(
                    "\nObservation: 형식 오류입니다. 'Action: 도구이름'과 \
                     'Action Input: {JSON}'을 정확히 사용하거나 'Final Answer:'로 답하세요.\n",
                );
                continue;
            };

            let observation = match self.registry.get(&tool_name) {
                Some(tool) => match tool.execute(&tool_input).await {
                    Ok(observation) => observation,
                    Err(e) => format!("도구 실행 오류: {}", e),
                },
                None => format!(
                    "'{}' 도구는 존재하지 않습니다. 사용 가능한 도구: {:?}",
                    tool_name,
                    self.registry.list()
                ),
            };

            scratchpad.push_str(&response);
            scratchpad.push_str("\nObservation: ");
            scratchpad.push_str(&observation);
            scratchpad.push('\n');
        }

        // Iteration cap reached. Force a final answer from whatever has
        // been gathered so far.
        warn!("Analysis iteration cap reached, forcing final answer");
        let prompt = format!(
            "{}\n지금까지 수집한 정보만으로 반드시 'Final Answer:'와 JSON을 출력하세요.\n",
            self.build_prompt(query, &scratchpad)
        );
        self.llm.generate(&prompt).await
    }

    fn build_prompt(&self, query: &str, scratchpad: &str) -> String {
        format!(
            r#"당신은 주식 데이터를 수집하고 분석하는 금융 분석가입니다.

사용 가능한 도구:
{tools}

다음 형식을 정확히 따르십시오 (마크다운 금지):

Thought: 무엇을 해야 하는지 생각
Action: 도구 이름 (위 목록 중 하나, 정확히)
Action Input: {{"key": "value"}} 형태의 JSON
Observation: 도구 실행 결과 (시스템이 제공)
... (Thought/Action/Action Input/Observation 반복)
Thought: 최종 답변 준비 완료
Final Answer: 아래 형식의 JSON

단일 종목 분석 시 Final Answer JSON:
{{
    "analysis_type": "single",
    "ticker": "AAPL",
    "company_name": "Apple Inc.",
    "current_price": 178.25,
    "analysis": "상세 분석 내용",
    "metrics": {{"pe_ratio": 29.5, "market_cap": 2800000000000, "52week_high": 199.62, "52week_low": 164.08}},
    "period": "3mo",
    "news_summary": "최신 뉴스 요약",
    "analyst_recommendation": "buy"
}}

복수 종목 비교 시 Final Answer JSON:
{{
    "analysis_type": "comparison",
    "stocks": [단일 종목 형식의 객체들],
    "comparison_summary": "비교 분석 내용",
    "period": "3mo",
    "recommendation": {{"preferred_stock": "AAPL", "reason": "..."}}
}}

질문: {query}

{scratchpad}"#,
            tools = self.registry.describe(),
            query = query,
            scratchpad = scratchpad
        )
    }
}

/// Parse "Action:" / "Action Input:" out of a loop response.
///
/// The input JSON may span multiple lines, so everything after the
/// "Action Input:" marker is scanned for a balanced object.
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
    let json_text = extract_json_object(input_text)?;
    let input: Value = serde_json::from_str(json_text).ok()?;

    Some((tool_name, input))
}

/// Extract the first balanced JSON object from `text`.
///
/// Tracks string literals and escapes so braces inside string values
/// cannot unbalance the scan.
pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }

    None
}

/// Parse the loop's final output into a structured record.
///
/// Tries, in order: a ```json fence, the JSON after the last
/// "Final Answer:", and the first JSON object anywhere in the text.
/// Unparseable output is wrapped as a free-text single record.
pub(crate) fn parse_record(output: &str) -> AnalysisRecord {
    let candidate = fenced_json(output)
        .or_else(|| {
            output
                .rsplit("Final Answer:")
                .next()
                .and_then(extract_json_object)
        })
        .or_else(|| extract_json_object(output));

    if let Some(json_text) = candidate {
        match serde_json::from_str::<AnalysisRecord>(json_text) {
            Ok(record) => return record,
            Err(e) => warn!("Record parse failed: {}", e),
        }
    }

    let mut analysis: String = output.chars().take(FALLBACK_ANALYSIS_CHARS).collect();
    if output.chars().count() > FALLBACK_ANALYSIS_CHARS {
        analysis.push_str("...");
    }

    AnalysisRecord::Single(StockReport {
        ticker: "UNKNOWN".to_string(),
        company_name: "Unknown".to_string(),
        analysis,
        period: "3mo".to_string(),
        ..StockReport::default()
    })
}

fn fenced_json(output: &str) -> Option<&str> {
    let after_fence = output.split("```json").nth(1)?;
    let inner = after_fence.split("```").next()?;
    extract_json_object(inner)
}

fn error_record(error: &str) -> AnalysisRecord {
    AnalysisRecord::Single(StockReport {
        ticker: "ERROR".to_string(),
        company_name: "Error".to_string(),
        analysis: format!("분석 중 오류가 발생했습니다: {}", error),
        period: "3mo".to_string(),
        metrics: StockMetrics::default(),
        error: Some(error.to_string()),
        ..StockReport::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::tools::{create_analyst_registry, MockMarketData, MockWebSearch};

    fn analyst(responses: Vec<&str>) -> FinancialAnalyst {
        let registry = create_analyst_registry(
            Arc::new(MockMarketData),
            Arc::new(MockWebSearch),
            std::env::temp_dir().join("qa-orchestrator-test-data"),
        );
        FinancialAnalyst::new(Arc::new(ScriptedModel::new(responses)), registry)
    }

    #[test]
    fn test_extract_json_object_balanced() {
        let text = "noise {\"a\": {\"b\": 1}} trailing";
        assert_eq!(extract_json_object(text), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn test_extract_json_object_brace_in_string() {
        let text = r#"{"analysis": "곡선이 } 모양", "x": 1}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn test_extract_json_object_unbalanced() {
        assert_eq!(extract_json_object("{\"a\": 1"), None);
        assert_eq!(extract_json_object("no json here"), None);
    }

    #[test]
    fn test_parse_record_fenced_final_answer() {
        let output = "Thought: done\nFinal Answer: ```json\n{\"analysis_type\": \"single\", \"ticker\": \"AAPL\", \"current_price\": 178.25}\n```";
        match parse_record(output) {
            AnalysisRecord::Single(report) => {
                assert_eq!(report.ticker, "AAPL");
                assert_eq!(report.current_price, 178.25);
                assert_eq!(report.period, "3mo");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_parse_record_uses_last_final_answer() {
        let output = concat!(
            "Final Answer: {\"analysis_type\": \"single\", \"ticker\": \"WRONG\"}\n",
            "Observation: retry\n",
            "Final Answer: {\"analysis_type\": \"single\", \"ticker\": \"MSFT\"}"
        );
        match parse_record(output) {
            AnalysisRecord::Single(report) => assert_eq!(report.ticker, "MSFT"),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_parse_record_fallback_wraps_text() {
        let record = parse_record("자유 형식 텍스트 답변입니다.");
        match record {
            AnalysisRecord::Single(report) => {
                assert_eq!(report.ticker, "UNKNOWN");
                assert!(report.analysis.contains("자유 형식"));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_runs_tool_then_finalizes() {
        let analyst = analyst(vec![
            "Thought: 정보 필요\nAction: get_stock_info\nAction Input: {\"ticker\": \"AAPL\"}",
            "Thought: 충분함\nFinal Answer: {\"analysis_type\": \"single\", \"ticker\": \"AAPL\", \"company_name\": \"Apple Inc.\", \"current_price\": 178.25, \"analysis\": \"강세\"}",
        ]);
        match analyst.analyze("애플 주식 분석").await {
            AnalysisRecord::Single(report) => {
                assert_eq!(report.ticker, "AAPL");
                assert_eq!(report.company_name, "Apple Inc.");
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_unknown_tool_continues() {
        let analyst = analyst(vec![
            "Action: no_such_tool\nAction Input: {\"x\": 1}",
            "Final Answer: {\"analysis_type\": \"single\", \"ticker\": \"AAPL\"}",
        ]);
        match analyst.analyze("애플").await {
            AnalysisRecord::Single(report) => assert_eq!(report.ticker, "AAPL"),
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_analyze_llm_error_returns_error_record() {
        let analyst = analyst(vec![]);
        match analyst.analyze("애플").await {
            AnalysisRecord::Single(report) => {
                assert_eq!(report.ticker, "ERROR");
                assert!(report.error.is_some());
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }
}
