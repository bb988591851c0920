//! Workflow engine
//!
//! Drives one question through the full pipeline:
//!
//! ```text
//! request_analyst ──> supervisor ──> financial_analyst ──> report_generator
//!       │                 │                                      │
//!       └─> end            └─> retriever ──> report_generator     v
//!                                                         quality_evaluator
//!                                                           │        │
//!                                              retry <──────┘        └─> end
//! ```
//!
//! Quality failures loop back through the request analyst with a rewritten
//! query, at most `max_retries` times. Every run appends the user question
//! and the final answer to the transcript store; persistence failures are
//! logged but never break a run.

use crate::analyst::FinancialAnalyst;
use crate::config::messages;
use crate::history::TranscriptStore;
use crate::llm::LanguageModel;
use crate::models::{
    AnalysisRecord, RequestType, RetrievalRecord, Role, Route, Turn, TurnStatus, WorkflowState,
};
use crate::quality::QualityEvaluator;
use crate::report::ReportGenerator;
use crate::request_analyst::{Label, RequestAnalyst};
use crate::retriever::Retriever;
use crate::supervisor::{AgentChoice, Supervisor};
use crate::Result;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub struct WorkflowEngine {
    request_analyst: RequestAnalyst,
    supervisor: Supervisor,
    analyst: FinancialAnalyst,
    retriever: Retriever,
    report: ReportGenerator,
    quality: QualityEvaluator,
    transcripts: Arc<dyn TranscriptStore>,
    max_retries: u32,
}

impl WorkflowEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        analyst: FinancialAnalyst,
        retriever: Retriever,
        report: ReportGenerator,
        quality: QualityEvaluator,
        transcripts: Arc<dyn TranscriptStore>,
        max_retries: u32,
    ) -> Self {
        Self {
            request_analyst: RequestAnalyst::new(llm.clone()),
            supervisor: Supervisor::new(llm),
            analyst,
            retriever,
            report,
            quality,
            transcripts,
            max_retries,
        }
    }

    /// Run one question in a fresh session and return the final state.
    pub async fn run(&self, question: &str) -> Result<WorkflowState> {
        let session_id = Uuid::new_v4().to_string();
        self.run_in_session(&session_id, question).await
    }

    /// Run one question inside an existing session. Earlier successful
    /// turns of the session are fed to the classifier as conversation
    /// context, so follow-up questions resolve against prior answers.
    pub async fn run_in_session(
        &self,
        session_id: &str,
        question: &str,
    ) -> Result<WorkflowState> {
        info!(session_id = %session_id, question = %question, "Workflow run started");

        let mut state = WorkflowState::new(session_id.to_string(), question);
        let mut final_agent = "request_analyst";

        // Prior turns only; the current question is appended after.
        let history = match self.transcripts.recent_successful(session_id, 10).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!("Transcript lookup failed: {}", e);
                Vec::new()
            }
        };

        if !question.trim().is_empty() {
            self.append_turn(session_id, Turn::user(question)).await;
        }

        loop {
            // Request analysis: finance gate.
            if state.question.trim().is_empty() {
                state.answer = messages::EMPTY_QUESTION.to_string();
                state.route = Route::End;
                break;
            }

            match self.request_analyst.classify(&state.question, &history).await? {
                Label::Finance => state.route = Route::Supervisor,
                Label::NotFinance => {
                    info!("Question classified as non-finance");
                    state.answer = messages::NOT_FINANCE.to_string();
                    state.route = Route::End;
                    break;
                }
            }

            // Supervisor: choose the downstream agent.
            let record = match self.supervisor.route(&state.question).await? {
                AgentChoice::None => {
                    final_agent = "supervisor";
                    state.answer = messages::NO_AGENT.to_string();
                    state.route = Route::End;
                    break;
                }
                AgentChoice::FinancialAnalyst => {
                    state.route = Route::FinancialAnalyst;
                    state.request_type = Some(RequestType::FinancialAnalyst);
                    self.analyst.analyze(&state.question).await
                }
                AgentChoice::VectorSearchAgent => {
                    state.route = Route::ReportGenerator;
                    state.request_type = Some(RequestType::Rag);
                    let chunks = self.retriever.retrieve(&state.question).await;
                    state.rag_search_results = chunks
                        .iter()
                        .map(|chunk| {
                            format!(
                                "- (score={:.2}) {} p.{}",
                                chunk.score,
                                chunk.source,
                                chunk
                                    .page
                                    .map(|p| p.to_string())
                                    .unwrap_or_else(|| "?".to_string())
                            )
                        })
                        .collect();
                    AnalysisRecord::Rag(RetrievalRecord {
                        query: state.question.clone(),
                        documents: chunks.into_iter().map(|c| c.content).collect(),
                    })
                }
            };
            state.analysis_data = Some(record.clone());

            // Report generation.
            final_agent = "report_generator";
            let output = self.report.generate(&state.question, &record).await;
            state.answer = output.report;
            state.charts = output.charts;
            state.saved_path = output.saved_path;

            // Quality gate.
            let result = self.quality.evaluate(&state.question, &state.answer).await;
            state.quality_passed = result.passed();
            state.quality_detail = Some(result.clone());

            if state.quality_passed {
                state.retries = 0;
                state.route = Route::End;
                break;
            }

            state.retries += 1;
            final_agent = "quality_evaluator";
            let failure_reason = result
                .failure_reason
                .map(|r| r.as_str())
                .unwrap_or("incorrect");
            let rewrite = self
                .request_analyst
                .rewrite_query(&state.question, failure_reason);

            if rewrite.needs_user_input {
                state.answer = rewrite
                    .user_question
                    .unwrap_or_else(|| messages::CLARIFY_REQUEST.to_string());
                state.route = Route::End;
                break;
            }

            if state.retries >= self.max_retries {
                warn!(retries = state.retries, "Retry budget exhausted");
                state.answer = messages::RETRIES_EXHAUSTED.to_string();
                state.route = Route::End;
                break;
            }

            info!(retries = state.retries, "Retrying with rewritten query");
            state.question = rewrite.rewritten_query;
            state.answer = messages::RETRY_NOTICE.to_string();
        }

        self.append_answer(&state, final_agent).await;
        info!(
            session_id = %state.session_id,
            quality_passed = state.quality_passed,
            retries = state.retries,
            "Workflow run finished"
        );
        Ok(state)
    }

    async fn append_answer(&self, state: &WorkflowState, agent_name: &str) {
        let (status, failure_reason) = match &state.quality_detail {
            Some(detail) if !detail.passed() => (TurnStatus::Failed, detail.failure_reason),
            _ => (TurnStatus::Success, None),
        };

        let turn = Turn {
            role: Role::Assistant,
            content: state.answer.clone(),
            agent_name: Some(agent_name.to_string()),
            status,
            failure_reason,
            quality_score: state.quality_detail.as_ref().map(|d| d.score as f64),
            metadata: Some(json!({
                "request_type": state.request_type,
                "retries": state.retries,
                "charts": state.charts,
                "saved_path": state.saved_path,
            })),
            timestamp: Utc::now(),
        };
        self.append_turn(&state.session_id, turn).await;
    }

    async fn append_turn(&self, session_id: &str, turn: Turn) {
        if let Err(e) = self.transcripts.append(session_id, &turn).await {
            warn!("Transcript append failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkflowError;
    use crate::history::InMemoryTranscriptStore;
    use crate::llm::ScriptedModel;
    use crate::report::tools::{FileReportSink, SvgChartRenderer};
    use crate::retriever::InMemoryVectorStore;
    use crate::tools::{create_analyst_registry, MockMarketData, MockWebSearch};

    fn engine(llm: Arc<ScriptedModel>) -> (WorkflowEngine, Arc<InMemoryTranscriptStore>) {
        let base = std::env::temp_dir().join(format!("workflow-test-{}", Uuid::new_v4()));
        let transcripts = Arc::new(InMemoryTranscriptStore::new());

        let registry = create_analyst_registry(
            Arc::new(MockMarketData),
            Arc::new(MockWebSearch),
            base.join("data"),
        );

        let engine = WorkflowEngine::new(
            llm.clone(),
            FinancialAnalyst::new(llm.clone(), registry),
            Retriever::new(Arc::new(InMemoryVectorStore::new()), 5, 0.3),
            ReportGenerator::new(
                llm.clone(),
                Arc::new(SvgChartRenderer),
                Arc::new(FileReportSink),
                base.join("charts"),
                base.join("reports"),
            ),
            QualityEvaluator::new(llm, 3),
            transcripts.clone(),
            3,
        );
        (engine, transcripts)
    }

    const FINANCE: &str = r#"{"label": "finance"}"#;
    const NOT_FINANCE: &str = r#"{"label": "not_finance"}"#;
    const CHOOSE_ANALYST: &str = r#"{"agent": "financial_analyst"}"#;
    const ANALYST_ANSWER: &str = "Final Answer: {\"analysis_type\": \"single\", \"ticker\": \"AAPL\", \"company_name\": \"Apple Inc.\", \"current_price\": 178.25, \"analysis\": \"강세 흐름\"}";
    const REPORT: &str = "## Apple Inc. (AAPL) 주식 분석 보고서\n\n현재가는 178.25달러이며 52주 범위 상단에 있습니다.";

    #[tokio::test]
    async fn test_empty_question_ends_without_llm_calls() {
        let llm = Arc::new(ScriptedModel::empty());
        let (engine, _) = engine(llm.clone());

        let state = engine.run("   ").await.unwrap();
        assert_eq!(state.answer, messages::EMPTY_QUESTION);
        assert_eq!(state.route, Route::End);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_non_finance_question_ends_at_gate() {
        let llm = Arc::new(ScriptedModel::new(vec![NOT_FINANCE]));
        let (engine, transcripts) = engine(llm.clone());

        let state = engine.run("오늘 날씨 어때?").await.unwrap();
        assert_eq!(state.answer, messages::NOT_FINANCE);
        assert_eq!(llm.calls(), 1);

        let turns = transcripts.session_turns(&state.session_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_no_suitable_agent_ends() {
        let llm = Arc::new(ScriptedModel::new(vec![FINANCE, r#"{"agent": "none"}"#]));
        let (engine, _) = engine(llm);

        let state = engine.run("금융 관련이긴 한데 모호한 질문").await.unwrap();
        assert_eq!(state.answer, messages::NO_AGENT);
        assert_eq!(state.route, Route::End);
    }

    #[tokio::test]
    async fn test_end_to_end_single_stock_pass() {
        let llm = Arc::new(ScriptedModel::new(vec![
            FINANCE,
            CHOOSE_ANALYST,
            ANALYST_ANSWER,
            REPORT,
            "4",
        ]));
        let (engine, transcripts) = engine(llm.clone());

        let state = engine.run("애플 주식 분석해줘").await.unwrap();

        assert!(state.quality_passed);
        assert_eq!(state.retries, 0);
        assert_eq!(state.route, Route::End);
        assert_eq!(state.request_type, Some(RequestType::FinancialAnalyst));
        assert!(state.answer.contains("AAPL"));
        assert!(state.charts.is_empty());
        assert_eq!(llm.calls(), 5);

        match state.analysis_data {
            Some(AnalysisRecord::Single(report)) => assert_eq!(report.ticker, "AAPL"),
            other => panic!("unexpected analysis data: {:?}", other),
        }

        let turns = transcripts.session_turns(&state.session_id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].status, TurnStatus::Success);
        assert_eq!(turns[1].quality_score, Some(4.0));
    }

    #[tokio::test]
    async fn test_session_history_feeds_classifier() {
        let mut responses = Vec::new();
        for _ in 0..2 {
            responses.extend_from_slice(&[FINANCE, CHOOSE_ANALYST, ANALYST_ANSWER, REPORT, "4"]);
        }
        let llm = Arc::new(ScriptedModel::new(responses));
        let (engine, transcripts) = engine(llm.clone());

        let session = "session-followup";
        engine
            .run_in_session(session, "애플 주식 분석해줘")
            .await
            .unwrap();
        let state = engine
            .run_in_session(session, "그럼 실적 전망은 어때?")
            .await
            .unwrap();

        assert!(state.quality_passed);
        let turns = transcripts.session_turns(session).await.unwrap();
        assert_eq!(turns.len(), 4);

        // First classification runs without context, the follow-up sees
        // the earlier turns.
        let prompts = llm.prompts();
        assert!(!prompts[0].contains("이전 대화"));
        assert!(prompts[5].contains("이전 대화"));
        assert!(prompts[5].contains("애플 주식 분석해줘"));
    }

    #[tokio::test]
    async fn test_rag_route_builds_retrieval_record() {
        // The test index is empty, so the report stage answers with the
        // fixed no-documents notice without an LLM call; only the
        // classifier, the supervisor and the judge consume responses.
        let llm = Arc::new(ScriptedModel::new(vec![
            FINANCE,
            r#"{"agent": "vector_search_agent"}"#,
            "5",
        ]));
        let (engine, _) = engine(llm.clone());

        let state = engine.run("나스닥이 뭐야?").await.unwrap();
        assert!(state.quality_passed);
        assert_eq!(state.request_type, Some(RequestType::Rag));
        assert!(state.rag_search_results.is_empty());
        assert!(state.answer.contains("검색되지 않았습니다"));
        assert_eq!(llm.calls(), 3);
        match state.analysis_data {
            Some(AnalysisRecord::Rag(record)) => assert_eq!(record.query, "나스닥이 뭐야?"),
            other => panic!("unexpected analysis data: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted_after_three_failures() {
        // Three full rounds of five calls each, judge scoring 1 every time.
        let mut responses = Vec::new();
        for _ in 0..3 {
            responses.extend_from_slice(&[FINANCE, CHOOSE_ANALYST, ANALYST_ANSWER, REPORT, "1"]);
        }
        let llm = Arc::new(ScriptedModel::new(responses));
        let (engine, transcripts) = engine(llm.clone());

        let state = engine.run("애플 주식 분석해줘").await.unwrap();

        assert!(!state.quality_passed);
        assert_eq!(state.retries, 3);
        assert_eq!(state.answer, messages::RETRIES_EXHAUSTED);
        assert_eq!(llm.calls(), 15);

        let turns = transcripts.session_turns(&state.session_id).await.unwrap();
        assert_eq!(turns[1].status, TurnStatus::Failed);
    }

    #[tokio::test]
    async fn test_short_question_failure_asks_user() {
        let llm = Arc::new(ScriptedModel::new(vec![
            FINANCE,
            CHOOSE_ANALYST,
            ANALYST_ANSWER,
            REPORT,
            "1",
        ]));
        let (engine, _) = engine(llm);

        // Under five characters, so the rewrite bounces back to the user.
        let state = engine.run("주가?").await.unwrap();
        assert_eq!(state.answer, messages::CLARIFY_REQUEST);
        assert_eq!(state.retries, 1);
        assert_eq!(state.route, Route::End);
    }

    #[tokio::test]
    async fn test_malformed_classification_propagates() {
        let llm = Arc::new(ScriptedModel::new(vec!["이건 JSON이 아닙니다"]));
        let (engine, _) = engine(llm);

        let result = engine.run("애플 주가?").await;
        assert!(matches!(result, Err(WorkflowError::Classification(_))));
    }
}
