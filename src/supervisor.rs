//! Supervisor: routes finance questions to the right downstream agent

use crate::error::WorkflowError;
use crate::llm::LanguageModel;
use crate::request_analyst::strip_json_fences;
use crate::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

/// The downstream agent picked for a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentChoice {
    /// Document retrieval for terminology and concept questions.
    VectorSearchAgent,
    /// Live market data collection and analysis.
    FinancialAnalyst,
    /// No agent fits the question.
    None,
}

#[derive(Debug, Deserialize)]
struct AgentType {
    agent: String,
}

pub struct Supervisor {
    llm: Arc<dyn LanguageModel>,
}

impl Supervisor {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    pub async fn route(&self, question: &str) -> Result<AgentChoice> {
        info!(question = %question, "Routing question");

        let prompt = format!(
            r#"당신은 금융 도메인 질문을 가장 잘 처리할 다음 단계의 "분석 에이전트"를 선택하는 routing 감독관입니다.

아래 에이전트 중 질문에 가장 적합한 하나만 선택하십시오.
- vector_search_agent: 금융용어, 주식관련 용어, 주식관련 은어 등 대한 신뢰 가능한 문서 검색에 특화(RAG 기반)
- financial_analyst: 종목코드 찾기(TICKER), 재무제표 조회, 주식 정보 조회, 주식 비교, 특정 기간 주가 이력 조회 등 주식관련 정보 수집에 특화

선택규칙:
1) 오직 하나만 선택 (AND 금지)
2) 단순 금융용어 및 주식관련 용어 등이 필요하면 vector_search_agent를 우선 선택
3) 재무 계산, 종목 비교, 종목 코드 찾기, 기업 비교 등, 재무 분석 중심이면 financial_analyst를 우선 선택
4) 출력은 반드시 JSON 형식만 반환 (설명, 여분 텍스트 금지)

사용자 질문:
{question}

출력 형식(JSON)
{{
    "agent": "vector_search_agent" or "financial_analyst" or "none"
}}"#,
            question = question
        );

        let response = self.llm.generate(&prompt).await?;
        let parsed: AgentType = serde_json::from_str(strip_json_fences(&response))
            .map_err(|e| {
                WorkflowError::Routing(format!(
                    "Unparseable routing response '{}': {}",
                    response.trim(),
                    e
                ))
            })?;

        let choice = match parsed.agent.as_str() {
            "vector_search_agent" => AgentChoice::VectorSearchAgent,
            "financial_analyst" => AgentChoice::FinancialAnalyst,
            "none" => AgentChoice::None,
            other => {
                return Err(WorkflowError::Routing(format!(
                    "Unknown agent choice: {}",
                    other
                )))
            }
        };

        info!(agent = ?choice, "Agent selected");
        Ok(choice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;

    #[tokio::test]
    async fn test_route_to_analyst() {
        let llm = Arc::new(ScriptedModel::new(vec![
            r#"{"agent": "financial_analyst"}"#,
        ]));
        let supervisor = Supervisor::new(llm);
        let choice = supervisor
            .route("삼성전자와 LG전자 실적 비교해줘")
            .await
            .unwrap();
        assert_eq!(choice, AgentChoice::FinancialAnalyst);
    }

    #[tokio::test]
    async fn test_route_to_vector_search() {
        let llm = Arc::new(ScriptedModel::new(vec![
            "```json\n{\"agent\": \"vector_search_agent\"}\n```",
        ]));
        let supervisor = Supervisor::new(llm);
        let choice = supervisor.route("나스닥이 뭐야?").await.unwrap();
        assert_eq!(choice, AgentChoice::VectorSearchAgent);
    }

    #[tokio::test]
    async fn test_route_none() {
        let llm = Arc::new(ScriptedModel::new(vec![r#"{"agent": "none"}"#]));
        let supervisor = Supervisor::new(llm);
        let choice = supervisor.route("아무 에이전트도 못 푸는 질문").await.unwrap();
        assert_eq!(choice, AgentChoice::None);
    }

    #[tokio::test]
    async fn test_route_malformed_is_error() {
        let llm = Arc::new(ScriptedModel::new(vec!["financial_analyst입니다"]));
        let supervisor = Supervisor::new(llm);
        assert!(matches!(
            supervisor.route("애플 주가?").await,
            Err(WorkflowError::Routing(_))
        ));
    }
}
