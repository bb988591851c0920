//! Request analysis: finance gate and retry query rewriting
//!
//! First stage of every workflow run. Classifies whether the question is
//! about finance at all, and on quality failures decides whether a retry
//! should go back to the pipeline or back to the user.

use crate::config::messages;
use crate::error::WorkflowError;
use crate::llm::LanguageModel;
use crate::models::{RewriteOutcome, Turn};
use crate::Result;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Queries shorter than this are sent back to the user for clarification
/// instead of being retried.
const MIN_REWRITE_CHARS: usize = 5;

/// Classification outcome of the finance gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Finance,
    NotFinance,
}

#[derive(Debug, Deserialize)]
struct FinanceGate {
    label: String,
}

pub struct RequestAnalyst {
    llm: Arc<dyn LanguageModel>,
}

impl RequestAnalyst {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Classify a question as finance or not, with recent history as
    /// context for follow-ups like "그럼 작년은?".
    ///
    /// `history` is newest first (the transcript store's order); the
    /// newest three turns are rendered oldest to newest in the prompt.
    pub async fn classify(&self, question: &str, history: &[Turn]) -> Result<Label> {
        info!(question = %question, "Running finance classification");

        let mut context = String::new();
        if !history.is_empty() {
            debug!(turns = history.len(), "Classifying with conversation context");
            context.push_str("이전 대화:\n");
            for turn in history.iter().take(3).rev() {
                let preview: String = turn.content.chars().take(80).collect();
                context.push_str(&format!("- {}: {}\n", turn.role.as_str(), preview));
            }
            context.push('\n');
        }

        let prompt = format!(
            r#"당신은 사용자 질문이 경제/금융 관련인지 판별하는 분류기입니다.

{context}분류 기준:
- 주식, 종목, 투자, 환율, 금리, 경제 지표, 기업 실적, 재무제표, 금융 용어 관련 질문이면 "finance"
- 그 외의 모든 질문(날씨, 일상, 일반 지식 등)은 "not_finance"
- 이전 대화가 금융 주제라면 후속 질문도 "finance"로 판단

출력은 반드시 JSON 형식만 반환하십시오 (설명, 여분 텍스트 금지).

사용자 질문:
{question}

출력 형식(JSON)
{{
    "label": "finance" or "not_finance"
}}"#,
            context = context,
            question = question
        );

        let response = self.llm.generate(&prompt).await?;
        let gate: FinanceGate = serde_json::from_str(strip_json_fences(&response))
            .map_err(|e| {
                WorkflowError::Classification(format!(
                    "Unparseable classification response '{}': {}",
                    response.trim(),
                    e
                ))
            })?;

        match gate.label.as_str() {
            "finance" => Ok(Label::Finance),
            "not_finance" => Ok(Label::NotFinance),
            other => Err(WorkflowError::Classification(format!(
                "Unknown classification label: {}",
                other
            ))),
        }
    }

    /// Decide what to do with a question after a quality failure.
    ///
    /// Very short queries carry too little signal to retry, so those are
    /// bounced back to the user with a clarification request. Everything
    /// else is retried as-is.
    pub fn rewrite_query(&self, original_query: &str, failure_reason: &str) -> RewriteOutcome {
        info!(
            query = %original_query,
            reason = %failure_reason,
            "Rewriting query after quality failure"
        );

        if original_query.trim().chars().count() < MIN_REWRITE_CHARS {
            info!("Query too short, asking the user for more detail");
            return RewriteOutcome {
                rewritten_query: original_query.to_string(),
                needs_user_input: true,
                user_question: Some(messages::CLARIFY_REQUEST.to_string()),
            };
        }

        RewriteOutcome {
            rewritten_query: original_query.to_string(),
            needs_user_input: false,
            user_question: None,
        }
    }
}

/// Strip a ```json ... ``` fence (or a bare ``` fence) around a response.
pub(crate) fn strip_json_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}
