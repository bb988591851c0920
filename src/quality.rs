//! Quality gate for generated answers
//!
//! Three checks in order, cheapest first: an emptiness check, an error
//! keyword scan, and only then an LLM-as-a-judge scoring call. The first
//! failing check short-circuits, so obviously broken answers never cost
//! a judge call.

use crate::llm::LanguageModel;
use crate::models::{FailureReason, QualityResult};
use std::sync::Arc;
use tracing::{info, warn};

/// Answers with fewer trimmed characters than this are empty.
const MIN_ANSWER_CHARS: usize = 10;

/// Substrings that mark an answer as a surfaced failure. Matched
/// case-insensitively.
const ERROR_KEYWORDS: &[&str] = &[
    "error",
    "failed",
    "could not",
    "unable to",
    "오류",
    "실패",
    "찾을 수 없",
];

pub struct QualityEvaluator {
    llm: Arc<dyn LanguageModel>,
    threshold: u8,
}

impl QualityEvaluator {
    pub fn new(llm: Arc<dyn LanguageModel>, threshold: u8) -> Self {
        Self { llm, threshold }
    }

    pub async fn evaluate(&self, question: &str, answer: &str) -> QualityResult {
        info!("Evaluating answer quality");

        if answer.trim().chars().count() < MIN_ANSWER_CHARS {
            warn!("Quality check failed: answer is empty");
            return QualityResult::fail(0, FailureReason::Empty);
        }

        let answer_lower = answer.to_lowercase();
        if let Some(keyword) = ERROR_KEYWORDS
            .iter()
            .find(|k| answer_lower.contains(*k))
        {
            warn!(keyword = %keyword, "Quality check failed: error keyword in answer");
            return QualityResult::fail(0, FailureReason::Error);
        }

        let prompt = format!(
            r#"당신은 답변의 품질을 평가하는 엄격한 평가관입니다.
사용자의 질문에 대해 에이전트가 생성한 답변이 적절한지, 유용한 정보를 포함하고 있는지, 오류는 없는지 평가해주세요.

[사용자 질문]
{question}

[에이전트의 답변]
{answer}

[평가 기준]
1. 질문의 의도에 맞는 답변인가?
2. 답변에 '오류', '찾을 수 없음' 등 실패를 의미하는 내용이 포함되어 있지는 않은가?
3. 답변이 구체적이고 명확한가?

위 기준에 따라 답변의 품질을 1점에서 5점 사이의 점수로만 평가해주세요. 다른 설명은 절대 추가하지 마세요.

평가 점수:"#,
            question = question,
            answer = answer
        );

        let score = match self.llm.generate(&prompt).await {
            Ok(response) => extract_score(&response),
            Err(e) => {
                warn!("Judge call failed: {}", e);
                return QualityResult::fail(0, FailureReason::Error);
            }
        };

        if score >= self.threshold {
            info!(score, threshold = self.threshold, "Quality check passed");
            QualityResult::pass(score)
        } else {
            warn!(score, threshold = self.threshold, "Quality check failed: low score");
            QualityResult::fail(score, FailureReason::Incorrect)
        }
    }
}

/// First digit in 1..=5 anywhere in the judge's response; 0 when none.
///
/// The judge sometimes pads its score with text, and concatenating all
/// digits would turn "3/5" into 35, so only the first valid digit counts.
fn extract_score(response: &str) -> u8 {
    response
        .chars()
        .find_map(|c| match c.to_digit(10) {
            Some(d @ 1..=5) => Some(d as u8),
            _ => None,
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedModel;
    use crate::models::QualityStatus;

    fn evaluator(responses: Vec<&str>) -> (QualityEvaluator, Arc<ScriptedModel>) {
        let llm = Arc::new(ScriptedModel::new(responses));
        (QualityEvaluator::new(llm.clone(), 3), llm)
    }

    #[tokio::test]
    async fn test_empty_answer_skips_judge() {
        let (evaluator, llm) = evaluator(vec!["5"]);
        let result = evaluator.evaluate("질문", "   짧음  ").await;

        assert_eq!(result.status, QualityStatus::Fail);
        assert_eq!(result.score, 0);
        assert_eq!(result.failure_reason, Some(FailureReason::Empty));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_error_keyword_precedes_judge() {
        let (evaluator, llm) = evaluator(vec!["5"]);
        let result = evaluator
            .evaluate("질문", "분석 중 오류가 발생했습니다. 다시 시도해주세요.")
            .await;

        assert_eq!(result.status, QualityStatus::Fail);
        assert_eq!(result.failure_reason, Some(FailureReason::Error));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_english_error_keyword_case_insensitive() {
        let (evaluator, _) = evaluator(vec![]);
        let result = evaluator
            .evaluate("질문", "Report Generation Error: something broke badly")
            .await;
        assert_eq!(result.failure_reason, Some(FailureReason::Error));
    }

    #[tokio::test]
    async fn test_judge_pass_at_threshold() {
        let (evaluator, _) = evaluator(vec!["4"]);
        let result = evaluator
            .evaluate("애플 주가?", "애플의 현재 주가는 178.25달러이며 강세 흐름입니다.")
            .await;

        assert_eq!(result.status, QualityStatus::Pass);
        assert_eq!(result.score, 4);
        assert!(result.passed());
    }

    #[tokio::test]
    async fn test_judge_low_score_is_incorrect() {
        let (evaluator, _) = evaluator(vec!["평가 점수: 2"]);
        let result = evaluator
            .evaluate("애플 주가?", "주가라는 것은 주식의 가격을 말합니다.")
            .await;

        assert_eq!(result.status, QualityStatus::Fail);
        assert_eq!(result.score, 2);
        assert_eq!(result.failure_reason, Some(FailureReason::Incorrect));
    }

    #[tokio::test]
    async fn test_judge_failure_fails_safe() {
        let (evaluator, _) = evaluator(vec![]);
        let result = evaluator
            .evaluate("애플 주가?", "애플의 현재 주가는 178.25달러입니다.")
            .await;

        assert_eq!(result.status, QualityStatus::Fail);
        assert_eq!(result.score, 0);
        assert_eq!(result.failure_reason, Some(FailureReason::Error));
    }

    #[test]
    fn test_extract_score_first_valid_digit() {
        assert_eq!(extract_score("3/5"), 3);
        assert_eq!(extract_score("점수는 4점입니다"), 4);
        assert_eq!(extract_score("0"), 0);
        assert_eq!(extract_score("알 수 없음"), 0);
        assert_eq!(extract_score("9점... 아니 5점"), 5);
    }
}
