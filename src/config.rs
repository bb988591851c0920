//! Environment-driven configuration
//!
//! All tunables come from the environment (loaded via dotenv in the binary)
//! with sensible defaults so the workflow also runs in tests without a .env.

use std::env;
use std::path::PathBuf;

/// Fixed user-facing messages returned by the workflow itself.
pub mod messages {
    pub const EMPTY_QUESTION: &str = "질문이 비어 있어 답변을 드릴 수 없습니다.";
    pub const NOT_FINANCE: &str = "경제, 금융관련 질문이 아닙니다.";
    pub const NO_AGENT: &str = "적합한 에이전트를 찾을 수 없습니다. 그래프를 종료합니다.";
    pub const RETRY_NOTICE: &str = "질문을 다시 정제했습니다. 재시도합니다.";
    pub const RETRIES_EXHAUSTED: &str =
        "3회 재시도에도 품질 기준을 충족하지 못했습니다. 답변을 종료합니다.";
    pub const CLARIFY_REQUEST: &str =
        "질문을 좀 더 구체적으로 말씀해 주시겠어요? 어떤 정보를 원하시나요?";
}

#[derive(Debug, Clone)]
pub struct Config {
    pub upstage_api_key: String,
    pub tavily_api_key: String,
    pub llm_model: String,
    pub quality_threshold: u8,
    pub retrieval_top_k: usize,
    pub retrieval_threshold: f32,
    pub max_retries: u32,
    pub charts_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub data_dir: PathBuf,
    pub database_path: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            upstage_api_key: env::var("UPSTAGE_API_KEY").unwrap_or_default(),
            tavily_api_key: env::var("TAVILY_API_KEY").unwrap_or_default(),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "solar-pro2".to_string()),
            quality_threshold: env_parse("QUALITY_THRESHOLD", 3),
            retrieval_top_k: env_parse("RETRIEVAL_TOP_K", 5),
            retrieval_threshold: env_parse("RETRIEVAL_THRESHOLD", 0.3),
            max_retries: env_parse("MAX_RETRIES", 3),
            charts_dir: env_path("CHARTS_DIR", "charts"),
            reports_dir: env_path("REPORTS_DIR", "reports"),
            data_dir: env_path("DATA_DIR", "data"),
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| "database/chat.db".to_string()),
        }
    }

    /// Required API keys for the live adapters.
    pub fn validate_api_keys(&self) -> crate::Result<()> {
        if self.upstage_api_key.is_empty() {
            return Err(crate::error::WorkflowError::Config(
                "UPSTAGE_API_KEY is not set".to_string(),
            ));
        }
        if self.tavily_api_key.is_empty() {
            return Err(crate::error::WorkflowError::Config(
                "TAVILY_API_KEY is not set".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_path(key: &str, default: &str) -> PathBuf {
    env::var(key).map(PathBuf::from).unwrap_or_else(|_| PathBuf::from(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_env() {
        let config = Config::from_env();
        assert_eq!(config.quality_threshold, 3);
        assert_eq!(config.max_retries, 3);
        assert!(config.retrieval_top_k >= 1);
    }
}
