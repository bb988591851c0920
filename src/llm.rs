//! Language model client for the workflow agents
//!
//! Provides the `LanguageModel` seam all agents talk through, a Solar
//! (Upstage, OpenAI-compatible chat completions) adapter, and a scripted
//! model for development and tests.
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::error::WorkflowError;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Trait for text generation (LLM controlled)
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    /// Generation that halts at the first stop sequence. Used by the
    /// tool loops to cut the model off after each Action Input.
    async fn generate_with_stop(&self, prompt: &str, stop: &[&str]) -> Result<String>;
}

/// Reusable Solar chat-completions client (connection-pooled)
pub struct SolarClient {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl SolarClient {
    pub fn new(api_key: String, model: String) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(120))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key,
            model,
            base_url: std::env::var("UPSTAGE_BASE_URL")
                .unwrap_or_else(|_| "https://api.upstage.ai/v1/solar".to_string()),
        }
    }

    async fn chat(&self, prompt: &str, stop: Option<Vec<String>>) -> Result<String> {
        if self.api_key.is_empty() {
            return Err(WorkflowError::Llm(
                "UPSTAGE_API_KEY not configured".to_string(),
            ));
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.0,
            stop,
        };

        info!(model = %self.model, "Calling Solar API");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!("Solar API request failed: {}", e);
                WorkflowError::Llm(format!("Solar API error: {}", e))
            })?;

        if !response.status().is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("Solar API error response: {}", error_text);
            return Err(WorkflowError::Llm(format!(
                "Solar API error: {}",
                error_text
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            error!("Failed to parse Solar response: {}", e);
            WorkflowError::Llm(format!("Solar parse error: {}", e))
        })?;

        let answer = chat_response
            .choices
            .first()
            .map(|choice| choice.message.content.clone())
            .ok_or_else(|| WorkflowError::Llm("No response from Solar API".to_string()))?;

        Ok(answer)
    }
}

#[async_trait]
impl LanguageModel for SolarClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.chat(prompt, None).await
    }

    async fn generate_with_stop(&self, prompt: &str, stop: &[&str]) -> Result<String> {
        let stop = stop.iter().map(|s| s.to_string()).collect();
        self.chat(prompt, Some(stop)).await
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Scripted model for development & testing.
/// Keeps the workflow functional without an LLM dependency: responses are
/// consumed from a queue in order, and every call is counted with its
/// prompt recorded.
pub struct ScriptedModel {
    responses: Mutex<VecDeque<String>>,
    prompts: std::sync::Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            prompts: std::sync::Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn push(&self, response: &str) {
        // blocking_lock is fine outside the runtime, but tests run inside
        // tokio, so use try_lock: the queue is never contended in tests.
        if let Ok(mut queue) = self.responses.try_lock() {
            queue.push_back(response.to_string());
        }
    }

    /// Number of generate calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    async fn next(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
        let mut queue = self.responses.lock().await;
        queue
            .pop_front()
            .ok_or_else(|| WorkflowError::Llm("scripted model has no more responses".to_string()))
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.next(prompt).await
    }

    async fn generate_with_stop(&self, prompt: &str, _stop: &[&str]) -> Result<String> {
        self.next(prompt).await
    }
}
