//! Financial QA Orchestrator
//!
//! A multi-agent workflow that answers finance questions:
//! - Classifies whether a question is finance-related at all
//! - Routes it to document retrieval or live market analysis
//! - Generates a markdown report, with optional charts and file export
//! - Gates every answer through an LLM-as-a-judge quality check
//! - Retries failed answers with a rewritten query, at most three times
//!
//! PIPELINE:
//! QUESTION → CLASSIFY → ROUTE → ANALYZE/RETRIEVE → REPORT → EVALUATE → RETRY? → ANSWER

pub mod analyst;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod models;
pub mod quality;
pub mod report;
pub mod request_analyst;
pub mod retriever;
pub mod supervisor;
pub mod tools;
pub mod workflow;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use workflow::WorkflowEngine;
