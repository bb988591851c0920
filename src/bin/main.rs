use financial_qa_orchestrator::{
    analyst::FinancialAnalyst,
    config::Config,
    history::{InMemoryTranscriptStore, SqliteTranscriptStore, TranscriptStore},
    llm::SolarClient,
    quality::QualityEvaluator,
    report::tools::{FileReportSink, SvgChartRenderer},
    report::ReportGenerator,
    retriever::{InMemoryVectorStore, Retriever},
    tools::{create_analyst_registry, TavilyClient, YahooFinanceClient},
    workflow::WorkflowEngine,
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    info!("Financial QA Orchestrator starting");

    let config = Config::from_env();
    config.validate_api_keys()?;

    let question = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let question = if question.trim().is_empty() {
        "삼성전자와 애플의 최근 주가를 비교 후, 간단하게 차트를 그려줘".to_string()
    } else {
        question
    };

    // Live adapters
    let llm = Arc::new(SolarClient::new(
        config.upstage_api_key.clone(),
        config.llm_model.clone(),
    ));
    let market = Arc::new(YahooFinanceClient::new());
    let web = Arc::new(TavilyClient::new(config.tavily_api_key.clone()));

    let transcripts: Arc<dyn TranscriptStore> =
        match SqliteTranscriptStore::new(&config.database_path) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!("Sqlite transcript store unavailable ({}), using in-memory", e);
                Arc::new(InMemoryTranscriptStore::new())
            }
        };

    let registry = create_analyst_registry(market, web, config.data_dir.clone());
    let engine = WorkflowEngine::new(
        llm.clone(),
        FinancialAnalyst::new(llm.clone(), registry),
        Retriever::new(
            Arc::new(InMemoryVectorStore::new()),
            config.retrieval_top_k,
            config.retrieval_threshold,
        ),
        ReportGenerator::new(
            llm.clone(),
            Arc::new(SvgChartRenderer),
            Arc::new(FileReportSink),
            config.charts_dir.clone(),
            config.reports_dir.clone(),
        ),
        QualityEvaluator::new(llm, config.quality_threshold),
        transcripts,
        config.max_retries,
    );

    println!("{}", "=".repeat(80));
    println!("Q: {}", question);
    println!("{}", "=".repeat(80));

    let state = engine.run(&question).await?;

    println!("\n{}\n", state.answer);

    if !state.charts.is_empty() {
        println!("charts:");
        for chart in &state.charts {
            println!("  - {}", chart);
        }
    }
    if let Some(saved) = &state.saved_path {
        println!("saved report: {}", saved);
    }
    if !state.rag_search_results.is_empty() {
        println!("rag_search_results:");
        for line in &state.rag_search_results {
            println!("  {}", line);
        }
    }
    if let Some(detail) = &state.quality_detail {
        println!(
            "quality: score={} passed={} retries={}",
            detail.score, state.quality_passed, state.retries
        );
    }

    Ok(())
}
