use document_intake_orchestrator::{
    api::start_server,
    catalog::TaskCatalog,
    executor::Executor,
    orchestrator::Orchestrator,
    planner::CatalogPlanner,
    recovery::{RecoveryConfig, RecoveryController},
    store::InMemoryRunStore,
    tools::{create_default_registry, DocumentStore},
    validator::ValidationEngine,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let api_port: u16 = std::env::var("PORT")
        .or_else(|_| std::env::var("API_PORT"))
        .unwrap_or_else(|_| "8080".to_string())
        .parse()?;

    info!("🚀 Document Intake Orchestrator - API Server");
    info!("📍 Port: {}", api_port);

    // Create components
    let catalog = match std::env::var("TASK_CATALOG_PATH") {
        Ok(path) => TaskCatalog::from_json_file(path)?,
        Err(_) => TaskCatalog::default_catalog(),
    };
    let store = Arc::new(DocumentStore::new());
    let registry = Arc::new(create_default_registry(store.clone()));
    let run_store = Arc::new(InMemoryRunStore::new());

    // Create orchestrator
    let orchestrator = Arc::new(Orchestrator::new(
        Box::new(CatalogPlanner::new(catalog)),
        Executor::new(registry.clone()),
        ValidationEngine::new(registry.clone()),
        RecoveryController::new(RecoveryConfig::from_env(), registry),
        run_store,
    ));

    info!("✅ Orchestrator initialized");
    info!("📡 Starting API server...");

    // Start API server
    start_server(orchestrator, api_port).await?;

    Ok(())
}
