use document_intake_orchestrator::{
    catalog::TaskCatalog,
    executor::Executor,
    models::{RunOutcome, TaskInput},
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
        .with_max_level(tracing::Level::DEBUG)
        .init();

    dotenv::dotenv().ok();

    info!("Document Intake Orchestrator starting");

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

    // Submit a sample document
    let task = TaskInput {
        entity_id: "kirana_store_42".to_string(),
        category: "document".to_string(),
        document_name: "supplier_invoice_august.txt".to_string(),
        payload: serde_json::json!({
            "content": "Invoice from wholesale supplier. Stock delivery of rice and \
                        flour delayed by two weeks. Payment of Rs 125000 is overdue \
                        since 2026-08-15. Credit limit nearly exhausted.",
        }),
    };

    info!(
        entity_id = %task.entity_id,
        document_name = %task.document_name,
        "Submitting run"
    );

    let run_id = orchestrator.start_run(task).await?;
    let status = orchestrator.wait_for_result(run_id).await?;

    println!("\n=== RUN RESULT ===");
    println!("Run ID: {}", run_id);
    println!("State: {}", status.state);
    println!("Retries: {}", status.retry_count);

    match status.outcome {
        Some(RunOutcome::Succeeded { final_outputs }) => {
            if let Some(insights) = final_outputs.get("generate_insights") {
                println!("Insights: {}", serde_json::to_string_pretty(insights)?);
            }
        }
        Some(RunOutcome::Failed { reason, .. }) => {
            println!("Failure reason: {:?}", reason);
        }
        None => {}
    }

    println!("\nExecution Log:");
    for entry in orchestrator.get_execution_log(run_id).await? {
        println!(
            "  {:>3}  {}  {}",
            entry.sequence,
            entry.timestamp.format("%H:%M:%S%.3f"),
            serde_json::to_string(&entry.kind)?
        );
    }

    Ok(())
}
