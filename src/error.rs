//! Error types for the document-intake execution engine

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {

    // =============================
    // Run Admission Errors
    // =============================

    #[error("Invalid task input: {0}")]
    InvalidTaskInput(String),

    #[error("Unknown task category: {0}")]
    UnknownTaskCategory(String),

    // =============================
    // Engine Errors
    // =============================

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Run {0} is already terminal")]
    RunAlreadyTerminal(Uuid),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Catalog error: {0}")]
    CatalogError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
