//! Document Intake Orchestrator
//!
//! An autonomous execution engine for document-intake pipelines:
//! - Deterministic catalogue-driven planning per task category
//! - Closed tool registry (classification, event extraction, risk
//!   detection, storage, alerting, insights)
//! - Validation of every attempt against tool-declared well-formedness
//! - Bounded retries with exponential backoff; successful side-effecting
//!   steps are carried forward, never re-invoked
//! - Append-only execution log and a persistent run archive
//!
//! UNIFIED LOOP:
//! INPUT → PLAN → EXECUTE → VALIDATE → RECOVER? → COMPLETE

pub mod api;
pub mod catalog;
pub mod error;
pub mod executor;
pub mod models;
pub mod orchestrator;
pub mod planner;
pub mod recovery;
pub mod store;
pub mod tools;
pub mod trace;
pub mod validator;

pub use error::{EngineError, Result};

// Re-export common types
pub use models::*;
pub use orchestrator::Orchestrator;
