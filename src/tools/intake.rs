//! Built-in document-intake tools
//!
//! Deterministic, in-process implementations of the intake pipeline:
//! preprocess → classify → extract → risk detection → storage →
//! embeddings → alerts → insights. Storage-backed tools write to the
//! shared [`DocumentStore`]; the store handles concurrent writers, the
//! engine does not serialize access to it.

use super::{Tool, ToolError, ToolInput, ToolResult, ToolRegistry, RunContext};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Sectors the classifier can route to, with their routing keywords.
const SECTOR_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "healthcare",
        &["patient", "diagnosis", "prescription", "lab report", "medical", "dosage"],
    ),
    (
        "finance",
        &["invoice", "gst", "payment", "tax", "receipt", "ledger"],
    ),
    (
        "agriculture",
        &["crop", "soil", "harvest", "irrigation", "yield", "fertilizer"],
    ),
    (
        "logistics",
        &["shipment", "delivery", "consignment", "warehouse", "freight", "gps"],
    ),
    (
        "government",
        &["certificate", "application", "compliance", "renewal", "license", "gazette"],
    ),
    (
        "kirana",
        &["shop", "bill", "inventory", "retail", "customer", "stock"],
    ),
];

const RISK_KEYWORDS: &[(&str, &str)] = &[
    ("overdue", "high"),
    ("expired", "high"),
    ("penalty", "high"),
    ("shortage", "medium"),
    ("recall", "high"),
    ("breach", "high"),
    ("delayed", "medium"),
];

const HIGH_VALUE_THRESHOLD: f64 = 100_000.0;

//
// ================= Argument Helpers =================
//

/// Output of the dependency step, injected by the executor.
fn upstream(args: &Value) -> Option<&Value> {
    args.get("upstream")
}

fn require_str<'a>(args: &'a Value, key: &str) -> std::result::Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::permanent(format!("missing '{}' argument", key)))
}

/// Pull a text field from the dependency output first, then from the
/// step's own arguments.
fn text_from(args: &Value) -> std::result::Result<String, ToolError> {
    upstream(args)
        .and_then(|u| u.get("text"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())
        .or_else(|| {
            args.get("text")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
        })
        .ok_or_else(|| ToolError::permanent("no text available (missing upstream output?)"))
}

fn upstream_array<'a>(
    args: &'a Value,
    key: &str,
) -> std::result::Result<&'a Vec<Value>, ToolError> {
    upstream(args)
        .and_then(|u| u.get(key))
        .and_then(Value::as_array)
        .ok_or_else(|| ToolError::permanent(format!("missing '{}' in upstream output", key)))
}

/// Find a monetary amount on a line. Tokens are stripped of currency
/// markers and separators before parsing; only lines that carry an
/// explicit money hint count.
fn extract_amount(line: &str) -> Option<f64> {
    let lower = line.to_lowercase();
    let has_hint = lower.contains('₹')
        || lower.contains("rs.")
        || lower.contains("inr")
        || lower.contains("amount")
        || lower.contains("total")
        || lower.contains("paid");
    if !has_hint {
        return None;
    }

    for token in line.split_whitespace() {
        let cleaned: String = token
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if cleaned.is_empty() || !token.chars().any(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(value) = cleaned.parse::<f64>() {
            if value > 0.0 {
                return Some(value);
            }
        }
    }
    None
}

fn looks_like_date(token: &str) -> bool {
    let separators = token.chars().filter(|c| *c == '/' || *c == '-').count();
    separators >= 2 && token.chars().any(|c| c.is_ascii_digit())
}

//
// ================= Document Store =================
//

/// In-memory external store shared by the storage-backed tools.
///
/// Stands in for the relational + vector stores of a full deployment;
/// the engine only ever sees it through the tools.
pub struct DocumentStore {
    events: RwLock<HashMap<String, Vec<Value>>>,
    alerts: RwLock<HashMap<String, Vec<Value>>>,
    embeddings: RwLock<HashMap<Uuid, Vec<Vec<f32>>>>,
}

impl DocumentStore {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(HashMap::new()),
            alerts: RwLock::new(HashMap::new()),
            embeddings: RwLock::new(HashMap::new()),
        }
    }

    pub fn append_events(&self, entity_id: &str, events: &[Value]) -> usize {
        let mut store = self.events.write().unwrap_or_else(|e| e.into_inner());
        let entry = store.entry(entity_id.to_string()).or_default();
        entry.extend(events.iter().cloned());
        events.len()
    }

    pub fn append_alerts(&self, entity_id: &str, alerts: &[Value]) -> usize {
        let mut store = self.alerts.write().unwrap_or_else(|e| e.into_inner());
        let entry = store.entry(entity_id.to_string()).or_default();
        entry.extend(alerts.iter().cloned());
        alerts.len()
    }

    /// Keyed by run id, so a re-run overwrites rather than duplicates.
    pub fn upsert_embeddings(&self, run_id: Uuid, vectors: Vec<Vec<f32>>) -> usize {
        let count = vectors.len();
        let mut store = self.embeddings.write().unwrap_or_else(|e| e.into_inner());
        store.insert(run_id, vectors);
        count
    }

    pub fn events_for(&self, entity_id: &str) -> Vec<Value> {
        let store = self.events.read().unwrap_or_else(|e| e.into_inner());
        store.get(entity_id).cloned().unwrap_or_default()
    }

    pub fn alerts_for(&self, entity_id: &str) -> Vec<Value> {
        let store = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        store.get(entity_id).cloned().unwrap_or_default()
    }

    pub fn timeline(&self, entity_id: &str, limit: usize) -> Vec<Value> {
        let mut events = self.events_for(entity_id);
        if events.len() > limit {
            events = events.split_off(events.len() - limit);
        }
        events
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

//
// ================= Tools =================
//

/// Extract text and shape metadata from the raw document payload.
pub struct PreprocessDocumentTool;

#[async_trait::async_trait]
impl Tool for PreprocessDocumentTool {
    fn name(&self) -> &'static str {
        "preprocess_document"
    }

    fn description(&self) -> &'static str {
        "Extract text and metadata from the raw document payload"
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        match output.get("text").and_then(Value::as_str) {
            Some(text) if !text.trim().is_empty() => Ok(()),
            _ => Err("preprocessing produced no text".to_string()),
        }
    }

    async fn execute(&self, input: &ToolInput, _ctx: &RunContext) -> ToolResult {
        let content = require_str(&input.arguments, "content")?;
        let document_name = input
            .arguments
            .get("document_name")
            .and_then(Value::as_str)
            .unwrap_or("unnamed");

        let text = content.trim();
        if text.is_empty() {
            return Err(ToolError::permanent("document has no extractable text"));
        }

        let line_count = text.lines().filter(|l| !l.trim().is_empty()).count();
        let word_count = text.split_whitespace().count();

        Ok(json!({
            "text": text,
            "metadata": {
                "document_name": document_name,
                "length": text.len(),
                "line_count": line_count,
                "word_count": word_count,
            }
        }))
    }
}

/// Route the document to a sector via keyword scoring.
/// Deterministic stand-in for the LLM router of a full deployment.
pub struct ClassifySectorTool;

#[async_trait::async_trait]
impl Tool for ClassifySectorTool {
    fn name(&self) -> &'static str {
        "classify_sector"
    }

    fn description(&self) -> &'static str {
        "Classify the document into one of the supported sectors"
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        let sector = output.get("sector").and_then(Value::as_str).unwrap_or("");
        let confidence = output
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(-1.0);

        if sector.is_empty() || sector == "unknown" {
            return Err("classification did not resolve a sector".to_string());
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(format!("confidence {} outside [0, 1]", confidence));
        }
        Ok(())
    }

    async fn execute(&self, input: &ToolInput, _ctx: &RunContext) -> ToolResult {
        let text = text_from(&input.arguments)?;
        let lower = text.to_lowercase();

        let mut best: (&str, usize) = ("unknown", 0);
        for (sector, keywords) in SECTOR_KEYWORDS {
            let score: usize = keywords.iter().map(|kw| lower.matches(kw).count()).sum();
            if score > best.1 {
                best = (sector, score);
            }
        }

        let (sector, score) = best;
        let confidence = if score == 0 {
            0.0
        } else {
            (0.5 + 0.1 * score as f64).min(0.95)
        };

        Ok(json!({
            "sector": sector,
            "confidence": confidence,
            "text": text,
        }))
    }
}

/// Extract structured events from the classified document text.
pub struct ExtractEventsTool;

#[async_trait::async_trait]
impl Tool for ExtractEventsTool {
    fn name(&self) -> &'static str {
        "extract_events"
    }

    fn description(&self) -> &'static str {
        "Extract structured events from the document text"
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        match output.get("events").and_then(Value::as_array) {
            Some(events) if !events.is_empty() => Ok(()),
            Some(_) => Err("extraction produced no events".to_string()),
            None => Err("extraction output is missing 'events'".to_string()),
        }
    }

    async fn execute(&self, input: &ToolInput, _ctx: &RunContext) -> ToolResult {
        let text = text_from(&input.arguments)?;
        let sector = upstream(&input.arguments)
            .and_then(|u| u.get("sector"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let keywords: &[&str] = SECTOR_KEYWORDS
            .iter()
            .find(|(name, _)| *name == sector)
            .map(|(_, kws)| *kws)
            .unwrap_or(&[]);

        let mut events = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            if let Some(value) = extract_amount(line) {
                events.push(json!({
                    "event_type": "amount",
                    "description": line,
                    "value": value,
                }));
            } else if line.split_whitespace().any(looks_like_date) {
                events.push(json!({
                    "event_type": "dated_entry",
                    "description": line,
                }));
            } else {
                let lower = line.to_lowercase();
                if keywords.iter().any(|kw| lower.contains(kw)) {
                    events.push(json!({
                        "event_type": format!("{}_note", sector),
                        "description": line,
                    }));
                }
            }
        }

        Ok(json!({
            "sector": sector,
            "events": events,
        }))
    }
}

/// Apply risk rules over the extracted events.
pub struct DetectRisksTool;

#[async_trait::async_trait]
impl Tool for DetectRisksTool {
    fn name(&self) -> &'static str {
        "detect_risks"
    }

    fn description(&self) -> &'static str {
        "Detect risks over the extracted events"
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        if output.get("risks").and_then(Value::as_array).is_some() {
            Ok(())
        } else {
            Err("risk detection output is missing 'risks'".to_string())
        }
    }

    async fn execute(&self, input: &ToolInput, _ctx: &RunContext) -> ToolResult {
        let events = upstream_array(&input.arguments, "events")?;
        let sector = upstream(&input.arguments)
            .and_then(|u| u.get("sector"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        let mut risks = Vec::new();
        for (i, event) in events.iter().enumerate() {
            let description = event
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("");
            let lower = description.to_lowercase();

            if let Some(value) = event.get("value").and_then(Value::as_f64) {
                if value > HIGH_VALUE_THRESHOLD {
                    risks.push(json!({
                        "code": "high_value_transaction",
                        "severity": "high",
                        "event_index": i,
                        "description": description,
                    }));
                }
            }

            for (keyword, severity) in RISK_KEYWORDS {
                if lower.contains(keyword) {
                    risks.push(json!({
                        "code": format!("keyword_{}", keyword),
                        "severity": severity,
                        "event_index": i,
                        "description": description,
                    }));
                }
            }
        }

        Ok(json!({
            "sector": sector,
            "events": events,
            "risks": risks,
        }))
    }
}

/// Persist extracted events into the document store.
pub struct StoreEventsTool {
    store: Arc<DocumentStore>,
}

impl StoreEventsTool {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for StoreEventsTool {
    fn name(&self) -> &'static str {
        "store_events"
    }

    fn description(&self) -> &'static str {
        "Store extracted events in the document store"
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        if output.get("stored").and_then(Value::as_u64).is_some() {
            Ok(())
        } else {
            Err("store output is missing 'stored'".to_string())
        }
    }

    async fn execute(&self, input: &ToolInput, ctx: &RunContext) -> ToolResult {
        let events = upstream_array(&input.arguments, "events")?;
        let stored = self.store.append_events(&ctx.entity_id, events);

        Ok(json!({
            "entity_id": ctx.entity_id,
            "stored": stored,
        }))
    }
}

/// Produce deterministic embedding vectors for the extracted events.
/// A re-run overwrites the same run key, so the tool is idempotent
/// despite writing to the store.
pub struct CreateEmbeddingsTool {
    store: Arc<DocumentStore>,
}

impl CreateEmbeddingsTool {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

fn embed(text: &str) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().take(8).map(|b| *b as f32 / 255.0).collect()
}

#[async_trait::async_trait]
impl Tool for CreateEmbeddingsTool {
    fn name(&self) -> &'static str {
        "create_embeddings"
    }

    fn description(&self) -> &'static str {
        "Create embedding vectors for extracted events"
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        if output.get("chunks_stored").and_then(Value::as_u64).is_some() {
            Ok(())
        } else {
            Err("embedding output is missing 'chunks_stored'".to_string())
        }
    }

    async fn execute(&self, input: &ToolInput, ctx: &RunContext) -> ToolResult {
        let events = upstream_array(&input.arguments, "events")?;

        let vectors: Vec<Vec<f32>> = events
            .iter()
            .map(|event| {
                let description = event
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("");
                embed(description)
            })
            .collect();

        let chunks_stored = self.store.upsert_embeddings(ctx.run_id, vectors);

        Ok(json!({
            "chunks_stored": chunks_stored,
        }))
    }
}

/// Turn detected risks into alerts.
pub struct GenerateAlertsTool;

#[async_trait::async_trait]
impl Tool for GenerateAlertsTool {
    fn name(&self) -> &'static str {
        "generate_alerts"
    }

    fn description(&self) -> &'static str {
        "Generate alerts from detected risks"
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        if output.get("alerts").and_then(Value::as_array).is_some() {
            Ok(())
        } else {
            Err("alert output is missing 'alerts'".to_string())
        }
    }

    async fn execute(&self, input: &ToolInput, _ctx: &RunContext) -> ToolResult {
        let risks = upstream_array(&input.arguments, "risks")?;
        let sector = upstream(&input.arguments)
            .and_then(|u| u.get("sector"))
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let events_count = upstream(&input.arguments)
            .and_then(|u| u.get("events"))
            .and_then(Value::as_array)
            .map(|e| e.len())
            .unwrap_or(0);

        let alerts: Vec<Value> = risks
            .iter()
            .enumerate()
            .map(|(i, risk)| {
                let severity = risk
                    .get("severity")
                    .and_then(Value::as_str)
                    .unwrap_or("low");
                let code = risk.get("code").and_then(Value::as_str).unwrap_or("risk");
                json!({
                    "alert_id": format!("alert-{}", i),
                    "severity": severity,
                    "message": format!("[{}] {} detected", sector, code),
                    "risk": risk,
                })
            })
            .collect();

        Ok(json!({
            "sector": sector,
            "events_count": events_count,
            "risks": risks,
            "alerts": alerts,
        }))
    }
}

/// Persist generated alerts into the document store.
pub struct StoreAlertsTool {
    store: Arc<DocumentStore>,
}

impl StoreAlertsTool {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl Tool for StoreAlertsTool {
    fn name(&self) -> &'static str {
        "store_alerts"
    }

    fn description(&self) -> &'static str {
        "Store generated alerts in the document store"
    }

    fn idempotent(&self) -> bool {
        false
    }

    fn side_effecting(&self) -> bool {
        true
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        if output.get("stored").and_then(Value::as_u64).is_some() {
            Ok(())
        } else {
            Err("store output is missing 'stored'".to_string())
        }
    }

    async fn execute(&self, input: &ToolInput, ctx: &RunContext) -> ToolResult {
        let alerts = upstream_array(&input.arguments, "alerts")?;
        let stored = self.store.append_alerts(&ctx.entity_id, alerts);

        Ok(json!({
            "entity_id": ctx.entity_id,
            "stored": stored,
        }))
    }
}

/// Synthesize a closing summary of the run.
pub struct GenerateInsightsTool;

#[async_trait::async_trait]
impl Tool for GenerateInsightsTool {
    fn name(&self) -> &'static str {
        "generate_insights"
    }

    fn description(&self) -> &'static str {
        "Synthesize an insight summary of the processed document"
    }

    fn check_output(&self, output: &Value) -> std::result::Result<(), String> {
        match output.get("headline").and_then(Value::as_str) {
            Some(headline) if !headline.is_empty() => Ok(()),
            _ => Err("insight output is missing a headline".to_string()),
        }
    }

    async fn execute(&self, input: &ToolInput, _ctx: &RunContext) -> ToolResult {
        let up = upstream(&input.arguments)
            .ok_or_else(|| ToolError::permanent("no upstream output for insights"))?;

        let sector = up.get("sector").and_then(Value::as_str).unwrap_or("unknown");
        let events = up
            .get("events_count")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let risks = up
            .get("risks")
            .and_then(Value::as_array)
            .map(|r| r.len())
            .unwrap_or(0);
        let alerts = up
            .get("alerts")
            .and_then(Value::as_array)
            .map(|a| a.len())
            .unwrap_or(0);

        let headline = format!(
            "{}: {} event(s), {} risk(s), {} alert(s)",
            sector, events, risks, alerts
        );

        Ok(json!({
            "headline": headline,
            "sector": sector,
            "summary": {
                "events": events,
                "risks": risks,
                "alerts": alerts,
            }
        }))
    }
}

/// Create the default registry with the full document-intake tool set.
pub fn create_default_registry(store: Arc<DocumentStore>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(Arc::new(PreprocessDocumentTool));
    registry.register(Arc::new(ClassifySectorTool));
    registry.register(Arc::new(ExtractEventsTool));
    registry.register(Arc::new(DetectRisksTool));
    registry.register(Arc::new(StoreEventsTool::new(store.clone())));
    registry.register(Arc::new(CreateEmbeddingsTool::new(store.clone())));
    registry.register(Arc::new(GenerateAlertsTool));
    registry.register(Arc::new(StoreAlertsTool::new(store)));
    registry.register(Arc::new(GenerateInsightsTool));

    registry
}

//
// ================= Tests =================
//
