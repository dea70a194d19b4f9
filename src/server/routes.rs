//! Route handlers.

use super::error::{ApiError, ApiResult};
use crate::core::orchestrator::Orchestrator;
use crate::core::types::{PipelineRun, RawIntent, Submission, ValidationOverride};
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub type AppState = Arc<Orchestrator>;

/// POST /generate body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
    /// Explicit fields; they win over anything extracted from the prompt.
    #[serde(default)]
    pub fields: serde_json::Map<String, Value>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default, rename = "override")]
    pub validation_override: Option<ValidationOverride>,
}

impl GenerateRequest {
    fn into_submission(self) -> Submission {
        let mut fields = RawIntent::new();
        for (k, v) in self.fields {
            fields = fields.with(&k, v);
        }
        if let Some(provider) = self.provider {
            fields = fields.with("provider", Value::String(provider));
        }
        if let Some(format) = self.output_format {
            fields = fields.with("format", Value::String(format));
        }
        Submission {
            prompt: self.prompt,
            fields,
            actor: self.actor,
            validation_override: self.validation_override,
            ..Submission::default()
        }
    }
}

/// POST /apply body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub artifact_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub since: Option<String>,
}

/// GET /health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /generate: resolve, generate and validate; park the run when the
/// gate is open.
pub async fn generate(
    State(orchestrator): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> ApiResult<Json<Value>> {
    let run = orchestrator.prepare(req.into_submission()).await;
    let body = json!({
        "runId": run.id,
        "state": run.state,
        "artifact": run.artifact,
        "verdict": run.verdict,
        "audit": run.audit,
    });
    match &run.halt {
        Some(error) => Err(ApiError::pipeline(error.clone(), body)),
        None => Ok(Json(body)),
    }
}

fn execution_body(run: &PipelineRun) -> Value {
    json!({
        "runId": run.id,
        "state": run.state,
        "executionRecord": run.execution,
        "commit": run.commit,
        "audit": run.audit,
    })
}

/// POST /apply: execute a parked, validated artifact.
pub async fn apply(
    State(orchestrator): State<AppState>,
    Json(req): Json<ApplyRequest>,
) -> ApiResult<Json<Value>> {
    let run = orchestrator.take_parked(req.artifact_id).ok_or_else(|| {
        ApiError::NotFound(format!(
            "no validated artifact '{}' awaiting execution",
            req.artifact_id
        ))
    })?;
    let run = orchestrator.execute(run).await;
    let body = execution_body(&run);
    match run.error() {
        Some(error) => Err(ApiError::pipeline(error.clone(), body)),
        None => Ok(Json(body)),
    }
}

/// GET /audit?since=<rfc3339>
pub async fn audit(
    State(orchestrator): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Value>> {
    let since = match query.since.as_deref() {
        Some(ts) => DateTime::parse_from_rfc3339(ts)
            .map_err(|e| ApiError::BadRequest(format!("invalid since '{}': {}", ts, e)))?
            .with_timezone(&Utc),
        None => DateTime::<Utc>::UNIX_EPOCH,
    };
    let ledger = Arc::clone(orchestrator.ledger());
    let entries = tokio::task::spawn_blocking(move || ledger.since(since))
        .await
        .map_err(|e| ApiError::Internal(format!("audit read task failed: {}", e)))?
        .map_err(|e| ApiError::pipeline(e.into(), Value::Null))?;
    Ok(Json(json!(entries)))
}

/// GET /runs/{id}: the in-process run report, or the persisted audit chain
/// for runs from an earlier process.
pub async fn get_run(
    State(orchestrator): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Json<Value>> {
    if let Some(run) = orchestrator.report(run_id) {
        return Ok(Json(json!({
            "runId": run.id,
            "state": run.state,
            "actor": run.actor,
            "error": run.error().map(|e| e.to_string()),
            "request": run.request,
            "verdict": run.verdict,
            "executionRecord": run.execution,
            "commit": run.commit,
            "audit": run.audit,
        })));
    }
    let ledger = Arc::clone(orchestrator.ledger());
    let audit = tokio::task::spawn_blocking(move || ledger.history(run_id))
        .await
        .map_err(|e| ApiError::Internal(format!("audit read task failed: {}", e)))?
        .map_err(|e| ApiError::pipeline(e.into(), Value::Null))?;
    if audit.is_empty() {
        return Err(ApiError::NotFound(format!("run '{}' not found", run_id)));
    }
    let state = audit.last().and_then(|e| e.next.or(Some(e.stage)));
    Ok(Json(json!({ "runId": run_id, "state": state, "audit": audit })))
}
