//! HTTP Route Handlers
//!
//! The external surface: message intake, conversation queries, approval
//! interaction, observability, and the admin triggers. Every error that
//! leaves this module is JSON with a details array.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::energy::EnergyRegulator;
use crate::events::EventPublisher;
use crate::state::{now_rfc3339, StateFilter, StoreHandle};
use crate::types::{ApprovalStatus, BudgetStatus, Event, LoopSignal};

use super::middleware::RateLimitState;

/// Everything the handlers share. Ingress sees the store and regulator
/// only through their public operations and talks to the loop over the
/// signal channel.
#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub regulator: Arc<EnergyRegulator>,
    pub events: EventPublisher,
    pub signals: mpsc::UnboundedSender<LoopSignal>,
    pub max_message_length: usize,
    pub started_at: Instant,
    pub rate: Arc<RateLimitState>,
}

// ─── Errors ──────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("validation failed")]
    Validation(Vec<String>),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, details) = match self {
            ApiError::Validation(details) => {
                (StatusCode::BAD_REQUEST, "validation failed", details)
            }
            ApiError::NotFound(what) => (StatusCode::NOT_FOUND, "not found", vec![what]),
            ApiError::Conflict(what) => (StatusCode::CONFLICT, "conflict", vec![what]),
        };
        (status, Json(json!({ "error": error, "details": details }))).into_response()
    }
}

// ─── Bodies ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    #[serde(default)]
    pub content: String,
    pub id: Option<String>,
    pub energy_budget: Option<f64>,
    pub approval_response: Option<ApprovalResponseBody>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponseBody {
    pub approved: bool,
    pub feedback: Option<String>,
    pub budget_delta: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalActionBody {
    pub feedback: Option<String>,
    pub budget_delta: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub state: Option<String>,
    pub budget_status: Option<String>,
    pub limit: Option<i64>,
}

// ─── Validation ──────────────────────────────────────────────────

/// Strip script elements (and any orphan script tags) out of user text.
pub fn sanitize_content(content: &str) -> String {
    let mut out = content.to_string();
    if let Ok(element) = regex::Regex::new(r"(?is)<script\b[^>]*>.*?</script>") {
        out = element.replace_all(&out, "").to_string();
    }
    if let Ok(tag) = regex::Regex::new(r"(?i)</?script\b[^>]*>") {
        out = tag.replace_all(&out, "").to_string();
    }
    out
}

fn validate_message(body: &MessageBody, max_length: usize) -> Vec<String> {
    let mut errors = Vec::new();
    if body.content.trim().is_empty() {
        errors.push("content must be a non-empty string".to_string());
    }
    if body.content.chars().count() > max_length {
        errors.push(format!("content exceeds maximum length of {max_length} characters"));
    }
    if let Some(id) = &body.id {
        match Uuid::parse_str(id) {
            Ok(parsed) if parsed.get_version_num() == 4 => {}
            _ => errors.push(format!("id must be a UUID v4: {id}")),
        }
    }
    if let Some(budget) = body.energy_budget {
        if budget < 0.0 || !budget.is_finite() {
            errors.push(format!("energyBudget must be a non-negative number: {budget}"));
        }
    }
    errors
}

// ─── Message Intake ──────────────────────────────────────────────

pub async fn post_message(
    State(app): State<AppState>,
    Json(body): Json<MessageBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    // An approvalResponse for an existing conversation mutates its latest
    // pending approval instead of creating anything new.
    if let Some(approval) = &body.approval_response {
        let Some(id) = body.id.as_deref() else {
            return Err(ApiError::Validation(vec![
                "approvalResponse requires the conversation id".to_string(),
            ]));
        };
        if app.store.get(id).is_none() {
            return Err(ApiError::NotFound(format!("conversation {id}")));
        }
        let status = if approval.approved {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Rejected
        };
        let moved = app
            .store
            .set_approval_status(id, None, status, approval.feedback.as_deref());
        if !moved {
            return Err(ApiError::Conflict(format!("conversation {id} has no pending approval")));
        }
        if let Some(delta) = approval.budget_delta {
            app.store.adjust_budget(id, delta);
        }
        return Ok((
            StatusCode::OK,
            Json(json!({ "status": "received", "requestId": id, "timestamp": now_rfc3339() })),
        ));
    }

    let errors = validate_message(&body, app.max_message_length);
    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let request_id = body.id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
    let content = sanitize_content(&body.content);

    app.store.upsert_request(&request_id, &content, body.energy_budget);
    app.events.publish(Event::ConversationCreated { request_id: request_id.clone() });
    let _ = app.signals.send(LoopSignal::NewMessage(request_id.clone()));

    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "received", "requestId": request_id, "timestamp": now_rfc3339() })),
    ))
}

// ─── Conversation Queries ────────────────────────────────────────

pub async fn get_conversations(
    State(app): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut errors = Vec::new();

    let state = match query.state.as_deref() {
        None | Some("") => None,
        Some(raw) => match StateFilter::parse(raw) {
            Some(filter) => Some(filter),
            None => {
                errors.push(format!(
                    "state must be one of pending|active|ended|snoozed: {raw}"
                ));
                None
            }
        },
    };

    let budget = match query.budget_status.as_deref() {
        None | Some("") => None,
        Some("within") => Some(BudgetStatus::Within),
        Some("exceeded") => Some(BudgetStatus::Exceeded),
        Some("depleted") => Some(BudgetStatus::Depleted),
        Some(raw) => {
            errors.push(format!(
                "budgetStatus must be one of within|exceeded|depleted: {raw}"
            ));
            None
        }
    };

    let limit = query.limit.unwrap_or(20);
    if !(1..=100).contains(&limit) {
        errors.push(format!("limit must be between 1 and 100: {limit}"));
    }

    if !errors.is_empty() {
        return Err(ApiError::Validation(errors));
    }

    let conversations = app.store.list(state, budget, limit);
    let count = conversations.len();
    Ok(Json(json!({ "conversations": conversations, "count": count })))
}

pub async fn get_conversation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let record = app
        .store
        .get(&id)
        .ok_or_else(|| ApiError::NotFound(format!("conversation {id}")))?;
    Ok(Json(serde_json::to_value(record).unwrap_or_default()))
}

// ─── Approvals ───────────────────────────────────────────────────

pub async fn get_approvals(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if app.store.get(&id).is_none() {
        return Err(ApiError::NotFound(format!("conversation {id}")));
    }
    let approvals = app.store.approvals(&id);
    Ok(Json(json!({ "requestId": id, "approvals": approvals })))
}

async fn decide_approval(
    app: AppState,
    id: String,
    body: Option<ApprovalActionBody>,
    status: ApprovalStatus,
) -> Result<Json<serde_json::Value>, ApiError> {
    if app.store.get(&id).is_none() {
        return Err(ApiError::NotFound(format!("conversation {id}")));
    }
    let body = body.unwrap_or(ApprovalActionBody { feedback: None, budget_delta: None });
    let moved = app
        .store
        .set_approval_status(&id, None, status, body.feedback.as_deref());
    if !moved {
        return Err(ApiError::Conflict(format!("conversation {id} has no pending approval")));
    }
    if let Some(delta) = body.budget_delta {
        app.store.adjust_budget(&id, delta);
    }
    app.events.publish(Event::ConversationStateChanged {
        request_id: id.clone(),
        state: match status {
            ApprovalStatus::Approved => "approved".to_string(),
            _ => "rejected".to_string(),
        },
    });
    Ok(Json(json!({ "requestId": id, "status": status })))
}

pub async fn post_approve(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ApprovalActionBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    decide_approval(app, id, body.map(|Json(b)| b), ApprovalStatus::Approved).await
}

pub async fn post_reject(
    State(app): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ApprovalActionBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    decide_approval(app, id, body.map(|Json(b)| b), ApprovalStatus::Rejected).await
}

// ─── Observability ───────────────────────────────────────────────

pub async fn get_health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let stats = app.store.stats();
    Json(json!({
        "status": "ok",
        "uptimeSecs": app.started_at.elapsed().as_secs(),
        "energy": {
            "current": app.regulator.current(),
            "percentage": app.regulator.percentage(),
            "status": app.regulator.status(),
        },
        "conversations": stats.total_conversations,
    }))
}

pub async fn get_ready() -> Json<serde_json::Value> {
    Json(json!({ "status": "ready" }))
}

pub async fn get_live() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

pub async fn get_energy(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "current": app.regulator.current(),
        "percentage": app.regulator.percentage(),
        "status": app.regulator.status(),
    }))
}

pub async fn get_stats(State(app): State<AppState>) -> Json<serde_json::Value> {
    let stats = app.store.stats();
    Json(json!({
        "store": stats,
        "energy": {
            "current": app.regulator.current(),
            "percentage": app.regulator.percentage(),
            "status": app.regulator.status(),
        },
    }))
}

// ─── Admin ───────────────────────────────────────────────────────

pub async fn post_trigger_reflection(
    State(app): State<AppState>,
) -> Json<serde_json::Value> {
    let _ = app.signals.send(LoopSignal::Reflect);
    Json(json!({ "status": "triggered" }))
}

pub async fn post_process_conversation(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if app.store.get(&id).is_none() {
        return Err(ApiError::NotFound(format!("conversation {id}")));
    }
    let _ = app.signals.send(LoopSignal::Focus(id.clone()));
    Ok(Json(json!({ "status": "focused", "requestId": id })))
}
