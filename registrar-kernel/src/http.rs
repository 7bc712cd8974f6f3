/**
 * REGISTRAR REST API - HTTP surface of the registrar
 *
 * ROLE :
 * Lets the virtualization side queue registration requests and read back the
 * registry. Reads are served from memory, so the API stays responsive while a
 * reconciliation cycle waits on the backend.
 *
 * ROUTES :
 * - GET /health : cycle statistics, never authenticated
 * - GET /dump, /waiting, /machines, /status : registry views
 * - POST /register : queue (or update) a pending request, 201
 * - PUT /update/{id}, DELETE /unregister/{id} : acknowledged, no effect yet
 *
 * GATES (outermost first) :
 * - mutating methods need a text or application content type with a
 *   json, yaml or csv subtype, otherwise 400
 * - HTTP Basic credentials checked against the backend identity service when
 *   the backend has one, otherwise 401
 */

use crate::backend::ProvisioningBackend;
use crate::error::RequestError;
use crate::health::{CycleTracker, RegistrarHealth};
use crate::models::{is_present, FieldSet, PendingEntry, RegisteredEntry};
use crate::state::SharedStore;
use crate::store::{PendingMap, RegisteredMap};
use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fields exposed by `/status`, as paths into the entry.
const STATUS_FIELDS: [&str; 17] = [
    "vnc-info",
    "virt-uuid",
    "power_state",
    "target_power_state",
    "provision_state",
    "last_error",
    "properties/cpus",
    "properties/local_gb",
    "properties/memory_mb",
    "target_provision_state",
    "extra/roles",
    "extra/all/macs",
    "extra/all/interfaces/eth0/ip",
    "nics",
    "first_seen_at",
    "last_seen_at",
    "last_modified_at",
];

#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub backend: Arc<dyn ProvisioningBackend>,
    pub tracker: CycleTracker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadFormat {
    Json,
    Yaml,
    Csv,
}

impl PayloadFormat {
    /// `None` for anything outside text/* and application/* with a known subtype.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next()?.trim().to_ascii_lowercase();
        let (kind, subtype) = essence.split_once('/')?;
        if kind != "text" && kind != "application" {
            return None;
        }
        match subtype {
            "json" => Some(PayloadFormat::Json),
            "yaml" | "x-yaml" => Some(PayloadFormat::Yaml),
            "csv" | "x-csv" => Some(PayloadFormat::Csv),
            _ => None,
        }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/dump", get(get_dump))
        .route("/waiting", get(get_waiting))
        .route("/machines", get(get_machines))
        .route("/status", get(get_status))
        .route("/register", post(register))
        .route("/update/{id}", put(update))
        .route("/unregister/{id}", delete(unregister))
        .with_state(app_state.clone())
        .layer(middleware::from_fn_with_state(app_state, require_basic_auth))
        .layer(middleware::from_fn(require_supported_content_type))
}

async fn require_supported_content_type(req: Request, next: Next) -> Result<Response, RequestError> {
    if matches!(*req.method(), Method::POST | Method::PUT | Method::DELETE) {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if PayloadFormat::from_content_type(content_type).is_none() {
            warn!(method = %req.method(), path = %req.uri().path(), %content_type, "rejected content type");
            return Err(RequestError::UnsupportedContentType(content_type.to_string()));
        }
    }
    Ok(next.run(req).await)
}

async fn require_basic_auth(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, RequestError> {
    if req.uri().path().starts_with("/health") || !app.backend.auth_enabled() {
        return Ok(next.run(req).await);
    }

    let Some((username, password)) = basic_credentials(req.headers()) else {
        return Err(RequestError::Unauthorized);
    };
    match app.backend.verify_credentials(&username, &password).await {
        Ok(true) => Ok(next.run(req).await),
        Ok(false) => {
            warn!(%username, path = %req.uri().path(), "invalid credentials");
            Err(RequestError::Unauthorized)
        }
        Err(e) => {
            warn!(%username, error = %e, "credential check failed");
            Err(RequestError::Unauthorized)
        }
    }
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = String::from_utf8(STANDARD.decode(encoded.trim()).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<RegistrarHealth> {
    Json(app.tracker.get_health(&app.store.lock()))
}

#[derive(Serialize)]
struct Dump {
    pending: PendingMap,
    registered: RegisteredMap,
}

// GET /dump
async fn get_dump(State(app): State<AppState>) -> Json<Dump> {
    let store = app.store.lock();
    Json(Dump {
        pending: store.all_pending().clone(),
        registered: store.all_registered().clone(),
    })
}

// GET /waiting
async fn get_waiting(State(app): State<AppState>) -> Json<PendingMap> {
    Json(app.store.lock().all_pending().clone())
}

// GET /machines (keyed by virtual name)
async fn get_machines(State(app): State<AppState>) -> Json<BTreeMap<String, RegisteredEntry>> {
    let store = app.store.lock();
    let machines = store
        .all_registered()
        .values()
        .filter_map(|entry| Some((entry.virtual_name.clone()?, entry.clone())))
        .collect();
    Json(machines)
}

// GET /status (allowlisted fields, keyed by virtual name)
async fn get_status(State(app): State<AppState>) -> Json<BTreeMap<String, FieldSet>> {
    let store = app.store.lock();
    let mut status = BTreeMap::new();
    for entry in store.all_registered().values() {
        let Some(name) = &entry.virtual_name else { continue };
        match status_view(entry) {
            Ok(view) => {
                status.insert(name.clone(), view);
            }
            Err(e) => warn!(id = %entry.id, error = %e, "entry left out of status"),
        }
    }
    Json(status)
}

fn status_view(entry: &RegisteredEntry) -> Result<FieldSet, serde_json::Error> {
    let fields = Value::Object(entry.to_fields()?);
    let mut view = FieldSet::new();
    view.insert("ironic-uuid".into(), Value::String(entry.id.clone()));
    for path in STATUS_FIELDS {
        if let Some(value) = fields.pointer(&format!("/{path}")).filter(|v| is_present(v)) {
            view.insert(path.to_string(), value.clone());
        }
    }
    Ok(view)
}

// POST /register
async fn register(
    State(app): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, RequestError> {
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let format = PayloadFormat::from_content_type(content_type)
        .ok_or_else(|| RequestError::UnsupportedContentType(content_type.to_string()))?;

    let pending = parse_pending(format, &body)?;
    let request_id = pending.request_id.clone();
    let changed = app.store.lock().upsert_pending(pending);
    info!(request = %request_id, ?changed, "registration request queued");
    Ok(StatusCode::CREATED)
}

fn parse_pending(format: PayloadFormat, body: &[u8]) -> Result<PendingEntry, RequestError> {
    let value: Value = match format {
        PayloadFormat::Json => {
            serde_json::from_slice(body).map_err(|e| RequestError::Malformed(e.to_string()))?
        }
        PayloadFormat::Yaml => {
            serde_yaml::from_slice(body).map_err(|e| RequestError::Malformed(e.to_string()))?
        }
        PayloadFormat::Csv => {
            return Err(RequestError::Malformed("CSV registrations are not supported".into()))
        }
    };

    let has_id = value
        .get("virt-uuid")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty());
    if !has_id {
        return Err(RequestError::Malformed("missing virt-uuid".into()));
    }
    serde_json::from_value(value).map_err(|e| RequestError::Malformed(e.to_string()))
}

// PUT /update/{id}
async fn update(Path(id): Path<String>) -> StatusCode {
    debug!(%id, "update requested, nothing to do");
    StatusCode::NO_CONTENT
}

// DELETE /unregister/{id}
async fn unregister(Path(id): Path<String>) -> StatusCode {
    debug!(%id, "unregister requested, nothing to do");
    StatusCode::OK
}
