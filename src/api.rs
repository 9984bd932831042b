//! HTTP surfaces of the control plane.
//!
//! [`http_router`] serves producers (inbox submissions) and operators
//! (roster, dispatch, artifact library). [`control_router`] accepts agent
//! WebSocket connections and runs on its own port.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{routing, Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::artifacts::{ArtifactError, ArtifactLibrary};
use crate::dispatch::{Delivery, DispatchError, Dispatcher, Target};
use crate::protocol::ScriptKind;
use crate::registry::{AgentRegistry, RegistryError};
use crate::session::{self, SendError};
use crate::store::{AssetStore, InboxStore, NewInboxEntry, SqliteStore, StoreError, TableStore};

type ApiResponse = (StatusCode, Json<Value>);

#[derive(Clone)]
pub struct AppState {
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<Dispatcher>,
    inbox: Arc<dyn InboxStore>,
    tables: Arc<dyn TableStore>,
    assets: Arc<dyn AssetStore>,
    library: Arc<ArtifactLibrary>,
    max_inbox_bytes: usize,
}

impl AppState {
    pub fn new(
        store: Arc<SqliteStore>,
        registry: Arc<AgentRegistry>,
        library: ArtifactLibrary,
        chunk_size: usize,
        max_inbox_bytes: usize,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(registry.clone(), chunk_size)),
            registry,
            inbox: store.clone(),
            tables: store.clone(),
            assets: store,
            library: Arc::new(library),
            max_inbox_bytes,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DispatchForm {
    client_id: Option<String>,
    message: Option<String>,
    script_name: Option<String>,
    script_type: Option<String>,
    binary_name: Option<String>,
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().map(str::trim).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Routers
// ---------------------------------------------------------------------------

pub fn http_router(state: AppState) -> Router {
    let body_limit = state.max_inbox_bytes;
    Router::new()
        .route("/health", routing::get(health))
        .route("/inbox", routing::post(create_inbox_entry))
        .route("/inbox/{id}", routing::get(get_inbox_entry))
        .route("/clients", routing::get(list_clients))
        .route("/get_tables", routing::get(list_tables))
        .route("/get_scripts", routing::get(list_scripts))
        .route("/send_message", routing::post(send_message))
        .route("/send_message_all", routing::post(send_message_all))
        .route("/send_script", routing::post(send_script))
        .route("/send_script_all", routing::post(send_script_all))
        .route("/send_binary", routing::post(send_binary))
        .route("/refresh", routing::post(refresh))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route("/", routing::get(agent_ws))
        .route("/ws", routing::get(agent_ws))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "fleet-server",
        "version": env!("CARGO_PKG_VERSION"),
        "agentCount": state.registry.snapshot().len(),
    }))
}

async fn agent_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        session::serve_socket(socket, Some(peer), state.registry, state.assets)
    })
}

async fn create_inbox_entry(State(state): State<AppState>, body: axum::body::Bytes) -> ApiResponse {
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "Invalid JSON"),
    };
    let Some(object) = parsed.as_object().filter(|object| !object.is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Empty request received");
    };

    let entry = new_inbox_entry(object, String::from_utf8_lossy(&body).into_owned());
    let inbox = state.inbox.clone();
    match blocking(move || inbox.create_entry(&entry)).await {
        Ok(id) => {
            tracing::info!(target = "fleet_control::api", inbox_id = id, "inbox entry accepted");
            (
                StatusCode::CREATED,
                Json(json!({ "message": "Inbox entry created", "InboxID": id })),
            )
        }
        Err(error) => {
            tracing::error!(target = "fleet_control::api", error = %error, "failed to store inbox entry");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn new_inbox_entry(body: &Map<String, Value>, content: String) -> NewInboxEntry {
    let meta = body.get("MetaData").and_then(Value::as_object);
    let meta_field = |key: &str| {
        meta.and_then(|meta| meta.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };
    let content_type = Some(meta_field("ContentType"))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    NewInboxEntry {
        name: meta_field("Name"),
        description: meta_field("Description"),
        creator: meta_field("Creator"),
        vendor: meta_field("Vendor"),
        content_type,
        content,
    }
}

async fn get_inbox_entry(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResponse {
    let inbox = state.inbox.clone();
    match blocking(move || inbox.entry(id)).await {
        Ok(Some(entry)) => match serde_json::to_value(&entry) {
            Ok(value) => (StatusCode::OK, Json(value)),
            Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string()),
        },
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Inbox entry not found"),
        Err(error) => {
            tracing::error!(target = "fleet_control::api", inbox_id = id, error = %error, "failed to load inbox entry");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn list_clients(State(state): State<AppState>) -> Json<Value> {
    let clients: Map<String, Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|agent| {
            (
                agent.id,
                json!({
                    "hostname": agent.hostname,
                    "ip": agent.address,
                    "last_seen": agent.last_seen.to_rfc3339(),
                }),
            )
        })
        .collect();
    Json(Value::Object(clients))
}

async fn list_tables(State(state): State<AppState>) -> ApiResponse {
    let tables = state.tables.clone();
    match blocking(move || tables.list_tables()).await {
        Ok(names) => (StatusCode::OK, Json(json!(names))),
        Err(error) => {
            tracing::error!(target = "fleet_control::api", error = %error, "failed to list tables");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn list_scripts(State(state): State<AppState>) -> ApiResponse {
    match state.library.list_scripts() {
        Ok(scripts) => (StatusCode::OK, Json(json!(scripts))),
        Err(error) => {
            tracing::error!(target = "fleet_control::api", error = %error, "failed to list scripts");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Error retrieving scripts")
        }
    }
}

async fn send_message(State(state): State<AppState>, Form(form): Form<DispatchForm>) -> ApiResponse {
    let (client_id, message) = (field(&form.client_id), field(&form.message));
    if client_id.is_empty() || message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Client-ID or message missing");
    }
    let result = state
        .dispatcher
        .send_text(Target::Agent(client_id.to_string()), message)
        .await;
    delivery_response(result, "Message sent")
}

async fn send_message_all(
    State(state): State<AppState>,
    Form(form): Form<DispatchForm>,
) -> ApiResponse {
    let message = field(&form.message);
    if message.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Message missing");
    }
    let result = state.dispatcher.send_text(Target::All, message).await;
    delivery_response(result, "Message sent to all agents")
}

async fn send_script(State(state): State<AppState>, Form(form): Form<DispatchForm>) -> ApiResponse {
    let client_id = field(&form.client_id);
    if client_id.is_empty() || field(&form.script_name).is_empty() || field(&form.script_type).is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Client-ID, script name, or script type missing",
        );
    }
    push_script(&state, Target::Agent(client_id.to_string()), &form).await
}

async fn send_script_all(
    State(state): State<AppState>,
    Form(form): Form<DispatchForm>,
) -> ApiResponse {
    if field(&form.script_name).is_empty() || field(&form.script_type).is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Script name or script type missing");
    }
    push_script(&state, Target::All, &form).await
}

async fn push_script(state: &AppState, target: Target, form: &DispatchForm) -> ApiResponse {
    let name = field(&form.script_name);
    let kind: ScriptKind = match field(&form.script_type).parse() {
        Ok(kind) => kind,
        Err(error) => return error_response(StatusCode::BAD_REQUEST, &error.to_string()),
    };
    let payload = match read_artifact(state, name).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let result = state.dispatcher.push_script(target, name, kind, &payload).await;
    delivery_response(result, "Script sent in chunks")
}

async fn send_binary(State(state): State<AppState>, Form(form): Form<DispatchForm>) -> ApiResponse {
    let (client_id, name) = (field(&form.client_id), field(&form.binary_name));
    if client_id.is_empty() || name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Client-ID or binary name missing");
    }
    let payload = match read_artifact(&state, name).await {
        Ok(payload) => payload,
        Err(response) => return response,
    };
    let result = state.dispatcher.push_binary(client_id, name, &payload).await;
    delivery_response(result, "Binary sent in chunks")
}

async fn refresh(State(state): State<AppState>) -> ApiResponse {
    let result = state.dispatcher.refresh_all().await;
    delivery_response(result, "Refresh sent to all agents")
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn read_artifact(state: &AppState, name: &str) -> Result<Vec<u8>, ApiResponse> {
    let library = state.library.clone();
    let owned = name.to_string();
    let result = tokio::task::spawn_blocking(move || library.read(&owned))
        .await
        .map_err(|error| error_response(StatusCode::INTERNAL_SERVER_ERROR, &error.to_string()))?;
    result.map_err(|error| match error {
        ArtifactError::NotFound(_) | ArtifactError::InvalidName(_) => {
            error_response(StatusCode::NOT_FOUND, "Script not found")
        }
        other => {
            tracing::error!(target = "fleet_control::api", artifact = %name, error = %other, "failed to read artifact");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Error reading script")
        }
    })
}

fn delivery_response(result: Result<Delivery, DispatchError>, message: &str) -> ApiResponse {
    match result {
        Ok(delivery) if delivery.report.failed.is_empty() => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "message": message,
                "artifact": delivery.artifact,
                "frames": delivery.frames,
                "delivered": delivery.report.delivered,
            })),
        ),
        Ok(delivery) => (
            StatusCode::MULTI_STATUS,
            Json(json!({
                "status": "partial_success",
                "message": format!("{} failures", delivery.report.failures()),
                "artifact": delivery.artifact,
                "delivered": delivery.report.delivered,
                "failed": delivery.report.failed,
            })),
        ),
        Err(error) => {
            let status = match &error {
                DispatchError::MissingField(_) | DispatchError::EmptyArtifact(_) => {
                    StatusCode::BAD_REQUEST
                }
                DispatchError::Registry(RegistryError::NotFound(_)) => StatusCode::NOT_FOUND,
                DispatchError::Registry(RegistryError::Disconnected {
                    source: SendError::Closed,
                    ..
                }) => StatusCode::GONE,
                DispatchError::Registry(RegistryError::Disconnected { .. })
                | DispatchError::Codec(_)
                | DispatchError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(target = "fleet_control::api", status = status.as_u16(), error = %error, "dispatch failed");
            error_response(status, &error.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> ApiResponse {
    (status, Json(json!({ "status": "error", "message": message })))
}

async fn blocking<T, F>(task: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(task).await {
        Ok(result) => result,
        Err(error) => Err(StoreError::Corrupt {
            column: "-".into(),
            detail: format!("store task failed: {error}"),
        }),
    }
}
