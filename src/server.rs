use crate::config::Settings;
use crate::error::ApiError;
use crate::host::{ShutdownOutcome, WorkerHost};
use crate::models::{Item, ItemCreate, User, UserCreate};
use crate::records;
use crate::telemetry;
use crate::trigger::{CUSTOM_INPUT_VAR, CliRuntime, WorkloadTrigger};
use anyhow::{Context, anyhow};
use axum::{
    Json, Router,
    extract::{Form, FromRef, FromRequest, Path, Query, Request, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

/// Shared handles injected into every request.
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub trigger: WorkloadTrigger,
}

impl FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl FromRef<AppState> for WorkloadTrigger {
    fn from_ref(state: &AppState) -> Self {
        state.trigger.clone()
    }
}

/// Run the HTTP server and, unless disabled, the relay worker beside it.
pub async fn run_server(settings: Settings) -> anyhow::Result<()> {
    telemetry::init(settings.log_format);

    // Initialize database pool (ensures DB exists and schema is ready)
    let pool = records::init_pool(&settings.records).await?;

    // One runtime handle for the whole process
    let runtime = CliRuntime::new(settings.container_runtime.clone());
    match runtime.probe().await {
        Ok(()) => tracing::info!(runtime = %settings.container_runtime, "Container runtime available"),
        Err(e) => tracing::error!(error = %e, "Container runtime unavailable; triggers will fail"),
    }
    let trigger = WorkloadTrigger::new(Arc::new(runtime));
    let app = app_router(AppState { pool, trigger });

    // Bind before starting the relay: the ingestion endpoint usually lives here
    let addr = SocketAddr::from((settings.bind, settings.port));
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind address: {e}");
        anyhow!("Bind error: {e}")
    })?;
    tracing::info!("Listening on {} - Use Ctrl+C to quit.", addr);

    let worker = if settings.relay.enabled {
        let relay = settings.relay.build_relay()?;
        let host = WorkerHost::start(relay)
            .await
            .context("Relay could not start")?;
        Some(host)
    } else {
        tracing::info!("Relay disabled");
        None
    };
    let grace = settings.relay.shutdown_grace;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            // Drain the relay while the ingestion endpoint still answers
            if let Some(worker) = worker {
                stop_worker(worker, grace).await;
            }
        })
        .await
        .map_err(|e| {
            tracing::error!("Server error: {e}");
            anyhow!("Server error: {e}")
        })?;
    tracing::info!("Server stopped");
    Ok(())
}

async fn stop_worker(worker: WorkerHost, grace: Duration) {
    if worker.shutdown(grace).await == ShutdownOutcome::TimedOut {
        tracing::error!("Forcing process exit with the relay still busy");
        std::process::exit(1);
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Received shutdown signal, shutting down gracefully...");
}

/// Construct the Axum `Router` for the service, injecting shared state.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(read_root))
        .route("/health", get(|| async { "ok" }))
        // Ingestion endpoint called by the relay
        .route("/process_data", post(process_data))
        // Workload trigger
        .route("/trigger", post(trigger_workload))
        // Records
        .route("/users", get(read_users).post(create_user))
        .route("/users/", get(read_users).post(create_user))
        .route("/users/{user_id}", get(read_user))
        .route("/users/{user_id}/items", post(create_item_for_user))
        .route("/users/{user_id}/items/", post(create_item_for_user))
        .route("/items", get(read_items))
        .route("/items/", get(read_items))
        .with_state(state)
}

// Query parameters for paginated listings
#[derive(Deserialize)]
struct PageParams {
    skip: Option<i64>,
    limit: Option<i64>,
}

impl PageParams {
    fn bounds(&self) -> (i64, i64) {
        (self.skip.unwrap_or(0), self.limit.unwrap_or(100))
    }
}

// Parameters of a trigger call, from the query string or the body
#[derive(Deserialize)]
struct TriggerParams {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    container_name: String,
    #[serde(default)]
    custom_input: String,
}

async fn read_root() -> Json<Value> {
    Json(json!({ "Hello": "World" }))
}

// Accept a processed message from the relay
async fn process_data(Json(data): Json<Map<String, Value>>) -> Json<Value> {
    let data = serde_json::Value::Object(data);
    tracing::info!(data = %data, "Processing data");
    Json(json!({ "message": "Data processing initiated" }))
}

// Launch one container with the custom input in its environment
async fn trigger_workload(
    State(trigger): State<WorkloadTrigger>,
    Query(query): Query<TriggerParams>,
    request: Request,
) -> Result<(StatusCode, Json<Value>), Response> {
    let params = trigger_params(query, request).await?;
    let env = BTreeMap::from([(CUSTOM_INPUT_VAR.to_string(), params.custom_input)]);
    let receipt = trigger
        .trigger(&params.container_name, env)
        .await
        .map_err(|e| ApiError::from(e).into_response())?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": "Workload launched",
            "action": params.action,
            "container_name": receipt.image,
            "container_id": receipt.container_id,
        })),
    ))
}

// A JSON or form body takes precedence; without one the query string is used
async fn trigger_params(query: TriggerParams, request: Request) -> Result<TriggerParams, Response> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if content_type.starts_with("application/json") {
        let Json(params) = Json::<TriggerParams>::from_request(request, &())
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(params)
    } else if content_type.starts_with("application/x-www-form-urlencoded") {
        let Form(params) = Form::<TriggerParams>::from_request(request, &())
            .await
            .map_err(IntoResponse::into_response)?;
        Ok(params)
    } else {
        Ok(query)
    }
}

async fn create_user(
    State(pool): State<SqlitePool>,
    Json(body): Json<UserCreate>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(records::create_user(&pool, &body).await?))
}

async fn read_users(
    State(pool): State<SqlitePool>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<User>>, ApiError> {
    let (skip, limit) = params.bounds();
    Ok(Json(records::get_users(&pool, skip, limit).await?))
}

async fn read_user(
    Path(user_id): Path<i64>,
    State(pool): State<SqlitePool>,
) -> Result<Json<User>, ApiError> {
    Ok(Json(records::get_user(&pool, user_id).await?))
}

async fn create_item_for_user(
    Path(user_id): Path<i64>,
    State(pool): State<SqlitePool>,
    Json(body): Json<ItemCreate>,
) -> Result<Json<Item>, ApiError> {
    Ok(Json(records::create_user_item(&pool, user_id, &body).await?))
}

async fn read_items(
    State(pool): State<SqlitePool>,
    Query(params): Query<PageParams>,
) -> Result<Json<Vec<Item>>, ApiError> {
    let (skip, limit) = params.bounds();
    Ok(Json(records::get_items(&pool, skip, limit).await?))
}
