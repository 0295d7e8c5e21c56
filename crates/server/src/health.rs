use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tracing::{error, info};

use triago_core::resilience::{BreakerSnapshot, CircuitState, ResilienceRegistry};
use triago_core::steps::FileInstructionStore;

#[derive(Clone)]
pub struct HealthState {
    store: Arc<FileInstructionStore>,
    resilience: Arc<ResilienceRegistry>,
}

impl HealthState {
    pub fn new(store: Arc<FileInstructionStore>, resilience: Arc<ResilienceRegistry>) -> Self {
        Self { store, resilience }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: HealthCheck,
    pub instructions: HealthCheck,
    pub dependencies: HealthCheck,
    pub breakers: Vec<BreakerSnapshot>,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

pub async fn spawn(bind_address: &str, port: u16, state: HealthState) -> std::io::Result<()> {
    let address = format!("{bind_address}:{port}");
    let listener = tokio::net::TcpListener::bind(&address).await?;

    info!(
        event_name = "system.health.start",
        bind_address = %address,
        "health endpoint started"
    );

    tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, router(state)).await {
            error!(
                event_name = "system.health.error",
                error = %error,
                "health endpoint server terminated unexpectedly"
            );
        }
    });

    Ok(())
}

pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let instructions = instructions_check(&state.store);
    let breakers = state.resilience.snapshot();
    let dependencies = breaker_check(&breakers);
    let ready = instructions.status == "ready" && dependencies.status == "ready";

    let payload = HealthResponse {
        status: if ready { "ready" } else { "degraded" },
        service: HealthCheck {
            status: "ready",
            detail: "triago-server runtime initialized".to_string(),
        },
        instructions,
        dependencies,
        breakers,
        checked_at: Utc::now().to_rfc3339(),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

fn instructions_check(store: &FileInstructionStore) -> HealthCheck {
    let count = store.definitions().len();
    if count > 0 {
        HealthCheck { status: "ready", detail: format!("{count} step definitions loaded") }
    } else {
        HealthCheck { status: "degraded", detail: "instruction store is empty".to_string() }
    }
}

fn breaker_check(breakers: &[BreakerSnapshot]) -> HealthCheck {
    let open: Vec<&str> = breakers
        .iter()
        .filter(|snapshot| snapshot.state == CircuitState::Open)
        .map(|snapshot| snapshot.dependency.as_str())
        .collect();
    if open.is_empty() {
        HealthCheck { status: "ready", detail: "all circuit breakers closed".to_string() }
    } else {
        HealthCheck { status: "degraded", detail: format!("open breakers: {}", open.join(", ")) }
    }
}
