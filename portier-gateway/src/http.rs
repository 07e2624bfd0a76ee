/**
 * API REST PORTIER - Observation et administration de la passerelle
 *
 * RÔLE :
 * Interface humaine/outillage au-dessus du cœur TCP : état de santé,
 * appareils connus, push manuel de commande (même chemin de dispatch que le
 * feed MQTT).
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes les routes sauf /health
 * - Validation côté middleware avant traitement métier
 */

use crate::commands::dispatch_command;
use crate::health::GatewayHealth;
use crate::models::CommandNotification;
use crate::server::SharedGateway;
use crate::throttle;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

#[derive(serde::Serialize)]
struct DeviceView {
    device_id: String,
    connected: bool,
    client_ip: Option<String>,
    /// epoch ms du dernier événement persisté (tout type)
    last_persist_ms: Option<i64>,
    /// true si rien persisté depuis plus de 90s
    stale: bool,
    stale_for_seconds: Option<i64>,
}

fn to_view(device_id: &str, client_ip: Option<String>, last_persist_ms: Option<i64>, now_ms: i64) -> DeviceView {
    let age_secs = last_persist_ms.map(|ms| ((now_ms - ms) / 1000).max(0));
    DeviceView {
        device_id: device_id.to_string(),
        connected: client_ip.is_some(),
        client_ip,
        last_persist_ms,
        stale: age_secs.map(|s| s > 90).unwrap_or(true),
        stale_for_seconds: age_secs,
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path == "/health" {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("PORTIER_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        eprintln!("SECURITY: PORTIER_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(state: SharedGateway) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .route("/devices/{id}/command", post(push_command))
        .with_state(state)
        .layer(middleware::from_fn(require_api_key))
}

async fn get_system_health(State(state): State<SharedGateway>) -> Json<GatewayHealth> {
    Json(state.health.get_health(&state.registry))
}

async fn get_devices(State(state): State<SharedGateway>) -> Json<Vec<DeviceView>> {
    let now = throttle::now_ms();
    let heartbeats = state.heartbeats.lock().clone();
    let views = state
        .registry
        .snapshot()
        .into_iter()
        .map(|(device_id, conn)| {
            let last = heartbeats.get(&device_id).copied();
            to_view(&device_id, conn.map(|c| c.client_ip()), last, now)
        })
        .collect();
    Json(views)
}

async fn get_device(
    State(state): State<SharedGateway>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    let now = throttle::now_ms();
    let last = state.heartbeats.lock().get(&id).copied();
    let conn = state.registry.lookup(&id);
    if conn.is_none() && last.is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(to_view(&id, conn.map(|c| c.client_ip()), last, now)))
}

#[derive(Debug, Deserialize)]
struct PushCommandBody {
    command_data: String,
}

/// POST /devices/{id}/command - même sémantique fire-and-forget que le feed
/// MQTT, mais le 404 rend la perte visible pour l'appelant HTTP.
async fn push_command(
    State(state): State<SharedGateway>,
    Path(id): Path<String>,
    Json(body): Json<PushCommandBody>,
) -> (StatusCode, &'static str) {
    let delivered = dispatch_command(
        &state,
        CommandNotification {
            device_id: id,
            command_data: body.command_data,
        },
    );
    if delivered {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::NOT_FOUND, "device offline")
    }
}
