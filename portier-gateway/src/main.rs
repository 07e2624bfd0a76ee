/**
 * PORTIER GATEWAY - Point d'entrée de la passerelle interphones
 *
 * RÔLE : Orchestration de tous les modules : config, écoute TCP appareils,
 * feed de commandes MQTT, sink d'événements, API REST d'observation.
 *
 * ARCHITECTURE : une tâche tokio par connexion appareil + registre partagé,
 * dispatch de commandes piloté par notifications MQTT, persistance insert-only.
 * UTILITÉ : point unique de terminaison des connexions longue durée du parc.
 */

mod commands;
mod config;
mod frame;
mod health;
mod http;
mod models;
mod registry;
mod server;
mod sink;
mod state;
mod throttle;

use crate::health::HealthTracker;
use crate::registry::{DeviceRegistry, SharedRegistry};
use crate::server::GatewayState;
use crate::sink::{JsonlEventSink, SharedSink};
use crate::state::new_state;
use crate::throttle::HeartbeatMap;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let cfg = config::load_config().await;

    // sink JSONL par défaut sous ./data
    if let Some(parent) = std::path::Path::new(&cfg.events_file).parent() {
        std::fs::create_dir_all(parent).unwrap_or_else(|e| {
            eprintln!("[gateway] warning: failed to create data dir: {}", e);
        });
    }
    let sink: SharedSink = Arc::new(JsonlEventSink::new(&cfg.events_file));

    // état partagé : registre appareils + fenêtres heartbeat + compteurs
    let registry: SharedRegistry = Arc::new(DeviceRegistry::new());
    let heartbeats = new_state(HeartbeatMap::new());
    let health_tracker = HealthTracker::new();

    let state = Arc::new(GatewayState {
        cfg: cfg.clone(),
        registry: registry.clone(),
        heartbeats,
        sink,
        health: health_tracker.clone(),
    });

    // feed de commandes + publication health si MQTT configuré
    match cfg.mqtt.clone() {
        Some(mqtt_cfg) => {
            commands::spawn_command_listener(state.clone(), mqtt_cfg.clone());
            health_tracker.spawn_health_publisher(mqtt_cfg, registry.clone());
        }
        None => println!("[gateway] no MQTT configured, command feed disabled"),
    }

    // écoute TCP des appareils
    let tcp_addr = format!("{}:{}", cfg.tcp.host, cfg.tcp.port);
    let device_listener = match TcpListener::bind(&tcp_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("[gateway] failed to bind device listener {}: {}", tcp_addr, e);
            std::process::exit(1);
        }
    };
    println!("[gateway] device listener on tcp://{}", tcp_addr);
    tokio::spawn(server::run_device_listener(state.clone(), device_listener));

    // API REST d'observation
    let app = http::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
    println!("[gateway] admin API on http://{addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
