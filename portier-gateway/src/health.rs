/**
 * HEALTH TRACKER - Compteurs internes + publication périodique MQTT
 *
 * RÔLE :
 * Suivi temps réel de la passerelle : connexions ouvertes, événements
 * persistés, heartbeats throttlés, commandes dispatchées/perdues, état MQTT.
 * Publication best-effort toutes les 30s sur portier/gateway/health@v1.
 */

use crate::config::MqttConf;
use crate::registry::SharedRegistry;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task;

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayHealth {
    pub uptime_seconds: u64,
    pub connections_open: u32,
    pub devices_registered: u32,
    pub events_persisted: u64,
    pub heartbeats_throttled: u64,
    pub frames_rejected: u64,
    pub commands_dispatched: u64,
    pub commands_missed: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    connections_open: Arc<AtomicU32>,
    events_persisted: Arc<AtomicU64>,
    heartbeats_throttled: Arc<AtomicU64>,
    frames_rejected: Arc<AtomicU64>,
    commands_dispatched: Arc<AtomicU64>,
    commands_missed: Arc<AtomicU64>,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            connections_open: Arc::new(AtomicU32::new(0)),
            events_persisted: Arc::new(AtomicU64::new(0)),
            heartbeats_throttled: Arc::new(AtomicU64::new(0)),
            frames_rejected: Arc::new(AtomicU64::new(0)),
            commands_dispatched: Arc::new(AtomicU64::new(0)),
            commands_missed: Arc::new(AtomicU64::new(0)),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("disabled".to_string())),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn event_persisted(&self) {
        self.events_persisted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_throttled(&self) {
        self.heartbeats_throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_rejected(&self) {
        self.frames_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_dispatched(&self) {
        self.commands_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_missed(&self) {
        self.commands_missed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, registry: &SharedRegistry) -> GatewayHealth {
        GatewayHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connections_open: self.connections_open.load(Ordering::Relaxed),
            devices_registered: registry.device_count() as u32,
            events_persisted: self.events_persisted.load(Ordering::Relaxed),
            heartbeats_throttled: self.heartbeats_throttled.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            commands_dispatched: self.commands_dispatched.load(Ordering::Relaxed),
            commands_missed: self.commands_missed.load(Ordering::Relaxed),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }

    /// Démarre la publication auto du health passerelle (30s, best-effort).
    pub fn spawn_health_publisher(&self, mqtt_cfg: MqttConf, registry: SharedRegistry) {
        let health_tracker = self.clone();

        task::spawn(async move {
            let mut opts = MqttOptions::new("portier-gateway-health", &mqtt_cfg.host, mqtt_cfg.port);
            opts.set_keep_alive(Duration::from_secs(15));
            let (client, mut eventloop) = AsyncClient::new(opts, 10);

            let mut interval = tokio::time::interval(Duration::from_secs(30));

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = health_tracker.get_health(&registry);
                        if let Ok(payload) = serde_json::to_string(&health) {
                            if let Err(e) = client.publish("portier/gateway/health@v1", QoS::AtLeastOnce, false, payload).await {
                                eprintln!("[health] failed to publish: {:?}", e);
                            } else {
                                println!("[health] published gateway health (uptime: {}s, connections: {})",
                                        health.uptime_seconds, health.connections_open);
                            }
                        }
                    },
                    event = eventloop.poll() => {
                        if let Err(e) = event {
                            eprintln!("[health] MQTT error: {:?}", e);
                            health_tracker.increment_reconnects();
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DeviceRegistry;

    #[test]
    fn test_counters_roundtrip() {
        let tracker = HealthTracker::new();
        let registry: SharedRegistry = Arc::new(DeviceRegistry::new());

        tracker.connection_opened();
        tracker.connection_opened();
        tracker.connection_closed();
        tracker.event_persisted();
        tracker.heartbeat_throttled();
        tracker.command_missed();

        let health = tracker.get_health(&registry);
        assert_eq!(health.connections_open, 1);
        assert_eq!(health.events_persisted, 1);
        assert_eq!(health.heartbeats_throttled, 1);
        assert_eq!(health.commands_missed, 1);
        assert_eq!(health.commands_dispatched, 0);
        assert_eq!(health.mqtt_status, "disabled");
    }

    #[test]
    fn test_mqtt_status_and_reconnect_counter() {
        let tracker = HealthTracker::new();
        let registry: SharedRegistry = Arc::new(DeviceRegistry::new());

        tracker.mark_mqtt_connected();
        assert_eq!(tracker.get_health(&registry).mqtt_status, "connected");

        // chaque erreur de poll (commandes ou health) incrémente le compteur
        tracker.increment_reconnects();
        tracker.increment_reconnects();
        let health = tracker.get_health(&registry);
        assert_eq!(health.mqtt_reconnects, 2);
        assert_eq!(health.mqtt_status, "reconnecting");
    }
}
