use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayConfig {
    pub tcp: TcpConf,
    pub http: HttpConf,
    pub mqtt: Option<MqttConf>,
    /// Fichier JSONL du sink d'événements par défaut.
    pub events_file: String,
    /// Événement de log best-effort à chaque accept (variante configurable).
    pub log_connections: bool,
    /// Fenêtre minimale entre deux heartbeats persistés ; None = 60 000 ms.
    pub heartbeat_min_interval_ms: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpConf {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            tcp: TcpConf { host: "0.0.0.0".into(), port: 8080 },
            http: HttpConf { port: 8081 },
            mqtt: Some(MqttConf { host: "localhost".into(), port: 1883 }),
            events_file: "./data/events.jsonl".into(),
            log_connections: true,
            heartbeat_min_interval_ms: None,
        }
    }
}

impl GatewayConfig {
    pub fn heartbeat_interval_ms(&self) -> i64 {
        self.heartbeat_min_interval_ms
            .unwrap_or(crate::throttle::HEARTBEAT_MIN_INTERVAL_MS)
    }
}

pub async fn load_config() -> GatewayConfig {
    let path = std::env::var("PORTIER_GATEWAY_CONFIG").unwrap_or_else(|_| "gateway.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            GatewayConfig::default()
        } else {
            serde_yaml::from_str(&txt).unwrap_or_else(|e| {
                eprintln!("[gateway] config invalide: {e}");
                GatewayConfig::default()
            })
        }
    } else {
        eprintln!("[gateway] pas de gateway.yaml, usage config par défaut");
        GatewayConfig::default()
    };

    // PORT prime sur le fichier (déploiements conteneurisés)
    if let Ok(port) = std::env::var("PORT") {
        if let Ok(port) = port.parse::<u16>() {
            cfg.tcp.port = port;
        }
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.tcp.port, 8080);
        assert_eq!(cfg.heartbeat_interval_ms(), 60_000);
        assert!(cfg.log_connections);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg: GatewayConfig = serde_yaml::from_str("tcp:\n  host: 127.0.0.1\n  port: 9000\nlog_connections: false\n").unwrap();
        assert_eq!(cfg.tcp.port, 9000);
        assert!(!cfg.log_connections);
        assert_eq!(cfg.events_file, "./data/events.jsonl");
        assert_eq!(cfg.mqtt.as_ref().map(|m| m.port), Some(1883));
    }

    #[test]
    fn test_interval_override() {
        let cfg: GatewayConfig = serde_yaml::from_str("heartbeat_min_interval_ms: 5000\n").unwrap();
        assert_eq!(cfg.heartbeat_interval_ms(), 5_000);
    }
}
