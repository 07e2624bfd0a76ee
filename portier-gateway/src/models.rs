use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Type d'événement réservé au log de connexion (best-effort à l'accept).
pub const CONNECT_EVENT_TYPE: i64 = 0;

/// Identifiant utilisé quand la trame ne porte pas de pId exploitable.
pub const UNKNOWN_DEVICE: &str = "unknown";

/// Événement accepté, écrit une seule fois dans le sink (insert-only).
/// raw_data garde la trame décodée complète en guise de backup d'audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: i64,
    pub device_id: String,
    pub client_ip: String,
    pub raw_data: Value,
    pub created_at: String, // RFC3339
}

impl Event {
    /// Construit un événement depuis une trame décodée, avec extraction
    /// typée des champs : pId -> device_id ("unknown" si absent/vide),
    /// type -> event_type (0 si absent ou non entier).
    pub fn from_frame(frame: &Value, client_ip: &str) -> Self {
        Self {
            event_type: frame_event_type(frame),
            device_id: frame_device_id(frame).unwrap_or_else(|| UNKNOWN_DEVICE.to_string()),
            client_ip: client_ip.to_string(),
            raw_data: frame.clone(),
            created_at: now_rfc3339(),
        }
    }
}

/// Extrait le pId de la trame ; None si absent ou chaîne vide.
pub fn frame_device_id(frame: &Value) -> Option<String> {
    frame
        .get("pId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Extrait le code type de la trame ; 0 (non classé) si absent ou non entier.
pub fn frame_event_type(frame: &Value) -> i64 {
    frame.get("type").and_then(Value::as_i64).unwrap_or(0)
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

/// Notification externe de commande (feed MQTT ou API REST).
/// command_data est une chaîne, éventuellement elle-même du JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandNotification {
    pub device_id: String,
    pub command_data: String,
}

/// Acquittement renvoyé à l'appareil après chaque trame extraite avec succès.
pub fn ack_line(ts_epoch_secs: i64) -> String {
    let mut line = serde_json::json!({ "status": "ok", "ts": ts_epoch_secs }).to_string();
    line.push('\n');
    line
}

/// Trame de commande poussée sur la connexion d'un appareil encore ouvert.
pub fn command_line(data: &Value) -> String {
    let mut line = serde_json::json!({ "type": "command", "data": data }).to_string();
    line.push('\n');
    line
}
