/**
 * HEARTBEAT THROTTLE - Limite la persistance des keep-alive
 *
 * RÔLE :
 * Les interphones émettent un heartbeat (type 6) toutes les quelques secondes.
 * On ne persiste qu'une occurrence par fenêtre par appareil, mais on acquitte
 * TOUJOURS côté appareil (l'ack ne prouve pas la durabilité).
 *
 * FONCTIONNEMENT :
 * - Map device_id -> epoch ms du dernier événement persisté (tout type)
 * - Un événement non-heartbeat persisté repousse aussi la fenêtre
 * - Décision + tampon sous un seul lock (decide_and_mark atomique)
 */

use crate::state::Shared;
use std::collections::HashMap;

/// Code d'événement keep-alive des interphones.
pub const HEARTBEAT_TYPE: i64 = 6;

/// Fenêtre minimale entre deux persistances de heartbeat d'un même appareil.
pub const HEARTBEAT_MIN_INTERVAL_MS: i64 = 60_000;

/// device_id -> epoch ms du dernier événement persisté (pas que les heartbeats).
pub type HeartbeatMap = HashMap<String, i64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleDecision {
    Persist,
    Skip,
}

/// Décide si l'événement doit être persisté et, le cas échéant, tamponne
/// now_ms comme nouvelle base de fenêtre. Un seul passage sous lock : pas
/// d'entrelacement possible entre la lecture et le tampon.
pub fn decide_and_mark(
    state: &Shared<HeartbeatMap>,
    device_id: &str,
    event_type: i64,
    now_ms: i64,
    min_interval_ms: i64,
) -> ThrottleDecision {
    let mut map = state.lock();

    if event_type == HEARTBEAT_TYPE {
        if let Some(last) = map.get(device_id) {
            if now_ms - last < min_interval_ms {
                return ThrottleDecision::Skip;
            }
        }
    }

    map.insert(device_id.to_string(), now_ms);
    ThrottleDecision::Persist
}

/// Epoch ms courant, base des fenêtres de throttle.
pub fn now_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
