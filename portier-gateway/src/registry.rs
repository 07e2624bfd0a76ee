/**
 * DEVICE REGISTRY - Registre des connexions appareils vivantes
 *
 * RÔLE :
 * Map device_id -> connexion ouverte, utilisée pour cibler le push de
 * commandes. Le registre ne possède PAS la connexion (référence faible) :
 * la durée de vie appartient à la tâche de connexion.
 *
 * INVARIANTS :
 * - Au plus une entrée par device_id ; une reconnexion écrase silencieusement
 * - unregister_if_current : compare-and-remove atomique, un close handler en
 *   retard ne peut pas évincer l'enregistrement d'une connexion plus récente
 */

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Poignée d'une connexion appareil ouverte. Les écritures sortantes (acks,
/// commandes) passent par un canal vers la tâche writer de la connexion.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub peer_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<String>,
}

impl ConnectionHandle {
    pub fn new(peer_addr: SocketAddr, outbound: mpsc::UnboundedSender<String>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            peer_addr,
            outbound,
        })
    }

    /// Pousse une ligne vers l'appareil. false si la connexion est déjà morte
    /// (writer terminé) ; l'appelant loggue et laisse tomber.
    pub fn send_line(&self, line: String) -> bool {
        self.outbound.send(line).is_ok()
    }

    pub fn client_ip(&self) -> String {
        self.peer_addr.ip().to_string()
    }
}

/// device_id -> référence faible vers la connexion courante.
type DeviceMap = HashMap<String, Weak<ConnectionHandle>>;

pub struct DeviceRegistry {
    devices: Mutex<DeviceMap>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    /// Écrasement inconditionnel : dernière connexion enregistrée gagne.
    pub fn register(&self, device_id: &str, conn: &Arc<ConnectionHandle>) {
        self.devices
            .lock()
            .insert(device_id.to_string(), Arc::downgrade(conn));
    }

    /// Retire le mapping seulement s'il pointe encore vers cette connexion.
    /// Retourne true si une entrée a été retirée.
    pub fn unregister_if_current(&self, device_id: &str, conn_id: Uuid) -> bool {
        let mut devices = self.devices.lock();
        let current = devices
            .get(device_id)
            .and_then(Weak::upgrade)
            .map(|c| c.id == conn_id)
            .unwrap_or(false);
        if current {
            devices.remove(device_id);
        }
        current
    }

    /// Connexion vivante pour cet appareil, ou None. Une entrée morte
    /// (connexion déjà tombée) vaut absence et est purgée au passage.
    pub fn lookup(&self, device_id: &str) -> Option<Arc<ConnectionHandle>> {
        let mut devices = self.devices.lock();
        match devices.get(device_id).map(Weak::upgrade) {
            Some(Some(conn)) => Some(conn),
            Some(None) => {
                devices.remove(device_id);
                None
            }
            None => None,
        }
    }

    /// Snapshot (device_id, connexion vivante ?) pour l'API d'observation.
    pub fn snapshot(&self) -> Vec<(String, Option<Arc<ConnectionHandle>>)> {
        self.devices
            .lock()
            .iter()
            .map(|(id, weak)| (id.clone(), weak.upgrade()))
            .collect()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedRegistry = Arc<DeviceRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    fn test_handle() -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = ConnectionHandle::new("127.0.0.1:4000".parse().unwrap(), tx);
        (conn, rx)
    }

    #[test]
    fn test_default_registry_is_empty() {
        let registry = DeviceRegistry::default();
        assert_eq!(registry.device_count(), 0);
        assert!(registry.lookup("A1").is_none());
    }

    #[test]
    fn test_register_then_lookup() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = test_handle();
        registry.register("A1", &conn);
        let found = registry.lookup("A1").expect("A1 should be registered");
        assert_eq!(found.id, conn.id);
        assert!(registry.lookup("B2").is_none());
    }

    #[test]
    fn test_reconnect_overwrites_mapping() {
        let registry = DeviceRegistry::new();
        let (old_conn, _rx1) = test_handle();
        let (new_conn, _rx2) = test_handle();
        registry.register("A1", &old_conn);
        registry.register("A1", &new_conn);
        assert_eq!(registry.lookup("A1").unwrap().id, new_conn.id);
        assert_eq!(registry.device_count(), 1);
    }

    #[test]
    fn test_stale_close_does_not_evict_newer_registration() {
        let registry = DeviceRegistry::new();
        let (old_conn, _rx1) = test_handle();
        let (new_conn, _rx2) = test_handle();
        registry.register("A1", &old_conn);
        // l'appareil se reconnecte avant que le close de l'ancienne tourne
        registry.register("A1", &new_conn);
        assert!(!registry.unregister_if_current("A1", old_conn.id));
        assert_eq!(registry.lookup("A1").unwrap().id, new_conn.id);
    }

    #[test]
    fn test_unregister_current_connection() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = test_handle();
        registry.register("A1", &conn);
        assert!(registry.unregister_if_current("A1", conn.id));
        assert!(registry.lookup("A1").is_none());
        // second passage : plus rien à retirer
        assert!(!registry.unregister_if_current("A1", conn.id));
    }

    #[test]
    fn test_dropped_connection_behaves_as_absent() {
        let registry = DeviceRegistry::new();
        let (conn, _rx) = test_handle();
        registry.register("A1", &conn);
        drop(conn);
        assert!(registry.lookup("A1").is_none());
        // l'entrée morte a été purgée par le lookup
        assert_eq!(registry.device_count(), 0);
    }

    #[test]
    fn test_send_line_reports_dead_writer() {
        let (conn, rx) = test_handle();
        assert!(conn.send_line("ping\n".to_string()));
        drop(rx);
        assert!(!conn.send_line("ping\n".to_string()));
    }
}
