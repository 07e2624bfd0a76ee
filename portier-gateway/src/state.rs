use parking_lot::Mutex;
use std::sync::Arc;

/// État partagé entre tâches tokio (registre appareils, fenêtres heartbeat).
/// Mutex parking_lot : sections critiques courtes, jamais de .await sous lock.
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
