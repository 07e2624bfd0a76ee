/**
 * EVENT SINK - Interface de persistance insert-only des événements
 *
 * RÔLE :
 * Le store durable est un collaborateur externe ; la passerelle ne connaît
 * que insert(). L'implémentation par défaut est un fichier JSONL append-only
 * sous ./data (un événement par ligne, jamais de mutation).
 *
 * FONCTIONNEMENT :
 * - trait EventSink (async) : les échecs remontent à l'appelant immédiat qui
 *   loggue et continue, aucune erreur de sink n'est fatale au process
 * - JsonlEventSink : OpenOptions append via tokio::fs, sérialisé par un
 *   Mutex tokio pour garder une ligne par insert
 */

use crate::models::Event;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    /// Insère un enregistrement, une fois, sans mise à jour possible.
    async fn insert(&self, event: &Event) -> Result<(), SinkError>;
}

pub type SharedSink = Arc<dyn EventSink>;

/// Sink fichier JSONL : un événement sérialisé par ligne, append-only.
pub struct JsonlEventSink {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlEventSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }
}

#[async_trait]
impl EventSink for JsonlEventSink {
    async fn insert(&self, event: &Event) -> Result<(), SinkError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Sink mémoire pour les tests : enregistre les inserts pour assertions.
#[cfg(test)]
pub struct MemoryEventSink {
    events: parking_lot::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl MemoryEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: parking_lot::Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MemoryEventSink {
    async fn insert(&self, event: &Event) -> Result<(), SinkError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Sink qui échoue toujours : vérifie que l'ack part malgré l'insert raté.
#[cfg(test)]
pub struct FailingEventSink;

#[cfg(test)]
#[async_trait]
impl EventSink for FailingEventSink {
    async fn insert(&self, _event: &Event) -> Result<(), SinkError> {
        Err(SinkError::Io(std::io::Error::other("store unavailable")))
    }
}
