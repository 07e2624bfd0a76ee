/**
 * GATEWAY SERVER - Écoute TCP et cycle de vie des connexions appareils
 *
 * RÔLE :
 * Termine les connexions longue durée des interphones : accept, lecture de
 * chunks bruts, extraction de trame, throttle heartbeat, persistance async,
 * acquittement. Une tâche par connexion + une tâche writer pour les écritures
 * sortantes (acks et commandes poussées).
 *
 * MACHINE À ÉTATS PAR CONNEXION :
 * Accepted -> Identified (première trame avec pId exploitable, enregistrement
 * dans le registre) -> Closed (EOF / erreur socket, unregister_if_current).
 *
 * CONTRAT : l'ack part pour CHAQUE trame extraite avec succès, que la
 * persistance soit sautée (throttle) ou ratée. L'ack ne prouve pas la
 * durabilité : l'insert tourne dans sa propre tâche.
 */

use crate::config::GatewayConfig;
use crate::frame::{extract_frame, FrameError};
use crate::health::HealthTracker;
use crate::models::{ack_line, frame_device_id, now_rfc3339, Event, CONNECT_EVENT_TYPE, UNKNOWN_DEVICE};
use crate::registry::{ConnectionHandle, SharedRegistry};
use crate::sink::SharedSink;
use crate::state::Shared;
use crate::throttle::{self, HeartbeatMap, ThrottleDecision};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// État partagé entre les tâches de connexion, le dispatcher de commandes
/// et l'API d'observation.
pub struct GatewayState {
    pub cfg: GatewayConfig,
    pub registry: SharedRegistry,
    pub heartbeats: Shared<HeartbeatMap>,
    pub sink: SharedSink,
    pub health: HealthTracker,
}

pub type SharedGateway = Arc<GatewayState>;

/// Boucle d'accept : une tâche par connexion entrante.
pub async fn run_device_listener(state: SharedGateway, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                println!("[gateway] new connection: {}", addr);
                let state = state.clone();
                tokio::spawn(async move {
                    handle_connection(state, stream, addr).await;
                });
            }
            Err(e) => {
                eprintln!("[gateway] accept failed: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
        }
    }
}

async fn handle_connection(state: SharedGateway, stream: TcpStream, addr: SocketAddr) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let conn = ConnectionHandle::new(addr, tx);
    state.health.connection_opened();

    // Writer dédié : sérialise acks et commandes poussées sur la socket.
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    // Log de connexion best-effort : l'échec ne bloque jamais la suite.
    if state.cfg.log_connections {
        let event = Event {
            event_type: CONNECT_EVENT_TYPE,
            device_id: UNKNOWN_DEVICE.to_string(),
            client_ip: conn.client_ip(),
            raw_data: serde_json::json!({ "event": "connected" }),
            created_at: now_rfc3339(),
        };
        submit_event(&state, event);
    }

    let mut identified: Option<String> = None;
    let mut buf = [0u8; 4096];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break, // fin de flux côté appareil
            Ok(n) => process_chunk(&state, &conn, &mut identified, &buf[..n]),
            Err(e) => {
                eprintln!("[gateway] socket error on {}: {}", addr, e);
                break;
            }
        }
    }

    // Closed : on ne retire le mapping que s'il pointe encore vers nous
    // (une reconnexion du même appareil a pu nous écraser entre-temps).
    if let Some(device_id) = identified.as_deref() {
        if state.registry.unregister_if_current(device_id, conn.id) {
            println!("[gateway] unregistered {} ({})", device_id, addr);
        }
    }
    state.health.connection_closed();
    drop(conn); // ferme le canal sortant, le writer se termine après drain
    let _ = writer.await;
}

/// Traite un chunk reçu : extraction, enregistrement, throttle, persistance
/// asynchrone, acquittement. Aucun .await : le lock heartbeat ne traverse
/// jamais de point de suspension.
pub(crate) fn process_chunk(
    state: &SharedGateway,
    conn: &Arc<ConnectionHandle>,
    identified: &mut Option<String>,
    chunk: &[u8],
) {
    let frame = match extract_frame(chunk) {
        Ok(frame) => frame,
        Err(FrameError::NoFrame) => {
            println!(
                "[gateway] non-frame data from {} ({} bytes), dropped",
                conn.peer_addr,
                chunk.len()
            );
            state.health.frame_rejected();
            return;
        }
        Err(FrameError::Decode(e)) => {
            eprintln!("[gateway] frame decode failed from {}: {}", conn.peer_addr, e);
            state.health.frame_rejected();
            return;
        }
    };

    // Première trame avec pId exploitable : la connexion devient adressable
    // pour le push de commandes. Ré-enregistrement inconditionnel ensuite.
    if let Some(device_id) = frame_device_id(&frame) {
        state.registry.register(&device_id, conn);
        *identified = Some(device_id);
    }

    let event = Event::from_frame(&frame, &conn.client_ip());
    let now = throttle::now_ms();

    match throttle::decide_and_mark(
        &state.heartbeats,
        &event.device_id,
        event.event_type,
        now,
        state.cfg.heartbeat_interval_ms(),
    ) {
        ThrottleDecision::Skip => {
            println!("[gateway] throttled heartbeat: {}", event.device_id);
            state.health.heartbeat_throttled();
        }
        ThrottleDecision::Persist => submit_event(state, event),
    }

    // Acquittement inconditionnel, avant même que l'insert ait abouti.
    if !conn.send_line(ack_line(now / 1000)) {
        eprintln!("[gateway] ack dropped, connection {} already gone", conn.peer_addr);
    }
}

/// Soumet l'événement au sink dans sa propre tâche. Un échec est loggué et
/// perdu : pas de retry, pas de file locale, l'ack est déjà parti.
fn submit_event(state: &SharedGateway, event: Event) {
    let sink = state.sink.clone();
    let health = state.health.clone();
    tokio::spawn(async move {
        match sink.insert(&event).await {
            Ok(()) => {
                health.event_persisted();
                println!(
                    "[gateway] event saved. type: {}, device: {}",
                    event.event_type, event.device_id
                );
            }
            Err(e) => eprintln!("[gateway] persist failed for {}: {}", event.device_id, e),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CommandNotification;
    use crate::registry::DeviceRegistry;
    use crate::sink::{EventSink, FailingEventSink, MemoryEventSink};
    use crate::state::new_state;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_state_with(sink: Arc<dyn EventSink>, log_connections: bool) -> SharedGateway {
        let mut cfg = GatewayConfig::default();
        cfg.log_connections = log_connections;
        Arc::new(GatewayState {
            cfg,
            registry: Arc::new(DeviceRegistry::new()),
            heartbeats: new_state(HeartbeatMap::new()),
            sink,
            health: HealthTracker::new(),
        })
    }

    fn test_state(sink: Arc<dyn EventSink>) -> SharedGateway {
        test_state_with(sink, false)
    }

    fn test_conn() -> (Arc<ConnectionHandle>, UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new("10.1.1.1:5000".parse().unwrap(), tx), rx)
    }

    async fn settle() {
        // laisse les tâches d'insert spawned se terminer
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_chunk_with_frame_persists_registers_and_acks() {
        let sink = MemoryEventSink::new();
        let state = test_state(sink.clone());
        let (conn, mut rx) = test_conn();
        let mut identified = None;

        process_chunk(&state, &conn, &mut identified, b"noise{\"pId\":\"A1\",\"type\":1,\"x\":5}\r\n");
        settle().await;

        // ack sur la connexion
        let ack = rx.try_recv().expect("ack should be sent");
        let ack: Value = serde_json::from_str(ack.trim()).unwrap();
        assert_eq!(ack["status"], "ok");
        assert!(ack["ts"].as_i64().unwrap() > 0);

        // événement persisté avec backup complet
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].device_id, "A1");
        assert_eq!(events[0].event_type, 1);
        assert_eq!(events[0].raw_data["x"], 5);
        assert_eq!(events[0].client_ip, "10.1.1.1");

        // registre : A1 -> cette connexion
        assert_eq!(identified.as_deref(), Some("A1"));
        assert_eq!(state.registry.lookup("A1").unwrap().id, conn.id);
    }

    #[tokio::test]
    async fn test_no_frame_yields_no_ack() {
        let sink = MemoryEventSink::new();
        let state = test_state(sink.clone());
        let (conn, mut rx) = test_conn();
        let mut identified = None;

        process_chunk(&state, &conn, &mut identified, b"garbage without braces");
        process_chunk(&state, &conn, &mut identified, b"{broken json}");
        settle().await;

        assert!(rx.try_recv().is_err(), "no ack expected for dropped frames");
        assert_eq!(sink.count(), 0);
        assert!(identified.is_none());
    }

    #[tokio::test]
    async fn test_heartbeat_retransmit_persists_once_acks_twice() {
        let sink = MemoryEventSink::new();
        let state = test_state(sink.clone());
        let (conn, mut rx) = test_conn();
        let mut identified = None;

        let hb = b"{\"pId\":\"A1\",\"type\":6}";
        process_chunk(&state, &conn, &mut identified, hb);
        process_chunk(&state, &conn, &mut identified, hb);
        settle().await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(sink.count(), 1, "second heartbeat throttled");
    }

    #[tokio::test]
    async fn test_ack_sent_even_when_persist_fails() {
        let state = test_state(Arc::new(FailingEventSink));
        let (conn, mut rx) = test_conn();
        let mut identified = None;

        process_chunk(&state, &conn, &mut identified, b"{\"pId\":\"A1\",\"type\":2}");
        settle().await;

        assert!(rx.try_recv().is_ok(), "ack must not depend on persistence");
        let health = state.health.get_health(&state.registry);
        assert_eq!(health.events_persisted, 0);
    }

    #[tokio::test]
    async fn test_frame_without_pid_does_not_identify() {
        let sink = MemoryEventSink::new();
        let state = test_state(sink.clone());
        let (conn, mut rx) = test_conn();
        let mut identified = None;

        process_chunk(&state, &conn, &mut identified, b"{\"type\":3}");
        settle().await;

        assert!(rx.try_recv().is_ok());
        assert!(identified.is_none());
        assert_eq!(sink.events()[0].device_id, "unknown");
    }

    #[tokio::test]
    async fn test_connect_log_event_recorded_on_accept() {
        let sink = MemoryEventSink::new();
        let state = test_state_with(sink.clone(), true);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_device_listener(state.clone(), listener));

        let _device = TcpStream::connect(addr).await.unwrap();

        // l'insert du log de connexion tourne dans sa propre tâche
        for _ in 0..40 {
            if sink.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, CONNECT_EVENT_TYPE);
        assert_eq!(events[0].device_id, "unknown");
        assert_eq!(events[0].raw_data["event"], "connected");
    }

    #[tokio::test]
    async fn test_connect_log_failure_does_not_block_frames() {
        // sink indisponible : le log de connexion échoue, la connexion doit
        // quand même traiter les trames et acquitter
        let state = test_state_with(Arc::new(FailingEventSink), true);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_device_listener(state.clone(), listener));

        let device = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = device.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"{\"pId\":\"A1\",\"type\":1}")
            .await
            .unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .expect("ack line");
        let ack: Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(ack["status"], "ok");

        // et l'appareil est bien enregistré malgré les inserts ratés
        assert!(state.registry.lookup("A1").is_some());
        assert_eq!(state.health.get_health(&state.registry).events_persisted, 0);
    }

    #[tokio::test]
    async fn test_end_to_end_frame_then_pushed_command() {
        let sink = MemoryEventSink::new();
        let state = test_state(sink.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_device_listener(state.clone(), listener));

        let device = TcpStream::connect(addr).await.unwrap();
        let (read_half, mut write_half) = device.into_split();
        let mut lines = BufReader::new(read_half).lines();

        write_half
            .write_all(b"noise{\"pId\":\"A1\",\"type\":1,\"x\":5}")
            .await
            .unwrap();

        let ack = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .expect("ack line");
        let ack: Value = serde_json::from_str(&ack).unwrap();
        assert_eq!(ack["status"], "ok");

        // l'appareil est adressable : on pousse une commande
        let delivered = crate::commands::dispatch_command(
            &state,
            CommandNotification {
                device_id: "A1".to_string(),
                command_data: "{\"lock\":true}".to_string(),
            },
        );
        assert!(delivered);

        let cmd = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .expect("command line");
        let cmd: Value = serde_json::from_str(&cmd).unwrap();
        assert_eq!(cmd["type"], "command");
        assert_eq!(cmd["data"]["lock"], true);

        settle().await;
        assert_eq!(sink.count(), 1);

        // fermeture : le mapping disparaît
        drop(write_half);
        drop(lines);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(state.registry.lookup("A1").is_none());
    }
}
