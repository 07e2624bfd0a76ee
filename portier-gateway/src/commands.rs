/**
 * COMMAND DISPATCHER - Du feed de notifications au push sur la connexion
 *
 * RÔLE :
 * Un acteur externe insère une commande pour un appareil ; la notification
 * arrive ici via MQTT (portier/devices/command@v1). On résout l'appareil dans
 * le registre et on pousse la trame commande sur sa connexion encore ouverte.
 *
 * SÉMANTIQUE : fire-and-forget. Pas de retry, pas de file, pas de confirmation
 * de livraison. Appareil hors ligne = commande définitivement perdue.
 */

use crate::config::MqttConf;
use crate::models::{command_line, CommandNotification};
use crate::server::SharedGateway;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::task;

pub const COMMAND_TOPIC: &str = "portier/devices/command@v1";

/// Abonne la passerelle au feed de commandes et dispatch au fil de l'eau.
pub fn spawn_command_listener(state: SharedGateway, mqtt_cfg: MqttConf) {
    task::spawn(async move {
        let mut opts = MqttOptions::new("portier-gateway", &mqtt_cfg.host, mqtt_cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        if let Err(e) = client.subscribe(COMMAND_TOPIC, QoS::AtLeastOnce).await {
            eprintln!("[commands] subscribe MQTT failed: {e:?}");
            return;
        }

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    state.health.mark_mqtt_connected();
                    println!("[commands] subscribed to {}", COMMAND_TOPIC);
                }
                Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == COMMAND_TOPIC => {
                    match serde_json::from_slice::<CommandNotification>(&p.payload) {
                        Ok(notif) => {
                            dispatch_command(&state, notif);
                        }
                        Err(e) => eprintln!("[commands] notification JSON invalide: {e}"),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    eprintln!("[commands] MQTT erreur: {:?}", e);
                    state.health.increment_reconnects();
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

/// Pousse une commande vers l'appareil ciblé si sa connexion vit encore.
/// command_data est décodé en JSON si possible, sinon gardé en chaîne opaque.
/// Retourne true si la trame est partie vers la connexion.
pub fn dispatch_command(state: &SharedGateway, notif: CommandNotification) -> bool {
    let data = serde_json::from_str::<serde_json::Value>(&notif.command_data)
        .unwrap_or_else(|_| serde_json::Value::String(notif.command_data.clone()));

    match state.registry.lookup(&notif.device_id) {
        Some(conn) => {
            if conn.send_line(command_line(&data)) {
                println!("[commands] pushed command to {} ({})", notif.device_id, conn.peer_addr);
                state.health.command_dispatched();
                true
            } else {
                // la connexion est tombée entre le lookup et l'envoi
                println!("[commands] connection for {} died mid-dispatch, command dropped", notif.device_id);
                state.health.command_missed();
                false
            }
        }
        None => {
            println!("[commands] no live connection for {}, command dropped", notif.device_id);
            state.health.command_missed();
            false
        }
    }
}
