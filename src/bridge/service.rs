use color_eyre::eyre::{eyre, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use super::controller::{Bridge, BridgeSettings};
use crate::config::Config;
use crate::gateway::liveness::LivenessTracker;
use crate::gateway::registry::DeviceRegistry;
use crate::gateway::transport::{self, UdpTransport};
use crate::mqtt::message_manager::Topics;
use crate::mqtt::mqtt_handler::{BusEvent, MqttHandler};

const CONNECT_DEADLINE: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
/// Largest UDP payload; `recv_from` truncates anything beyond the buffer.
/// Id lists of large installations run past a few kilobytes.
const DATAGRAM_BUFFER: usize = 65_535;

fn client_id() -> String {
    let nanos = chrono::Utc::now().timestamp_subsec_nanos();
    format!("{}_{:08x}", env!("CARGO_PKG_NAME"), nanos)
}

/// Runs the bridge until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let group = config.gateway.multicast_address;
    let socket = transport::bind(config.gateway.server_port, group)
        .await
        .map_err(|e| eyre!("Unable to open gateway socket: {}", e))?;
    let socket = Arc::new(socket);

    let (handle, mut bus_events, mqtt_task) = MqttHandler::spawn(&config.mqtt, &client_id())
        .map_err(|e| eyre!("Unable to set up mqtt client: {}", e))?;
    info!("Mqtt broker {}", config.mqtt);

    let settings = BridgeSettings {
        name: env!("CARGO_PKG_NAME").to_string(),
        data_format: config.data_format,
        heartbeat_every: config.heartbeat_every,
        discovery: SocketAddr::from((group, config.gateway.multicast_port)),
    };
    let mut bridge = Bridge::new(
        settings,
        DeviceRegistry::new(config.gateway.passwords.clone()),
        LivenessTracker::default(),
        Topics::new(&config.mqtt.topic_prefix, config.mqtt.topic_mode),
        handle.clone(),
        UdpTransport::new(Arc::clone(&socket)),
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let connect_deadline = sleep(CONNECT_DEADLINE);
    tokio::pin!(connect_deadline);
    let mut connected = false;
    let mut deadline_checked = false;
    let mut buf = vec![0u8; DATAGRAM_BUFFER];

    bridge.discover();
    info!("Bridge running. Send SIGINT/SIGTERM to stop.");

    loop {
        tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => bridge.handle_datagram(&buf[..len], from),
                Err(e) => error!("Gateway socket receive failed: {}", e),
            },
            event = bus_events.recv() => match event {
                Some(BusEvent::Connected) => {
                    connected = true;
                    bridge.on_bus_connected();
                }
                Some(BusEvent::Disconnected(reason)) => {
                    connected = false;
                    warn!("Mqtt connection lost: {}", reason);
                }
                Some(BusEvent::Message(message)) => {
                    bridge.handle_bus_message(&message.topic, &message.content)
                }
                None => {
                    error!("Mqtt event loop stopped unexpectedly");
                    break;
                }
            },
            Some(expired) = bridge.next_expired() => bridge.handle_expired(expired),
            _ = &mut connect_deadline, if !deadline_checked => {
                deadline_checked = true;
                if !connected {
                    error!(
                        "No connection to mqtt broker {} after {}s",
                        config.mqtt,
                        CONNECT_DEADLINE.as_secs()
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
        }
    }

    bridge.on_shutdown();
    handle.disconnect();
    match timeout(SHUTDOWN_GRACE, mqtt_task).await {
        Ok(Ok(())) => debug!("Mqtt event loop finished"),
        Ok(Err(e)) => warn!("Mqtt event loop task failed: {}", e),
        Err(_) => warn!("Mqtt event loop did not finish within {:?}", SHUTDOWN_GRACE),
    }
    info!(
        "{} stopped with {} known device(s)",
        env!("CARGO_PKG_NAME"),
        bridge.registry().len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_large_datagram_is_received_whole() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sender = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let children: Vec<String> = (0..120).map(|i| format!("158d0000{i:08x}")).collect();
        let ids = serde_json::to_string(&children).unwrap();
        let message = serde_json::json!({
            "cmd": "get_id_list_ack",
            "sid": "34ce0088f1a2",
            "token": "1234567890abcdef",
            "data": ids,
        })
        .to_string();
        assert!(message.len() > 2048);

        sender
            .send_to(message.as_bytes(), receiver.local_addr().unwrap())
            .await
            .unwrap();
        let mut buf = vec![0u8; DATAGRAM_BUFFER];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, message.len());
        assert_eq!(&buf[..len], message.as_bytes());
    }

    #[test]
    fn test_client_id_shape() {
        let id = client_id();
        let suffix = id.strip_prefix("xiaomi-mqtt_").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
