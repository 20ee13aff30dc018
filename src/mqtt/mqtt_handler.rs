use rumqttc::{AsyncClient, Event, EventLoop, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, trace, warn};

use super::config::{MqttConfig, MqttConfigError};
use super::message_manager::MQTTMessage;

const REQUEST_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 256;
const RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Clone, Debug, Default)]
pub struct MQTTStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
}

impl MQTTStatus {
    /// Records a ConnAck and returns the state it replaced.
    pub fn connected(&mut self) -> ConnectionState {
        std::mem::replace(&mut self.connection_state, ConnectionState::Connected)
    }

    /// Records a connection error. Returns `true` only when an established
    /// connection was lost, so repeated retries report once.
    pub fn lost(&mut self) -> bool {
        if self.connection_state != ConnectionState::Connected {
            return false;
        }
        self.connection_state = ConnectionState::Reconnecting;
        true
    }
}

/// What the bus side reports back to the bridge loop.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// Broker acknowledged a (re)connect
    Connected,
    /// Connection dropped; rumqttc keeps retrying
    Disconnected(String),
    Message(MQTTMessage),
}

/// Outbound half of the bus. Neither call blocks or reports delivery.
pub trait BusPublisher {
    fn publish(&mut self, topic: &str, payload: String);
    fn subscribe(&mut self, filter: &str);
}

/// Cheap handle for publishing and subscribing; the connection itself is
/// driven by [`MqttHandler`].
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
}

impl MqttHandle {
    pub fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to request mqtt disconnect: {}", e);
        }
    }
}

impl BusPublisher for MqttHandle {
    fn publish(&mut self, topic: &str, payload: String) {
        trace!("Mqtt from {}: {}", topic, payload);
        if let Err(e) = self
            .client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
        {
            error!("Failed to publish to {}: {}", topic, e);
        }
    }

    fn subscribe(&mut self, filter: &str) {
        match self.client.try_subscribe(filter, QoS::AtMostOnce) {
            Ok(()) => info!("Mqtt subscribe {}", filter),
            Err(e) => error!("Failed to subscribe to {}: {}", filter, e),
        }
    }
}

/// Owns the rumqttc event loop and forwards what matters to the bridge.
pub struct MqttHandler {
    status: MQTTStatus,
    eventloop: EventLoop,
    events: mpsc::Sender<BusEvent>,
}

impl MqttHandler {
    /// Creates the client and spawns the task polling its event loop.
    pub fn spawn(
        config: &MqttConfig,
        client_id: &str,
    ) -> Result<(MqttHandle, mpsc::Receiver<BusEvent>, JoinHandle<()>), MqttConfigError> {
        let options = config.mqtt_options(client_id)?;
        info!("clientId = {}", client_id);

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (events, receiver) = mpsc::channel(EVENT_CAPACITY);

        let handler = MqttHandler {
            status: MQTTStatus::default(),
            eventloop,
            events,
        };
        let task = tokio::spawn(handler.run());

        Ok((MqttHandle { client }, receiver, task))
    }

    async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    match self.status.connected() {
                        ConnectionState::Reconnecting => info!("Mqtt connection restored"),
                        previous => debug!("Mqtt ConnAck while {:?}", previous),
                    }
                    if !self.forward(BusEvent::Connected).await {
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    self.status.messages_received += 1;
                    let content = String::from_utf8_lossy(&publish.payload).into_owned();
                    debug!("Mqtt to {}: {}", publish.topic, content);
                    let message = MQTTMessage::from_topic(publish.topic, content);
                    if !self.forward(BusEvent::Message(message)).await {
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!(
                        "Mqtt connection closed after {} inbound messages",
                        self.status.messages_received
                    );
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if self.status.lost()
                        && !self.forward(BusEvent::Disconnected(e.to_string())).await
                    {
                        break;
                    }
                    error!("Mqtt connection error: {}", e);
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        debug!("Mqtt event loop task exiting");
    }

    /// Returns `false` once the bridge has stopped listening.
    async fn forward(&mut self, event: BusEvent) -> bool {
        if self.events.send(event).await.is_err() {
            warn!("Bridge loop is gone, stopping mqtt event loop");
            return false;
        }
        true
    }
}
