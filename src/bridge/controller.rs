use serde_json::{json, Map, Value};
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, error, info, trace, warn};

use super::command::BusCommand;
use super::error::BridgeError;
use crate::gateway::crypto::{check_password, derive_key, pack_rgb};
use crate::gateway::liveness::{Expired, LivenessTracker};
use crate::gateway::models::{normalize, DataFormat, ModelFamily};
use crate::gateway::protocol::{Command, GatewayMessage, Request, WriteRequest};
use crate::gateway::registry::DeviceRegistry;
use crate::gateway::transport::GatewayTransport;
use crate::mqtt::message_manager::{Envelope, Topics};
use crate::mqtt::mqtt_handler::BusPublisher;

/// Port gateways accept unicast commands on.
pub const GATEWAY_COMMAND_PORT: u16 = 9898;

/// Knobs of the translation that do not belong to either side.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Name used in the started/stopped notices
    pub name: String,
    pub data_format: DataFormat,
    /// Publish only every n-th gateway heartbeat
    pub heartbeat_every: u32,
    /// Where `whois` is sent
    pub discovery: SocketAddr,
}

/// Owns all bridge state and translates in both directions.
///
/// Every method runs to completion without awaiting; the service loop calls
/// them one at a time, so state is never shared.
pub struct Bridge<B: BusPublisher, T: GatewayTransport> {
    settings: BridgeSettings,
    registry: DeviceRegistry,
    liveness: LivenessTracker,
    topics: Topics,
    bus: B,
    transport: T,
    gateway_heartbeats: u64,
}

impl<B: BusPublisher, T: GatewayTransport> Bridge<B, T> {
    pub fn new(
        settings: BridgeSettings,
        registry: DeviceRegistry,
        liveness: LivenessTracker,
        topics: Topics,
        bus: B,
        transport: T,
    ) -> Self {
        Self {
            settings,
            registry,
            liveness,
            topics,
            bus,
            transport,
            gateway_heartbeats: 0,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Multicasts `whois` so every gateway on the LAN answers with `iam`.
    pub fn discover(&mut self) {
        info!("Sending whois to {}", self.settings.discovery);
        let discovery = self.settings.discovery;
        if let Err(e) = self.send(&Request::Whois, discovery) {
            error!("{}", e);
        }
    }

    /// Called on every broker (re)connect.
    pub fn on_bus_connected(&mut self) {
        info!("Mqtt connected");
        let filter = self.topics.subscription();
        self.bus.subscribe(&filter);
        let started = format!("{} started.", self.settings.name);
        self.publish(&Envelope::notice(started));
    }

    pub fn on_shutdown(&mut self) {
        let stopped = format!("{} stopped.", self.settings.name);
        self.publish(&Envelope::notice(stopped));
    }

    /// Waits for the next device to go silent. Resolves to `None` at once
    /// when no device is being watched.
    pub async fn next_expired(&mut self) -> Option<Expired> {
        self.liveness.next_expired().await
    }

    pub fn handle_expired(&mut self, expired: Expired) {
        let last_seen = self
            .registry
            .device(&expired.sid)
            .and_then(|device| device.last_seen)
            .map(|seen| seen.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        info!(
            "Device {} silent since {}, marking dead ({} still watched)",
            expired.sid,
            last_seen,
            self.liveness.pending()
        );
        self.registry.mark_dead(&expired.sid);
        let envelope = Envelope::event(
            "_makeDead",
            expired.model,
            Some(expired.sid),
            expired.short_id,
            json!({ "dead": "on" }),
        );
        self.publish(&envelope);
    }

    /// Entry point for every datagram read from the gateway socket.
    pub fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) {
        let message = match GatewayMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                error!(
                    "Dropping datagram from {}: {} >{}<",
                    from,
                    e,
                    String::from_utf8_lossy(bytes)
                );
                return;
            }
        };
        trace!("Received {} from {}", message.raw, from);

        match message.command {
            Command::Iam => self.on_iam(message, from),
            Command::GetIdListAck => self.on_id_list(message, from),
            _ if message.command.is_state_update() => self.on_state_update(message, from),
            Command::Unknown(_) => warn!("Unknown msg {} from client {}", message.raw, from),
            _ => debug!("Ignoring request {} seen from {}", message.command, from),
        }
    }

    /// Entry point for every publish received on the command tree.
    pub fn handle_bus_message(&mut self, topic: &str, payload: &str) {
        debug!("Mqtt to {}: {}", topic, payload);
        let Some(suffix) = self.topics.command_suffix(topic) else {
            self.report(BridgeError::InvalidTopic(topic.to_string()));
            return;
        };

        let result = BusCommand::parse(suffix, payload).and_then(|command| match command {
            BusCommand::Read { sid } => self.read(&sid),
            BusCommand::GetIdList { sid } => self.get_id_list(&sid),
            BusCommand::Write(request) => self.write(request),
        });
        if let Err(e) = result {
            self.report(e);
        }
    }

    pub fn read(&mut self, sid: &str) -> Result<(), BridgeError> {
        let route = self
            .registry
            .lookup(sid)
            .ok_or_else(|| BridgeError::UnknownDevice(sid.to_string()))?;
        self.send(&Request::Read { sid: sid.to_string() }, route.addr)
    }

    pub fn get_id_list(&mut self, sid: &str) -> Result<(), BridgeError> {
        let route = self
            .registry
            .lookup(sid)
            .ok_or_else(|| BridgeError::UnknownDevice(sid.to_string()))?;
        self.send(&Request::GetIdList, route.addr)
    }

    /// Authorizes and forwards a write. Nothing is sent unless the target's
    /// gateway has a usable password and a known token. A bad password is
    /// reported before a missing token.
    pub fn write(&mut self, mut request: WriteRequest) -> Result<(), BridgeError> {
        let route = self
            .registry
            .lookup(&request.sid)
            .ok_or_else(|| BridgeError::UnknownDevice(request.sid.clone()))?;
        let password = self
            .registry
            .password(&route.gateway)
            .ok_or_else(|| BridgeError::MissingPassword(request.sid.clone()))?;
        check_password(password).map_err(|source| BridgeError::Crypto {
            gateway: route.gateway.clone(),
            source,
        })?;
        let token = self
            .registry
            .token(&route.gateway)
            .ok_or_else(|| BridgeError::UnknownToken(route.gateway.clone()))?;
        let key = derive_key(password, token).map_err(|source| BridgeError::Crypto {
            gateway: route.gateway.clone(),
            source,
        })?;

        if request.model.as_deref().map(ModelFamily::of) == Some(ModelFamily::Gateway) {
            if let Some(rgb) = request.data.get("rgb") {
                let packed = pack_rgb(rgb).map_err(|e| BridgeError::InvalidCommand {
                    command: request.cmd.clone(),
                    reason: e.to_string(),
                })?;
                request.data.insert("rgb".to_string(), Value::from(packed));
            }
        }
        request.data.insert("key".to_string(), Value::String(key));

        debug!(
            "Write {} to sid {} via gateway {} at {}",
            request.cmd, request.sid, route.gateway, route.addr
        );
        self.send(&Request::Write(request), route.addr)
    }

    fn on_iam(&mut self, message: GatewayMessage, from: SocketAddr) {
        let Some(sid) = message.sid else {
            warn!("iam without sid from {}: {}", from, message.raw);
            return;
        };
        let addr = message
            .ip
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .unwrap_or_else(|| from.ip());
        let port = message.port.unwrap_or(GATEWAY_COMMAND_PORT);

        self.registry.upsert(&sid, addr, port, &sid);
        if let Some(token) = &message.token {
            self.registry.set_token(&sid, token);
        }
        info!("Gateway sid {} Address {}, Port {}", sid, addr, port);

        if let Err(e) = self.get_id_list(&sid) {
            self.report(e);
        }
    }

    fn on_id_list(&mut self, message: GatewayMessage, from: SocketAddr) {
        let Some(gateway) = message.sid else {
            warn!("get_id_list_ack without sid from {}: {}", from, message.raw);
            return;
        };
        if let Some(token) = &message.token {
            self.registry.set_token(&gateway, token);
        }

        let Some(children) = message.data.as_array() else {
            warn!("get_id_list_ack without id list: {}", message.raw);
            return;
        };
        let children: Vec<String> = children
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect();
        for child in &children {
            self.registry.upsert(child, from.ip(), from.port(), &gateway);
            if let Err(e) = self.read(child) {
                self.report(e);
            }
        }

        let envelope = Envelope::event(
            Command::GetIdListAck.as_str(),
            None,
            Some(gateway),
            None,
            message.data,
        );
        self.publish(&envelope);
    }

    fn on_state_update(&mut self, message: GatewayMessage, from: SocketAddr) {
        let Some(sid) = message.sid.clone() else {
            warn!("{} without sid from {}: {}", message.command, from, message.raw);
            return;
        };
        let family = message
            .model
            .as_deref()
            .map(ModelFamily::of)
            .unwrap_or(ModelFamily::Unknown);
        if family == ModelFamily::Unknown {
            warn!("UNKNOWN MODEL {}", message.raw);
        }

        if !self.registry.contains(&sid) {
            self.adopt(&sid, family, from);
        }
        if !self.liveness.is_armed(&sid) {
            debug!("Watching {} for liveness", sid);
        }
        self.registry.mark_seen(&sid, message.model.as_deref());
        self.liveness
            .touch(&sid, message.model.as_deref(), message.short_id.as_ref());

        if let Some(token) = &message.token {
            self.registry.set_token(&sid, token);
        }

        let mut data = match message.data {
            Value::Object(fields) => fields,
            other => {
                warn!("Non-object data from {}: {}", sid, other);
                let mut fields = Map::new();
                fields.insert("value".to_string(), other);
                fields
            }
        };
        data.insert("dead".to_string(), Value::from("off"));
        if self.settings.data_format == DataFormat::Parsed {
            normalize(family, &mut data);
        }

        if message.command == Command::Heartbeat
            && family == ModelFamily::Gateway
            && !self.heartbeat_due()
        {
            trace!("Skipping gateway heartbeat from {}", sid);
            return;
        }

        let envelope = Envelope::event(
            message.command.as_str(),
            message.model,
            Some(sid),
            message.short_id,
            Value::Object(data),
        );
        self.publish(&envelope);
    }

    /// Registers a sid that reported before discovery listed it. Sub-devices
    /// are attached to the gateway at the sender's address, gateways to
    /// themselves.
    fn adopt(&mut self, sid: &str, family: ModelFamily, from: SocketAddr) {
        let parent = self
            .registry
            .gateway_at(from.ip())
            .map(|gateway| (gateway.sid.clone(), gateway.port));

        match parent {
            Some((gateway, port)) => {
                info!("Registering {} behind gateway {}", sid, gateway);
                self.registry.upsert(sid, from.ip(), port, &gateway);
                if let Err(e) = self.read(sid) {
                    self.report(e);
                }
            }
            None if family == ModelFamily::Gateway => {
                info!("Registering gateway {} from heartbeat at {}", sid, from.ip());
                self.registry
                    .upsert(sid, from.ip(), GATEWAY_COMMAND_PORT, sid);
                if let Err(e) = self.get_id_list(sid) {
                    self.report(e);
                }
            }
            // Registered once its gateway lists it in get_id_list_ack
            None => debug!("{} at {} has no known gateway yet", sid, from),
        }
    }

    fn heartbeat_due(&mut self) -> bool {
        let every = u64::from(self.settings.heartbeat_every.max(1));
        let due = self.gateway_heartbeats % every == 0;
        self.gateway_heartbeats += 1;
        due
    }

    fn send(&mut self, request: &Request, to: SocketAddr) -> Result<(), BridgeError> {
        let payload = request.encode()?;
        trace!("Sending {} to {}", request.command(), to);
        self.transport.send(&payload, to);
        Ok(())
    }

    fn publish(&mut self, envelope: &Envelope) {
        for message in self.topics.fan_out(envelope) {
            self.bus.publish(&message.topic, message.content);
        }
    }

    fn report(&mut self, e: BridgeError) {
        warn!("{}", e);
        self.publish(&Envelope::notice(e.to_string()));
    }
}
