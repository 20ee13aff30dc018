//! In-memory table of every device the bridge has heard of.
//!
//! The registry answers one question for the controller: where does a
//! message for device X go, and which gateway has to authorize it. Devices
//! are never removed; they are marked dead by the liveness tracker and come
//! back to life on the next report.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info};

use super::Sid;

/// Liveness of a registered device as last observed by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceState {
    /// Registered but no heartbeat or report seen yet
    #[default]
    Unknown,
    Alive,
    Dead,
}

#[derive(Debug, Clone)]
pub struct Device {
    pub sid: Sid,
    pub addr: IpAddr,
    pub port: u16,
    /// Sid of the gateway that proxies traffic for this device
    pub gateway: Sid,
    pub model: Option<String>,
    pub state: DeviceState,
    pub last_seen: Option<DateTime<Local>>,
}

impl Device {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

/// Resolved destination for an outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub addr: SocketAddr,
    pub gateway: Sid,
}

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: HashMap<Sid, Device>,
    /// Latest token per gateway sid
    tokens: HashMap<Sid, String>,
    /// Configured write password per gateway sid
    passwords: HashMap<Sid, String>,
}

impl DeviceRegistry {
    pub fn new(passwords: HashMap<Sid, String>) -> Self {
        Self {
            devices: HashMap::new(),
            tokens: HashMap::new(),
            passwords,
        }
    }

    /// Registers a device or moves it to a new address. Returns `true` when
    /// the sid was not known before.
    pub fn upsert(&mut self, sid: &str, addr: IpAddr, port: u16, gateway: &str) -> bool {
        match self.devices.get_mut(sid) {
            Some(device) => {
                if device.addr != addr || device.port != port || device.gateway != gateway {
                    debug!(
                        "Device {} moved from {}:{} to {}:{} (gateway {})",
                        sid, device.addr, device.port, addr, port, gateway
                    );
                }
                device.addr = addr;
                device.port = port;
                device.gateway = gateway.to_string();
                false
            }
            None => {
                info!("Registered device {} at {}:{} via gateway {}", sid, addr, port, gateway);
                self.devices.insert(
                    sid.to_string(),
                    Device {
                        sid: sid.to_string(),
                        addr,
                        port,
                        gateway: gateway.to_string(),
                        model: None,
                        state: DeviceState::Unknown,
                        last_seen: None,
                    },
                );
                true
            }
        }
    }

    pub fn lookup(&self, sid: &str) -> Option<Route> {
        self.devices.get(sid).map(|device| Route {
            addr: device.socket_addr(),
            gateway: device.gateway.clone(),
        })
    }

    pub fn device(&self, sid: &str) -> Option<&Device> {
        self.devices.get(sid)
    }

    pub fn contains(&self, sid: &str) -> bool {
        self.devices.contains_key(sid)
    }

    /// Finds a registered gateway (a device that owns itself) at `addr`.
    pub fn gateway_at(&self, addr: IpAddr) -> Option<&Device> {
        self.devices
            .values()
            .find(|device| device.addr == addr && device.sid == device.gateway)
    }

    pub fn mark_seen(&mut self, sid: &str, model: Option<&str>) {
        if let Some(device) = self.devices.get_mut(sid) {
            device.state = DeviceState::Alive;
            device.last_seen = Some(Local::now());
            if let Some(model) = model {
                device.model = Some(model.to_string());
            }
        }
    }

    pub fn mark_dead(&mut self, sid: &str) {
        if let Some(device) = self.devices.get_mut(sid) {
            device.state = DeviceState::Dead;
        }
    }

    pub fn set_token(&mut self, gateway: &str, token: &str) {
        self.tokens.insert(gateway.to_string(), token.to_string());
    }

    pub fn token(&self, gateway: &str) -> Option<&str> {
        self.tokens.get(gateway).map(String::as_str)
    }

    pub fn password(&self, gateway: &str) -> Option<&str> {
        self.passwords.get(gateway).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
