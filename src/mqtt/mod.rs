//! # MQTT side of the bridge
//!
//! Publishes translated gateway events and receives commands addressed to
//! gateway devices. The module is organized in three parts:
//!
//! ```text
//! mqtt/
//! ├── config.rs           - broker settings and topic mode
//! ├── message_manager.rs  - envelopes, topic layout and fan-out
//! └── mqtt_handler.rs     - rumqttc client, event loop task, publisher trait
//! ```
//!
//! The event loop runs in its own task and only forwards inbound publishes
//! and connection changes as [`mqtt_handler::BusEvent`]s. All translation
//! happens on the bridge loop, which publishes through the non-blocking
//! [`mqtt_handler::BusPublisher`] trait.

pub mod config;
pub mod message_manager;
pub mod mqtt_handler;
