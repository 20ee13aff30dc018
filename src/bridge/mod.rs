//! # The bridge proper
//!
//! Ties the gateway side to the bus side. One loop owns all state and feeds
//! it one event at a time: a datagram, a bus message, a liveness expiry or a
//! signal.
//!
//! ```text
//! bridge/
//! ├── command.rs     - parsing of `<prefix>/to/...` commands
//! ├── controller.rs  - state and translation in both directions
//! ├── error.rs       - failures reported back as `xm` notices
//! └── service.rs     - socket, mqtt task, select loop and shutdown
//! ```

pub mod command;
pub mod controller;
pub mod error;
pub mod service;
