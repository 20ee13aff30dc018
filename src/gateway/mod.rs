//! # Gateway side of the bridge
//!
//! Everything that speaks the gateway LAN protocol lives here: the UDP
//! transport, the JSON codec, per-model payload normalization, write key
//! derivation, the device registry and the liveness timers.
//!
//! ```text
//! gateway/
//! ├── crypto.rs     - write key derivation and RGB packing
//! ├── liveness.rs   - per-device dead timers
//! ├── models.rs     - model families and payload normalization
//! ├── protocol.rs   - command vocabulary, datagram decode/encode
//! ├── registry.rs   - sid -> address/gateway, tokens, passwords
//! └── transport.rs  - UDP socket setup and sending
//! ```

pub mod crypto;
pub mod liveness;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod transport;

/// Device identifier assigned by the gateway hardware
pub type Sid = String;
