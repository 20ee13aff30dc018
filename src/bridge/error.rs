use thiserror::Error;

use crate::gateway::{crypto::CryptoError, protocol::ProtocolError, Sid};

/// Failures of a single translation step. The `Display` text is what bus
/// consumers see in the `{"cmd":"xm","msg":...}` notice.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("sid >{0}< unknown.")]
    UnknownDevice(Sid),

    #[error("{0} needs a sid.")]
    MissingSid(String),

    #[error("Password Unknown for \"{0}\", check the password in config.")]
    MissingPassword(Sid),

    #[error("gateway token unknown for gateway {0}.")]
    UnknownToken(Sid),

    #[error("Cipher error for gateway {gateway}: {source}, check the password in config.")]
    Crypto { gateway: Sid, source: CryptoError },

    #[error("invalid JSON format >{0}<")]
    InvalidJson(String),

    #[error("invalid TOPIC >{0}<")]
    InvalidTopic(String),

    #[error("invalid {command} command: {reason}")]
    InvalidCommand { command: String, reason: String },

    #[error("unable to encode request: {0}")]
    Encode(#[from] ProtocolError),
}
