//! Write authorization for gateway-protected devices.
//!
//! A gateway only accepts a `write` when its `data` carries a `key` field: the
//! gateway's current token encrypted with AES-128-CBC under the per-gateway
//! password and a fixed IV, hex encoded. This module also packs RGB values
//! supplied on the bus into the integer form the gateway light expects.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;
use serde_json::Value;
use thiserror::Error;

/// Initialization vector used by every gateway for key derivation.
const IV: [u8; 16] = [
    0x17, 0x99, 0x6d, 0x09, 0x3d, 0x28, 0xdd, 0xb3, 0xba, 0x69, 0x5a, 0x2e, 0x6f, 0x58, 0x56, 0x2e,
];

const BLOCK_LEN: usize = 16;

/// Brightness used when a bus RGB object does not name one.
const DEFAULT_BRIGHTNESS: u64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("password must be exactly 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("token must be at least 16 bytes, got {0}")]
    TokenTooShort(usize),

    #[error("cannot encode rgb value {0}")]
    InvalidRgb(String),
}

/// Checks that `password` can key the cipher, without needing a token.
pub fn check_password(password: &str) -> Result<(), CryptoError> {
    cipher_for(password).map(|_| ())
}

fn cipher_for(password: &str) -> Result<Aes128, CryptoError> {
    Aes128::new_from_slice(password.as_bytes())
        .map_err(|_| CryptoError::InvalidKeyLength(password.len()))
}

/// Derives the hex `key` for a write from the gateway password and token.
///
/// Every complete 16-byte block of the token is encrypted in CBC mode; a
/// trailing partial block is ignored, matching what the gateway computes on
/// its side.
pub fn derive_key(password: &str, token: &str) -> Result<String, CryptoError> {
    let cipher = cipher_for(password)?;

    let token = token.as_bytes();
    if token.len() < BLOCK_LEN {
        return Err(CryptoError::TokenTooShort(token.len()));
    }

    let mut chain = IV;
    let mut output = Vec::with_capacity(token.len() - token.len() % BLOCK_LEN);
    for chunk in token.chunks_exact(BLOCK_LEN) {
        let mut block = [0u8; BLOCK_LEN];
        for (i, byte) in chunk.iter().enumerate() {
            block[i] = byte ^ chain[i];
        }
        cipher.encrypt_block((&mut block).into());
        output.extend_from_slice(&block);
        chain = block;
    }

    Ok(hex::encode(output))
}

/// Packs an RGB value from a bus command into `brightness<<24 | r<<16 | g<<8 | b`.
///
/// Integers are taken as already packed. Strings are read as hex, with or
/// without a `#` or `0x` prefix. Objects may name `brightness`, `red`/`r`,
/// `green`/`g` and `blue`/`b`.
pub fn pack_rgb(value: &Value) -> Result<u64, CryptoError> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .filter(|v| *v <= u64::from(u32::MAX))
            .ok_or_else(|| CryptoError::InvalidRgb(value.to_string())),
        Value::String(s) => {
            let digits = s
                .trim()
                .trim_start_matches('#')
                .trim_start_matches("0x");
            u32::from_str_radix(digits, 16)
                .map(u64::from)
                .map_err(|_| CryptoError::InvalidRgb(value.to_string()))
        }
        Value::Object(fields) => {
            let channel = |long: &str, short: &str, default: u64| -> Result<u64, CryptoError> {
                match fields.get(long).or_else(|| fields.get(short)) {
                    None => Ok(default),
                    Some(v) => v
                        .as_u64()
                        .or_else(|| v.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                        .map(|c| c.min(255))
                        .ok_or_else(|| CryptoError::InvalidRgb(value.to_string())),
                }
            };
            let brightness = channel("brightness", "brightness", DEFAULT_BRIGHTNESS)?;
            let red = channel("red", "r", 0)?;
            let green = channel("green", "g", 0)?;
            let blue = channel("blue", "b", 0)?;
            Ok(brightness << 24 | red << 16 | green << 8 | blue)
        }
        _ => Err(CryptoError::InvalidRgb(value.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PASSWORD: &str = "0123456789abcdef";

    #[test]
    fn test_derive_key_is_deterministic() {
        let first = derive_key(PASSWORD, "1234567890abcdef").unwrap();
        let second = derive_key(PASSWORD, "1234567890abcdef").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_derive_key_depends_on_token() {
        let a = derive_key(PASSWORD, "1234567890abcdef").unwrap();
        let b = derive_key(PASSWORD, "1234567890abcdeg").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_depends_on_password() {
        let a = derive_key(PASSWORD, "1234567890abcdef").unwrap();
        let b = derive_key("fedcba9876543210", "1234567890abcdef").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_key_chains_blocks() {
        // The second block depends on the first through the CBC chain, so two
        // identical token halves must not produce identical ciphertext halves.
        let key = derive_key(PASSWORD, "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        assert_eq!(key.len(), 64);
        assert_ne!(key[..32], key[32..]);
    }

    #[test]
    fn test_derive_key_ignores_partial_block() {
        let full = derive_key(PASSWORD, "1234567890abcdef").unwrap();
        let longer = derive_key(PASSWORD, "1234567890abcdefXYZ").unwrap();
        assert_eq!(full, longer);
    }

    #[test]
    fn test_derive_key_rejects_bad_password_length() {
        assert_eq!(
            derive_key("short", "1234567890abcdef"),
            Err(CryptoError::InvalidKeyLength(5))
        );
        assert_eq!(
            derive_key("0123456789abcdef0", "1234567890abcdef"),
            Err(CryptoError::InvalidKeyLength(17))
        );
        assert_eq!(check_password("short"), Err(CryptoError::InvalidKeyLength(5)));
        assert_eq!(check_password(PASSWORD), Ok(()));
    }

    #[test]
    fn test_derive_key_rejects_short_token() {
        assert_eq!(derive_key(PASSWORD, "abc"), Err(CryptoError::TokenTooShort(3)));
    }

    #[test]
    fn test_pack_rgb_variants() {
        assert_eq!(pack_rgb(&json!(1694433280)).unwrap(), 1694433280);
        assert_eq!(pack_rgb(&json!("64ff0000")).unwrap(), 0x64ff0000);
        assert_eq!(pack_rgb(&json!("#64ff0000")).unwrap(), 0x64ff0000);
        assert_eq!(pack_rgb(&json!("0x0000ff")).unwrap(), 0x0000ff);
        assert_eq!(
            pack_rgb(&json!({"brightness": 50, "red": 255, "g": 16, "blue": 1})).unwrap(),
            50 << 24 | 255 << 16 | 16 << 8 | 1
        );
        assert_eq!(pack_rgb(&json!({"r": 300})).unwrap(), 100 << 24 | 255 << 16);
    }

    #[test]
    fn test_pack_rgb_rejects_garbage() {
        assert!(pack_rgb(&json!("not hex")).is_err());
        assert!(pack_rgb(&json!(true)).is_err());
        assert!(pack_rgb(&json!({"red": "x"})).is_err());
        assert!(pack_rgb(&json!(-1)).is_err());
    }
}
