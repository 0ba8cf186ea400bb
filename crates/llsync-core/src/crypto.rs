//! Authentication and integrity primitives.
//!
//! Challenge/response signatures are HMAC-SHA1 over an ASCII payload,
//! keyed with the hex-decoded PSK and compared as lowercase hex strings.
//! Firmware integrity uses CRC32 over the full image.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("PSK is not valid hex: {0}")]
    BadPskHex(hex::FromHexError),

    #[error("user identity is not valid hex: {0}")]
    BadIdentityHex(hex::FromHexError),
}

/// Sign `payload` with the hex-encoded PSK, returning lowercase hex.
pub fn hmac_signature(payload: &str, psk_hex: &str) -> Result<String, AuthError> {
    let key = hex::decode(psk_hex).map_err(AuthError::BadPskHex)?;
    // new_from_slice accepts any key length for HMAC.
    let mut mac = HmacSha1::new_from_slice(&key).expect("HMAC accepts any key length");
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Compare two hex signatures case-insensitively.
pub fn signatures_match(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.eq_ignore_ascii_case(b)
}

/// CRC32 (IEEE) over a byte buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Random 32-bit nonce for the bind challenge.
pub fn gen_nonce() -> u32 {
    rand::thread_rng().next_u32()
}

/// Random 4-byte PSK as 8 lowercase hex characters.
pub fn gen_psk() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
