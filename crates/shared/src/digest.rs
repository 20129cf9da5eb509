//! MD5 digest helpers used by the authentication handshake and the
//! registration reporter. MD5 itself is treated as a black box, provided by
//! the RustCrypto `md-5` crate.

use md5::{Digest, Md5};

use crate::consts::DIGEST_LENGTH;

/// Computes `MD5(data)`.
pub fn md5(data: &[u8]) -> [u8; DIGEST_LENGTH] {
    Md5::digest(data).into()
}

/// Lowercase hex encoding of a byte slice.
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Encodes a 32-bit nonce as 8 lowercase hex characters, most significant
/// byte first.
pub fn nonce_to_hex(nonce: u32) -> String {
    format!("{:08x}", nonce)
}

/// Parses 8 lowercase hex characters back into the 32-bit nonce they encode.
pub fn hex_to_nonce(hex: &str) -> Option<u32> {
    u32::from_str_radix(hex, 16).ok()
}

/// Uppercases the ASCII lowercase letters of `s` in place, leaving every
/// other byte untouched.
pub fn uppercase_ascii(s: &str) -> String {
    s.bytes()
        .map(|b| if b.is_ascii_lowercase() { b - 0x20 } else { b })
        .map(|b| b as char)
        .collect()
}

/// Computes the expected handshake response: `MD5(uppercase(password) ||
/// hex8(nonce))`.
pub fn password_response(password: &str, nonce: u32) -> [u8; DIGEST_LENGTH] {
    let mut buf = uppercase_ascii(password).into_bytes();
    buf.extend_from_slice(nonce_to_hex(nonce).as_bytes());
    md5(&buf)
}
