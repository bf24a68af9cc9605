//! Helpers exposed to scripts as `utils::*`.

use argon2::Argon2;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256, Sha512};

use super::error::{ExecutionError, ExecutionResult};

/// Upper bound for `uniqid` so a script cannot request huge allocations.
pub const MAX_UNIQID_BYTES: usize = 1024;

pub fn btoa(input: &str) -> String {
    STANDARD.encode(input.as_bytes())
}

pub fn atob(input: &str) -> ExecutionResult<String> {
    let bytes = STANDARD
        .decode(input.trim())
        .map_err(|err| ExecutionError::HostCapability(format!("atob: {err}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Random identifier: `len` random bytes, hex encoded.
pub fn uniqid(len: usize) -> String {
    let mut bytes = vec![0u8; len.min(MAX_UNIQID_BYTES)];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn md5(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

pub fn sha256(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

pub fn sha512(input: &str) -> String {
    hex::encode(Sha512::digest(input.as_bytes()))
}

/// Hash a password into a PHC string (argon2id, random salt).
pub fn hash_password(password: &str) -> ExecutionResult<String> {
    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt)
        .map_err(|err| ExecutionError::HostCapability(format!("password salt: {err}")))?;
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|err| ExecutionError::HostCapability(format!("password hash: {err}")))
}

/// Check a password against a PHC string. Malformed hashes never match.
pub fn verify_password(hash: &str, password: &str) -> bool {
    PasswordHash::new(hash).is_ok_and(|parsed| {
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
}
