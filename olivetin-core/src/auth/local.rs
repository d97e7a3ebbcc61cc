//! Local username/password users (`authLocalUsers`)
//!
//! Passwords are stored in the config as PHC-format Argon2id hashes.

use crate::config::Config;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use thiserror::Error;
use tracing::{error, warn};

/// 64 MiB
const MEMORY_KIB: u32 = 64 * 1024;
const ITERATIONS: u32 = 4;
const KEY_LENGTH: usize = 32;

#[derive(Debug, Error)]
#[error("Error creating password hash: {0}")]
pub struct HashError(String);

fn default_params() -> Result<Params, HashError> {
    let parallelism = std::thread::available_parallelism()
        .map(|n| n.get().min(u8::MAX as usize) as u32)
        .unwrap_or(1);

    Params::new(MEMORY_KIB, ITERATIONS, parallelism, Some(KEY_LENGTH)).map_err(|e| HashError(e.to_string()))
}

fn hash_with(password: &str, params: Params) -> Result<String, HashError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| HashError(e.to_string()))
}

/// Hashes `password` with Argon2id (m=64MiB, t=4, p=number of CPUs, 16 byte
/// salt, 32 byte key).
pub fn create_hash(password: &str) -> Result<String, HashError> {
    hash_with(password, default_params()?)
}

/// Parameters are read back from the hash itself.
pub fn compare_password_and_hash(password: &str, hash: &str) -> bool {
    let parsed = match PasswordHash::new(hash) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!(error = %e, "Error comparing password and hash");
            return false;
        }
    };

    Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok()
}

/// True when `username` is a configured local user and `password` matches.
pub fn check_user_password(cfg: &Config, username: &str, password: &str) -> bool {
    let Some(user) = cfg.find_user_by_username(username) else {
        warn!(target: "audit", username, "Failed to check password for user, as username was not found");
        return false;
    };

    if compare_password_and_hash(password, &user.password) {
        return true;
    }

    warn!(target: "audit", username, "Password does not match for user");
    false
}
