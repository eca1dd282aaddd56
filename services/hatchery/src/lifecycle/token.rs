//! Worker tokens.
//!
//! Format: `hwt_<32 random bytes base64>`. Only the SHA-256 hash is kept in
//! the census; the token itself is handed to the worker once.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const WORKER_TOKEN_PREFIX: &str = "hwt_";

const TOKEN_BYTES: usize = 32;

/// Generate a new worker token.
pub fn generate_worker_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill(&mut bytes);
    format!("{}{}", WORKER_TOKEN_PREFIX, URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token for storage. The hash is returned as a hex string.
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    format!("{:x}", digest)
}
