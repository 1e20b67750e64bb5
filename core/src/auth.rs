//! Password hashing and bearer-token primitives.
//!
//! Stored password format: `pbkdf2-sha256$<rounds>$<salt hex>$<hash hex>`.

use anyhow::{Context, Result, bail};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const DEFAULT_PBKDF2_ROUNDS: u32 = 210_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
const SCHEME: &str = "pbkdf2-sha256";

fn derive(password: &str, salt: &[u8], rounds: u32) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, rounds, &mut out);
    out
}

#[must_use]
pub fn hash_password(password: &str, rounds: u32) -> String {
    let salt: [u8; SALT_LEN] = rand::rng().random();
    let hash = derive(password, &salt, rounds);
    format!("{SCHEME}${rounds}${}${}", hex::encode(salt), hex::encode(hash))
}

/// Constant-time check of `password` against a stored hash. A malformed stored
/// value is an error, not a mismatch.
pub fn verify_password(password: &str, stored: &str) -> Result<bool> {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, rounds, salt, hash] = parts.as_slice() else {
        bail!("Malformed password hash");
    };
    if *scheme != SCHEME {
        bail!("Unsupported password hash scheme '{scheme}'");
    }
    let rounds: u32 = rounds.parse().context("Malformed password hash rounds")?;
    let salt = hex::decode(salt).context("Malformed password hash salt")?;
    let expected = hex::decode(hash).context("Malformed password hash")?;
    let actual = derive(password, &salt, rounds);
    Ok(actual.as_slice().ct_eq(expected.as_slice()).unwrap_u8() == 1)
}

/// 32 random bytes, hex encoded.
#[must_use]
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// Sessions are looked up by this digest; the plaintext token is never stored.
#[must_use]
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
