//! # Auth Crypto Primitives
//!
//! Password hashing (Argon2id), random secret generation, and the encodings
//! the second-factor flows need. Comparisons against user-supplied codes go
//! through [`constant_time_eq`].

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use subtle::ConstantTimeEq;

use super::errors::{AuthError, AuthResult};

// ==================
// Password Hashing
// ==================

/// 8 MiB memory cost, 2 iterations, 1 lane
fn argon2() -> Argon2<'static> {
    let params = Params::new(8192, 2, 1, None).expect("valid argon2 params");
    Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
}

/// Hash a password with Argon2id and a fresh random salt
pub fn hash_password(password: &str) -> AuthResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Internal(format!("password hashing failed: {}", e)))?;
    Ok(hash.to_string())
}

/// Verify a password against a stored hash
///
/// A mismatch is `Ok(false)`; a hash that fails to parse is an internal
/// fault, since only this module ever writes hashes.
pub fn verify_password(password: &str, hash: &str) -> AuthResult<bool> {
    let parsed = PasswordHash::new(hash)
        .map_err(|e| AuthError::Internal(format!("stored password hash is malformed: {}", e)))?;
    Ok(argon2()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

// ==================
// Random Secrets
// ==================

/// Generate `len` random bytes as a lowercase hex string
pub fn random_hex(len: usize) -> String {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a random TOTP secret (20 bytes, Base32 encoded)
pub fn generate_totp_secret() -> String {
    use rand::Rng;
    let bytes: [u8; 20] = rand::thread_rng().gen();
    base32_encode(&bytes)
}

// ==================
// Base32 (RFC 4648)
// ==================

/// Base32 encoding, unpadded
pub fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut result = String::new();
    let mut buffer: u64 = 0;
    let mut bits_left = 0;

    for &byte in data {
        buffer = (buffer << 8) | (byte as u64);
        bits_left += 8;

        while bits_left >= 5 {
            bits_left -= 5;
            let index = ((buffer >> bits_left) & 0x1F) as usize;
            result.push(ALPHABET[index] as char);
        }
    }

    if bits_left > 0 {
        let index = ((buffer << (5 - bits_left)) & 0x1F) as usize;
        result.push(ALPHABET[index] as char);
    }

    result
}

/// Base32 decoding, tolerant of padding and lowercase
pub fn base32_decode(encoded: &str) -> Option<Vec<u8>> {
    const ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut result = Vec::new();
    let mut buffer: u64 = 0;
    let mut bits_left = 0;

    for c in encoded.chars() {
        let c = c.to_ascii_uppercase();
        if c == '=' {
            continue;
        }
        let value = ALPHABET.find(c)? as u64;
        buffer = (buffer << 5) | value;
        bits_left += 5;

        if bits_left >= 8 {
            bits_left -= 8;
            result.push((buffer >> bits_left) as u8);
        }
    }

    Some(result)
}

// ==================
// Comparisons
// ==================

/// Constant-time string equality
///
/// Length differences return early; the contents never short-circuit.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
