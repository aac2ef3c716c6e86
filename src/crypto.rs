//! Payload encryption and code signatures for the function runner.
//!
//! - Hybrid encryption of schedule payloads: a fresh AES-256-GCM key per
//!   payload, wrapped with RSA-OAEP (SHA-256) under the cluster public key
//! - HMAC-SHA256 signatures binding a code name to the backend token

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

use crate::error::ProviderError;

/// Nonce size for AES-GCM (96 bits / 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// AES-256 key size.
const KEY_SIZE: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Parse a PEM public key, SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`).
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, ProviderError> {
    let pem = pem.trim();
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| ProviderError::Validation(format!("invalid cluster public key: {}", e)))
}

/// Encrypt `plaintext` for the cluster owning `public_pem`.
///
/// Format: base64(rsa_oaep(aes_key) || nonce || ciphertext || auth_tag)
pub fn encrypt_payload(public_pem: &str, plaintext: &[u8]) -> Result<String, ProviderError> {
    let public_key = parse_public_key(public_pem)?;

    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|e| ProviderError::InvalidRequest(format!("payload key: {}", e)))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| ProviderError::InvalidRequest(format!("payload encryption: {}", e)))?;
    let wrapped = public_key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &key)
        .map_err(|e| ProviderError::InvalidRequest(format!("payload key wrapping: {}", e)))?;

    let mut out = Vec::with_capacity(wrapped.len() + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(out))
}

/// Hex HMAC-SHA256 of `code_name` keyed with the backend `token`.
pub fn code_signature(token: &str, code_name: &str) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(token.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(code_name.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Whether `signature` is the signature of `code_name` under `token`.
pub fn verify_code_signature(token: &str, code_name: &str, signature: &str) -> bool {
    let Ok(expected) = hex::decode(signature) else {
        return false;
    };
    match <HmacSha256 as Mac>::new_from_slice(token.as_bytes()) {
        Ok(mut mac) => {
            mac.update(code_name.as_bytes());
            mac.verify_slice(&expected).is_ok()
        },
        Err(_) => false,
    }
}
