//! Keyed hashing and encryption of payloads
//!
//! The symmetric primitives derive from one shared key string: HMAC-SHA256
//! uses the raw key bytes, AES-256-GCM uses the SHA-256 digest of the key.
//! AES payloads are laid out as `nonce || ciphertext || tag`.
//!
//! The asymmetric mode encrypts with an RSA public key under OAEP/SHA-256.
//! Input is split into blocks that fit one OAEP message; the output is the
//! concatenation of full-size ciphertext blocks.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::digest::{digest, SHA256};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::path::Path;

use crate::error::{Result, VigilError};

/// Hex-encoded HMAC-SHA256 of `data`
pub fn sign(key: &str, data: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    hex::encode(hmac::sign(&key, data).as_ref())
}

/// Check a hex-encoded HMAC-SHA256 in constant time
pub fn verify(key: &str, data: &[u8], signature: &str) -> Result<()> {
    let tag = hex::decode(signature).map_err(|_| VigilError::SignatureMismatch)?;
    let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
    hmac::verify(&key, data, &tag).map_err(|_| VigilError::SignatureMismatch)
}

fn aead_key(key: &str) -> Result<LessSafeKey> {
    let key_bytes = digest(&SHA256, key.as_bytes());
    let unbound = UnboundKey::new(&AES_256_GCM, key_bytes.as_ref())
        .map_err(|_| VigilError::Crypto("invalid AES key".into()))?;
    Ok(LessSafeKey::new(unbound))
}

/// Encrypt with AES-256-GCM under a fresh random nonce
pub fn encrypt(key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let aead = aead_key(key)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| VigilError::Crypto("nonce generation failed".into()))?;

    let mut in_out = plaintext.to_vec();
    aead.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
        .map_err(|_| VigilError::Crypto("encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Reverse of [`encrypt`]
pub fn decrypt(key: &str, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
        return Err(VigilError::Crypto("ciphertext too short".into()));
    }
    let aead = aead_key(key)?;

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| VigilError::Crypto("invalid nonce".into()))?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = aead
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| VigilError::Crypto("decryption failed".into()))?;
    Ok(plaintext.to_vec())
}

/// OAEP/SHA-256 overhead per block: two digests plus two bytes
const OAEP_OVERHEAD: usize = 2 * 32 + 2;

/// Parse a PEM public key, SPKI (`PUBLIC KEY`) or PKCS#1 (`RSA PUBLIC KEY`)
pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| VigilError::Crypto(format!("invalid RSA public key: {}", e)))
}

/// Parse a PEM private key, PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`)
pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey> {
    RsaPrivateKey::from_pkcs1_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
        .map_err(|e| VigilError::Crypto(format!("invalid RSA private key: {}", e)))
}

pub fn load_public_key(path: &Path) -> Result<RsaPublicKey> {
    parse_public_key(&std::fs::read_to_string(path)?)
}

pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey> {
    parse_private_key(&std::fs::read_to_string(path)?)
}

/// Encrypt with RSA-OAEP, block by block
pub fn rsa_encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let step = key
        .size()
        .checked_sub(OAEP_OVERHEAD)
        .filter(|step| *step > 0)
        .ok_or_else(|| VigilError::Crypto("RSA key too small for OAEP/SHA-256".into()))?;

    let mut rng = rand::thread_rng();
    let mut sealed = Vec::with_capacity(plaintext.len().div_ceil(step) * key.size());
    for block in plaintext.chunks(step) {
        let encrypted = key
            .encrypt(&mut rng, Oaep::new::<Sha256>(), block)
            .map_err(|e| VigilError::Crypto(format!("RSA encryption failed: {}", e)))?;
        sealed.extend_from_slice(&encrypted);
    }
    Ok(sealed)
}

/// Reverse of [`rsa_encrypt`]
pub fn rsa_decrypt(key: &RsaPrivateKey, sealed: &[u8]) -> Result<Vec<u8>> {
    let size = key.size();
    if sealed.is_empty() || sealed.len() % size != 0 {
        return Err(VigilError::Crypto(format!(
            "RSA ciphertext of {} bytes is not a whole number of {}-byte blocks",
            sealed.len(),
            size
        )));
    }

    let mut plaintext = Vec::with_capacity(sealed.len());
    for block in sealed.chunks(size) {
        let decrypted = key
            .decrypt(Oaep::new::<Sha256>(), block)
            .map_err(|e| VigilError::Crypto(format!("RSA decryption failed: {}", e)))?;
        plaintext.extend_from_slice(&decrypted);
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE_PEM: &str = include_str!("../testdata/rsa_private.pem");
    const PUBLIC_PEM: &str = include_str!("../testdata/rsa_public.pem");

    #[test]
    fn test_sign_verify() {
        let signature = sign("secret", b"payload");
        assert_eq!(signature.len(), 64);
        assert!(verify("secret", b"payload", &signature).is_ok());
        assert!(verify("other", b"payload", &signature).is_err());
        assert!(verify("secret", b"tampered", &signature).is_err());
        assert!(verify("secret", b"payload", "not-hex").is_err());
    }

    #[test]
    fn test_encrypt_decrypt() {
        let sealed = encrypt("secret", b"payload").unwrap();
        assert_eq!(sealed.len(), NONCE_LEN + 7 + AES_256_GCM.tag_len());
        assert_eq!(decrypt("secret", &sealed).unwrap(), b"payload");
        assert!(decrypt("wrong", &sealed).is_err());
    }

    #[test]
    fn test_nonce_is_fresh() {
        let a = encrypt("secret", b"payload").unwrap();
        let b = encrypt("secret", b"payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rsa_multi_block_round_trip() {
        let private = parse_private_key(PRIVATE_PEM).unwrap();
        let public = parse_public_key(PUBLIC_PEM).unwrap();
        assert_eq!(RsaPublicKey::from(&private), public);

        // 1024-bit key: 62 plaintext bytes per block
        let plaintext: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        let sealed = rsa_encrypt(&public, &plaintext).unwrap();
        assert_eq!(sealed.len(), 5 * public.size());
        assert_eq!(rsa_decrypt(&private, &sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_rsa_rejects_damaged_ciphertext() {
        let private = parse_private_key(PRIVATE_PEM).unwrap();
        let public = parse_public_key(PUBLIC_PEM).unwrap();
        let mut sealed = rsa_encrypt(&public, b"payload").unwrap();

        assert!(rsa_decrypt(&private, &sealed[..sealed.len() - 1]).is_err());
        sealed[10] ^= 0xff;
        assert!(rsa_decrypt(&private, &sealed).is_err());
        assert!(rsa_decrypt(&private, &[]).is_err());
    }

    #[test]
    fn test_invalid_pem() {
        assert!(parse_public_key("not a key").is_err());
        assert!(parse_private_key(PUBLIC_PEM).is_err());
    }
}
