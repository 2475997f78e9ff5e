//! Wire encoding of metric batches
//!
//! The agent encodes a batch once per send: JSON, then gzip, then optional
//! encryption (AES-256-GCM under the shared key, or RSA-OAEP under the
//! server's public key), then an optional HMAC over the final body. The
//! server undoes the same steps in reverse order.

use std::sync::Arc;

use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::compression;
use crate::crypto;
use crate::error::{Result, VigilError};

/// Header carrying the hex HMAC-SHA256 of the body as sent
pub const HASH_HEADER: &str = "HashSHA256";
/// Header naming the encryption applied to the body
pub const ENCRYPTION_HEADER: &str = "X-Encryption";
pub const ENCRYPTION_AES_GCM: &str = "aes-256-gcm";
pub const ENCRYPTION_RSA_OAEP: &str = "rsa-oaep-sha256";
/// Header carrying the agent's own address for subnet checks
pub const REAL_IP_HEADER: &str = "X-Real-IP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    AesGcm,
    RsaOaep,
}

impl Encryption {
    pub fn header_value(self) -> &'static str {
        match self {
            Self::AesGcm => ENCRYPTION_AES_GCM,
            Self::RsaOaep => ENCRYPTION_RSA_OAEP,
        }
    }

    pub fn from_header(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case(ENCRYPTION_AES_GCM) {
            Ok(Self::AesGcm)
        } else if value.eq_ignore_ascii_case(ENCRYPTION_RSA_OAEP) {
            Ok(Self::RsaOaep)
        } else {
            Err(VigilError::Crypto(format!("unsupported encryption: {}", value)))
        }
    }
}

/// Body plus the transport metadata that describes it
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub body: Vec<u8>,
    pub signature: Option<String>,
    pub encryption: Option<Encryption>,
}

/// How a received body was transformed by its sender
#[derive(Debug, Clone, Default)]
pub struct PayloadHeaders<'a> {
    pub gzip: bool,
    pub encryption: Option<Encryption>,
    pub signature: Option<&'a str>,
}

#[derive(Debug, Clone, Default)]
pub struct PayloadCodec {
    key: Option<String>,
    encrypt: bool,
    public_key: Option<Arc<RsaPublicKey>>,
    private_key: Option<Arc<RsaPrivateKey>>,
}

impl PayloadCodec {
    /// `encrypt` needs a key; an empty key counts as no key.
    pub fn new(key: Option<String>, encrypt: bool) -> Result<Self> {
        let key = key.filter(|k| !k.is_empty());
        if encrypt && key.is_none() {
            return Err(VigilError::Config("encryption requires a key".into()));
        }
        Ok(Self {
            key,
            encrypt,
            ..Self::default()
        })
    }

    /// Encrypt outgoing bodies with RSA-OAEP instead of AES-GCM
    pub fn with_public_key(mut self, key: RsaPublicKey) -> Self {
        self.public_key = Some(Arc::new(key));
        self
    }

    /// Require and decrypt RSA-OAEP bodies
    pub fn with_private_key(mut self, key: RsaPrivateKey) -> Self {
        self.private_key = Some(Arc::new(key));
        self
    }

    /// Serialize and transform `value` for sending
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncodedPayload> {
        let json = serde_json::to_vec(value)?;
        let mut body = compression::compress(&json)?;

        let mut encryption = None;
        if let Some(public_key) = &self.public_key {
            body = crypto::rsa_encrypt(public_key, &body)?;
            encryption = Some(Encryption::RsaOaep);
        } else if let (true, Some(key)) = (self.encrypt, &self.key) {
            body = crypto::encrypt(key, &body)?;
            encryption = Some(Encryption::AesGcm);
        }

        let signature = self.sign(&body);
        Ok(EncodedPayload {
            body,
            signature,
            encryption,
        })
    }

    /// Verify, decrypt and inflate a received body.
    ///
    /// A signature is checked only when both a key and the header are present.
    /// With a private key configured, only RSA-encrypted bodies are accepted.
    pub fn decode_bytes(&self, body: &[u8], headers: &PayloadHeaders<'_>) -> Result<Vec<u8>> {
        if let (Some(key), Some(signature)) = (&self.key, headers.signature) {
            crypto::verify(key, body, signature)?;
        }

        if self.private_key.is_some() && headers.encryption != Some(Encryption::RsaOaep) {
            return Err(VigilError::Crypto("payload must be RSA encrypted".into()));
        }

        let mut data = match headers.encryption {
            None => body.to_vec(),
            Some(Encryption::AesGcm) => {
                let key = self.key.as_ref().ok_or_else(|| {
                    VigilError::Crypto("encrypted payload but no key configured".into())
                })?;
                crypto::decrypt(key, body)?
            }
            Some(Encryption::RsaOaep) => {
                let key = self.private_key.as_ref().ok_or_else(|| {
                    VigilError::Crypto("RSA payload but no private key configured".into())
                })?;
                crypto::rsa_decrypt(key, body)?
            }
        };

        if headers.gzip {
            data = compression::decompress(&data)?;
        }
        Ok(data)
    }

    pub fn decode<T: DeserializeOwned>(&self, body: &[u8], headers: &PayloadHeaders<'_>) -> Result<T> {
        let data = self.decode_bytes(body, headers)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn sign(&self, data: &[u8]) -> Option<String> {
        self.key.as_ref().map(|key| crypto::sign(key, data))
    }
}
