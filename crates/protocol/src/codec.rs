// Payload codec: base64 text, optionally AES-256 encrypted in ECB mode.
// Plaintext is padded with newline bytes up to the cipher block size, so the
// padding disappears when the decrypted text is split into lines.

use std::path::Path;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::error::{ProtocolError, Result};
use crate::job::{Answer, Request};

/// Cipher block size in bytes
pub const BLOCK_SIZE: usize = 16;
/// Key length in bytes; shorter secrets are zero padded, longer ones truncated
pub const KEY_SIZE: usize = 32;

const PAD_BYTE: u8 = b'\n';

/// Fixed-size symmetric key derived from a configured secret
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Derive a key from a secret string
    pub fn from_secret(secret: &str) -> Self {
        let mut key = [0u8; KEY_SIZE];
        let bytes = secret.as_bytes();
        let len = bytes.len().min(KEY_SIZE);
        key[..len].copy_from_slice(&bytes[..len]);
        Self(key)
    }

    /// Read a key file; the trailing line break is not part of the key
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProtocolError::key(format!("cannot read {}: {}", path.display(), e)))?;
        let secret = content.trim_end_matches(['\r', '\n']);
        if secret.is_empty() {
            return Err(ProtocolError::key(format!("{} is empty", path.display())));
        }
        Ok(Self::from_secret(secret))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Encodes and decodes job payloads
///
/// Thread-safe and cheap to share behind an `Arc`.
#[derive(Clone)]
pub struct PayloadCodec {
    cipher: Option<Aes256>,
}

impl PayloadCodec {
    /// Codec that encrypts with the given key
    pub fn encrypted(key: &EncryptionKey) -> Self {
        Self {
            cipher: Some(Aes256::new(GenericArray::from_slice(key.as_bytes()))),
        }
    }

    /// Codec that only applies base64
    pub fn plain() -> Self {
        Self { cipher: None }
    }

    /// Build a codec from an optional key
    pub fn new(key: Option<&EncryptionKey>) -> Self {
        match key {
            Some(key) => Self::encrypted(key),
            None => Self::plain(),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt (when enabled) and base64 encode plaintext
    pub fn encode(&self, plaintext: &[u8]) -> String {
        match &self.cipher {
            Some(cipher) => {
                let mut data = plaintext.to_vec();
                let rem = data.len() % BLOCK_SIZE;
                if rem != 0 {
                    data.resize(data.len() + BLOCK_SIZE - rem, PAD_BYTE);
                }
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    cipher.encrypt_block(GenericArray::from_mut_slice(block));
                }
                BASE64.encode(data)
            }
            None => BASE64.encode(plaintext),
        }
    }

    /// Base64 decode and decrypt (when enabled) a payload
    pub fn decode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut data = BASE64.decode(payload.trim_ascii())?;
        match &self.cipher {
            Some(cipher) => {
                if data.len() % BLOCK_SIZE != 0 {
                    return Err(ProtocolError::BlockSize {
                        block: BLOCK_SIZE,
                        len: data.len(),
                    });
                }
                for block in data.chunks_exact_mut(BLOCK_SIZE) {
                    cipher.decrypt_block(GenericArray::from_mut_slice(block));
                }
                Ok(data)
            }
            None => Ok(data.trim_ascii().to_vec()),
        }
    }

    /// Decode an inbound job payload into a request
    pub fn decode_request(&self, payload: &[u8]) -> Result<Request> {
        let text = self.decode(payload)?;
        let mut request = Request::parse(&text)?;
        request.raw = payload.to_vec();
        Ok(request)
    }

    /// Encode an answer for the result queue
    pub fn encode_answer(&self, answer: &Answer) -> Vec<u8> {
        self.encode(answer.to_text().as_bytes()).into_bytes()
    }
}

impl std::fmt::Debug for PayloadCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCodec")
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}
