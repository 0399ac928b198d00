//! Signing key loading and request signing.
//!
//! Operators hand us key material in whatever shape their tooling exported:
//! the registry's canonical base64 (scheme flag byte + 32-byte seed), a JSON
//! byte array, bare base64, or hex. Decoding tries those in that order and
//! takes the first match.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signer as _, SigningKey, SECRET_KEY_LENGTH};
use thiserror::Error;

/// Scheme flag the registry prepends to ed25519 seeds in its canonical
/// key export.
const ED25519_FLAG: u8 = 0x00;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("unrecognized signing key material")]
    UnrecognizedKeyMaterial,
    #[error("unsupported key scheme flag {0:#04x}")]
    UnsupportedScheme(u8),
}

pub struct SuiSigner {
    key: SigningKey,
}

impl SuiSigner {
    /// Decode `secret` into a signing key. Precedence: canonical flagged
    /// base64, JSON array, bare base64, hex.
    pub fn from_secret(secret: &str) -> Result<Self, SignerError> {
        let secret = secret.trim();

        if let Ok(bytes) = BASE64.decode(secret) {
            if bytes.len() == SECRET_KEY_LENGTH + 1 {
                if bytes[0] != ED25519_FLAG {
                    return Err(SignerError::UnsupportedScheme(bytes[0]));
                }
                return Ok(Self::from_seed(&bytes[1..]));
            }
        }

        if let Ok(bytes) = serde_json::from_str::<Vec<u8>>(secret) {
            match bytes.len() {
                SECRET_KEY_LENGTH => return Ok(Self::from_seed(&bytes)),
                n if n == SECRET_KEY_LENGTH + 1 && bytes[0] == ED25519_FLAG => {
                    return Ok(Self::from_seed(&bytes[1..]))
                }
                _ => {}
            }
        }

        if let Ok(bytes) = BASE64.decode(secret) {
            if bytes.len() == SECRET_KEY_LENGTH {
                return Ok(Self::from_seed(&bytes));
            }
        }

        let hex_str = secret.strip_prefix("0x").unwrap_or(secret);
        if let Ok(bytes) = hex::decode(hex_str) {
            if bytes.len() == SECRET_KEY_LENGTH {
                return Ok(Self::from_seed(&bytes));
            }
        }

        Err(SignerError::UnrecognizedKeyMaterial)
    }

    fn from_seed(seed: &[u8]) -> Self {
        let mut buf = [0u8; SECRET_KEY_LENGTH];
        buf.copy_from_slice(seed);
        Self {
            key: SigningKey::from_bytes(&buf),
        }
    }

    /// Hex address derived from the verifying key.
    pub fn address(&self) -> String {
        format!("0x{}", hex::encode(self.key.verifying_key().as_bytes()))
    }

    pub fn public_key_base64(&self) -> String {
        BASE64.encode(self.key.verifying_key().as_bytes())
    }

    /// Detached signature over `message`, base64 with the scheme flag.
    pub fn sign_base64(&self, message: &[u8]) -> String {
        let sig = self.key.sign(message);
        let mut out = Vec::with_capacity(1 + sig.to_bytes().len());
        out.push(ED25519_FLAG);
        out.extend_from_slice(&sig.to_bytes());
        BASE64.encode(out)
    }
}
