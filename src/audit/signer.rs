//! HMAC-SHA256 signing of canonical entry bytes.

use std::fmt;
use std::fmt::Write as _;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::InfraError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a generated key in bytes.
const GENERATED_KEY_LEN: usize = 32;

/// Process-wide signing key.
#[derive(Clone)]
pub struct Signer {
    mac: HmacSha256,
    generated: bool,
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("generated", &self.generated)
            .finish_non_exhaustive()
    }
}

impl Signer {
    /// Uses `key` when set, otherwise generates a random key.
    ///
    /// Entries signed with a generated key cannot be verified by another
    /// process.
    ///
    /// # Errors
    ///
    /// Returns [`InfraError::Configuration`] if the configured key is empty.
    pub fn new(key: Option<&str>) -> Result<Self, InfraError> {
        match key {
            Some("") => Err(InfraError::Configuration(
                "AUDIT_SIGNING_KEY must not be empty".to_string(),
            )),
            Some(key) => Self::from_bytes(key.as_bytes(), false),
            None => {
                let mut key = [0_u8; GENERATED_KEY_LEN];
                rand::rngs::OsRng.fill_bytes(&mut key);
                tracing::warn!("no audit signing key configured, generated an ephemeral key");
                Self::from_bytes(&key, true)
            }
        }
    }

    fn from_bytes(key: &[u8], generated: bool) -> Result<Self, InfraError> {
        let mac = HmacSha256::new_from_slice(key)
            .map_err(|e| InfraError::Configuration(format!("invalid audit signing key: {e}")))?;
        Ok(Self { mac, generated })
    }

    /// Returns `true` if the key was generated at startup.
    #[must_use]
    pub fn is_generated(&self) -> bool {
        self.generated
    }

    /// Hex HMAC of `bytes`.
    #[must_use]
    pub fn sign(&self, bytes: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(bytes);
        let digest = mac.finalize().into_bytes();
        let mut hex = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    /// Constant-time check of `signature_hex` against `bytes`.
    #[must_use]
    pub fn verify(&self, bytes: &[u8], signature_hex: &str) -> bool {
        let Some(expected) = hex_decode(signature_hex) else {
            return false;
        };
        let mut mac = self.mac.clone();
        mac.update(bytes);
        mac.verify_slice(&expected).is_ok()
    }
}

fn hex_decode(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic_per_key() {
        let Ok(a) = Signer::new(Some("k1")) else {
            panic!("signer failed");
        };
        let Ok(b) = Signer::new(Some("k1")) else {
            panic!("signer failed");
        };
        let Ok(c) = Signer::new(Some("k2")) else {
            panic!("signer failed");
        };
        let sig = a.sign(b"payload");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, b.sign(b"payload"));
        assert_ne!(sig, c.sign(b"payload"));
        assert!(b.verify(b"payload", &sig));
        assert!(!c.verify(b"payload", &sig));
    }

    #[test]
    fn tampered_bytes_or_signature_fail() {
        let Ok(signer) = Signer::new(Some("secret")) else {
            panic!("signer failed");
        };
        let sig = signer.sign(b"{\"attempts\":6}");
        assert!(!signer.verify(b"{\"attempts\":7}", &sig));
        assert!(!signer.verify(b"{\"attempts\":6}", "zz"));
        let truncated: String = sig.chars().take(10).collect();
        assert!(!signer.verify(b"{\"attempts\":6}", &truncated));
    }

    #[test]
    fn generated_keys_differ() {
        let (Ok(a), Ok(b)) = (Signer::new(None), Signer::new(None)) else {
            panic!("signer failed");
        };
        assert!(a.is_generated());
        assert_ne!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn empty_key_is_rejected() {
        let Err(err) = Signer::new(Some("")) else {
            panic!("empty key accepted");
        };
        assert!(err.is_fatal());
    }
}
