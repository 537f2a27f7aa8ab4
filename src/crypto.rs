use crate::error::BridgeError;
use aes_gcm::aead::{Aead, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, KeyInit, Nonce};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const NONCE_LEN: usize = 12;

/// AES-256-GCM cipher for upstream key material at rest.
///
/// Ciphertext layout is `nonce || ciphertext`, base64-encoded, so a single
/// column holds everything needed for decryption.
#[derive(Clone)]
pub struct KeyCipher {
    key: Key<Aes256Gcm>,
}

impl KeyCipher {
    /// Build a cipher from `KEY_ENCRYPTION_SECRET`. The secret must resolve
    /// to exactly 32 bytes; 64-char hex, base64, and raw 32-byte strings are
    /// all accepted.
    pub fn from_secret(secret: &str) -> Result<Self, BridgeError> {
        let bytes = decode_secret(secret)?;
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&bytes),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, BridgeError> {
        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ct = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| BridgeError::Internal("key encryption failed".into()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String, BridgeError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|_| BridgeError::Internal("stored key material is not base64".into()))?;
        if raw.len() <= NONCE_LEN {
            return Err(BridgeError::Internal("stored key material truncated".into()));
        }
        let (nonce, ct) = raw.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(&self.key);
        let pt = cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| BridgeError::Internal("key decryption failed".into()))?;
        String::from_utf8(pt)
            .map_err(|_| BridgeError::Internal("decrypted key is not utf-8".into()))
    }
}

fn decode_secret(secret: &str) -> Result<[u8; 32], BridgeError> {
    let secret = secret.trim();
    let candidate: Option<Vec<u8>> = if secret.len() == 64 {
        hex::decode(secret).ok()
    } else {
        None
    };
    let candidate = candidate
        .or_else(|| {
            base64::engine::general_purpose::STANDARD
                .decode(secret)
                .ok()
                .filter(|b| b.len() == 32)
        })
        .or_else(|| (secret.len() == 32).then(|| secret.as_bytes().to_vec()));

    match candidate {
        Some(bytes) if bytes.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            Ok(out)
        }
        _ => Err(BridgeError::Internal(
            "KEY_ENCRYPTION_SECRET must decode to 32 bytes (hex, base64, or raw)".into(),
        )),
    }
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Lowercase hex HMAC-SHA256 digest.
pub fn hmac_sha256_hex(secret: &str, data: &str) -> String {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time equality over byte strings. Length mismatch returns false
/// without a data-dependent early exit inside the comparison itself.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_key_material() {
        let cipher = KeyCipher::from_secret(&"a".repeat(32)).unwrap();
        let ct = cipher.encrypt("tvly-secret-key").unwrap();
        assert_ne!(ct, "tvly-secret-key");
        assert_eq!(cipher.decrypt(&ct).unwrap(), "tvly-secret-key");
    }

    #[test]
    fn distinct_nonces_per_encryption() {
        let cipher = KeyCipher::from_secret(&"b".repeat(32)).unwrap();
        let a = cipher.encrypt("same").unwrap();
        let b = cipher.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(cipher.decrypt(&a).unwrap(), cipher.decrypt(&b).unwrap());
    }

    #[test]
    fn accepts_hex_and_base64_secrets() {
        let raw = [7u8; 32];
        let hex_secret = hex::encode(raw);
        let b64_secret = base64::engine::general_purpose::STANDARD.encode(raw);
        let c1 = KeyCipher::from_secret(&hex_secret).unwrap();
        let c2 = KeyCipher::from_secret(&b64_secret).unwrap();
        let ct = c1.encrypt("x").unwrap();
        assert_eq!(c2.decrypt(&ct).unwrap(), "x");
    }

    #[test]
    fn rejects_short_secret() {
        assert!(KeyCipher::from_secret("too-short").is_err());
    }

    #[test]
    fn hashes_are_stable() {
        assert_eq!(sha256_hex("abc").len(), 64);
        assert_eq!(sha256_hex("abc"), sha256_hex("abc"));
        assert_ne!(
            hmac_sha256_hex("k1", "abc"),
            hmac_sha256_hex("k2", "abc")
        );
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"same-secret", b"same-secret"));
        assert!(!constant_time_eq(b"same-secret", b"same-secreT"));
        assert!(!constant_time_eq(b"short", b"longer"));
    }
}
