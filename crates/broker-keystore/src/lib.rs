// broker-keystore: generates, persists, and uses the long-lived P-256 key
// pair used for request signing and device identity.
//
// The private key never leaves this crate in non-PEM form; callers only see
// PEM strings, base64 signatures, and base64 public-key points.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{SecondsFormat, Utc};
use ecdsa::signature::hazmat::PrehashSigner;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("key generation failed: {0}")]
    Generation(String),
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored key material is malformed: {0}")]
    Malformed(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

pub type KeyStoreResult<T> = Result<T, KeyStoreError>;

// ---------------------------------------------------------------------------
// KeyPair
// ---------------------------------------------------------------------------

/// A NIST P-256 key pair, held as PKCS#8 / SubjectPublicKeyInfo PEM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(rename = "privateKeyPem")]
    pub private_key_pem: String,
    #[serde(rename = "publicKeyPem")]
    pub public_key_pem: String,
}

impl KeyPair {
    /// Generate a fresh P-256 key pair.
    pub fn generate() -> KeyStoreResult<Self> {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        let private_key_pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyStoreError::Generation(e.to_string()))?
            .to_string();
        let public_key_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyStoreError::Generation(e.to_string()))?;
        Ok(Self {
            private_key_pem,
            public_key_pem,
        })
    }

    fn signing_key(&self) -> KeyStoreResult<SigningKey> {
        SigningKey::from_pkcs8_pem(&self.private_key_pem)
            .map_err(|e| KeyStoreError::Malformed(format!("private key: {e}")))
    }

    fn verifying_key(&self) -> KeyStoreResult<VerifyingKey> {
        VerifyingKey::from_public_key_pem(&self.public_key_pem)
            .map_err(|e| KeyStoreError::Malformed(format!("public key: {e}")))
    }

    /// Sign a UTF-8 message with ECDSA-SHA512, returning the raw `r || s`
    /// signature, base64-encoded.
    ///
    /// SHA-512's 64-byte output is wider than P-256's 32-byte field, so this
    /// goes through the prehash signing path rather than `DigestSigner`:
    /// the digest is computed up front and FIPS-186's `bits2field` leftmost-
    /// bits truncation is applied when the signature is derived from it.
    pub fn sign(&self, message: &str) -> KeyStoreResult<String> {
        let signing_key = self.signing_key()?;
        let digest = Sha512::digest(message.as_bytes());
        let signature: p256::ecdsa::Signature = signing_key
            .sign_prehash(&digest)
            .map_err(|e| KeyStoreError::Signing(e.to_string()))?;
        Ok(BASE64.encode(signature.to_bytes()))
    }

    /// Build a signed envelope `{timestamp, data, signature}` where the
    /// signed bytes are the JSON serialization of `{timestamp, data}` (in
    /// that field order).
    pub fn signed_envelope(&self, data: serde_json::Value) -> KeyStoreResult<SignedEnvelope> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let to_sign = EnvelopeContent {
            timestamp: &timestamp,
            data: &data,
        };
        let signed_bytes = serde_json::to_string(&to_sign)
            .map_err(|e| KeyStoreError::Signing(format!("serializing envelope: {e}")))?;
        let signature = self.sign(&signed_bytes)?;
        Ok(SignedEnvelope {
            timestamp,
            data,
            signature,
        })
    }

    /// The raw uncompressed EC point (65 bytes, `0x04`-prefixed),
    /// base64-encoded.
    ///
    /// Derived by taking the last 65 bytes of the public key's DER SPKI
    /// encoding, per spec: implementations that only have the DER bytes (not
    /// a parsed key object) can use the same slicing rule.
    pub fn public_key_point_base64(&self) -> KeyStoreResult<String> {
        let verifying_key = self.verifying_key()?;
        let der = verifying_key
            .to_public_key_der()
            .map_err(|e| KeyStoreError::Malformed(format!("public key DER: {e}")))?;
        let der_bytes = der.as_bytes();
        if der_bytes.len() < 65 {
            return Err(KeyStoreError::Malformed(
                "SPKI DER encoding shorter than 65 bytes".to_owned(),
            ));
        }
        let point = &der_bytes[der_bytes.len() - 65..];
        if point[0] != 0x04 {
            return Err(KeyStoreError::Malformed(
                "expected uncompressed EC point (0x04 prefix)".to_owned(),
            ));
        }
        Ok(BASE64.encode(point))
    }
}

#[derive(Serialize)]
struct EnvelopeContent<'a> {
    timestamp: &'a str,
    data: &'a serde_json::Value,
}

/// A signed envelope ready to attach to an outbound request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub timestamp: String,
    pub data: serde_json::Value,
    pub signature: String,
}

// ---------------------------------------------------------------------------
// KeyStore (persistence)
// ---------------------------------------------------------------------------

/// Persists a [`KeyPair`] to `<config-dir>/keys.json`, creating the
/// directory recursively if absent, and restricting the file to owner
/// read/write on Unix.
pub struct KeyStore {
    config_dir: PathBuf,
}

impl KeyStore {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// `~/.trade-republic-mcp`, falling back to the current directory if the
    /// home directory cannot be resolved.
    pub fn default_config_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".trade-republic-mcp")
    }

    pub fn with_default_dir() -> Self {
        Self::new(Self::default_config_dir())
    }

    pub fn keys_path(&self) -> PathBuf {
        self.config_dir.join("keys.json")
    }

    pub fn has_key_pair(&self) -> bool {
        self.keys_path().exists()
    }

    /// Load the stored key pair, if any.
    pub fn load(&self) -> KeyStoreResult<Option<KeyPair>> {
        let path = self.keys_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(|source| KeyStoreError::Io {
            path: path.clone(),
            source,
        })?;
        let key_pair: KeyPair = serde_json::from_str(&contents)
            .map_err(|e| KeyStoreError::Malformed(format!("{}: {e}", path.display())))?;
        Ok(Some(key_pair))
    }

    /// Persist a key pair, creating the config directory if needed.
    pub fn save(&self, key_pair: &KeyPair) -> KeyStoreResult<()> {
        std::fs::create_dir_all(&self.config_dir).map_err(|source| KeyStoreError::Io {
            path: self.config_dir.clone(),
            source,
        })?;
        let path = self.keys_path();
        let json = serde_json::to_string_pretty(key_pair)
            .map_err(|e| KeyStoreError::Malformed(e.to_string()))?;
        std::fs::write(&path, json).map_err(|source| KeyStoreError::Io {
            path: path.clone(),
            source,
        })?;
        set_owner_rw(&path)?;
        tracing::info!(path = %path.display(), "key pair persisted");
        Ok(())
    }

    /// Load the stored key pair, generating and persisting a new one if
    /// absent.
    pub fn load_or_generate(&self) -> KeyStoreResult<KeyPair> {
        if let Some(key_pair) = self.load()? {
            return Ok(key_pair);
        }
        let key_pair = KeyPair::generate()?;
        self.save(&key_pair)?;
        Ok(key_pair)
    }

    /// Destroy the stored key pair. Idempotent if no key pair is stored.
    pub fn delete(&self) -> KeyStoreResult<()> {
        let path = self.keys_path();
        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "key pair deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(KeyStoreError::Io { path, source }),
        }
    }
}

#[cfg(unix)]
fn set_owner_rw(path: &Path) -> KeyStoreResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|source| {
        KeyStoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    })
}

#[cfg(not(unix))]
fn set_owner_rw(_path: &Path) -> KeyStoreResult<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_save_load_round_trips_byte_equal() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let generated = KeyPair::generate().unwrap();
        store.save(&generated).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(generated, loaded);
    }

    #[test]
    fn load_returns_none_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        assert!(store.load().unwrap().is_none());
        assert!(!store.has_key_pair());
    }

    #[test]
    fn load_or_generate_persists_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let first = store.load_or_generate().unwrap();
        let second = store.load_or_generate().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn malformed_stored_json_fails_with_keystore_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(store.keys_path(), "not json").unwrap();
        assert!(matches!(store.load(), Err(KeyStoreError::Malformed(_))));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.delete().unwrap();
        let kp = KeyPair::generate().unwrap();
        store.save(&kp).unwrap();
        store.delete().unwrap();
        assert!(!store.has_key_pair());
        store.delete().unwrap();
    }

    #[test]
    fn public_key_point_is_65_bytes_prefixed_with_0x04() {
        let kp = KeyPair::generate().unwrap();
        let b64 = kp.public_key_point_base64().unwrap();
        let bytes = BASE64.decode(b64).unwrap();
        assert_eq!(bytes.len(), 65);
        assert_eq!(bytes[0], 0x04);
    }

    #[test]
    fn signing_same_message_twice_both_verify() {
        let kp = KeyPair::generate().unwrap();
        let sig1 = kp.sign("hello").unwrap();
        let sig2 = kp.sign("hello").unwrap();
        // ECDSA is randomized: signatures may differ byte-for-byte...
        let verifying_key = kp.verifying_key().unwrap();
        for sig_b64 in [sig1, sig2] {
            let bytes = BASE64.decode(sig_b64).unwrap();
            let signature = p256::ecdsa::Signature::from_slice(&bytes).unwrap();
            use ecdsa::signature::hazmat::PrehashVerifier;
            let digest = Sha512::digest(b"hello");
            verifying_key.verify_prehash(&digest, &signature).unwrap();
        }
    }

    #[test]
    fn signatures_of_different_messages_differ() {
        let kp = KeyPair::generate().unwrap();
        let sig1 = kp.sign("hello").unwrap();
        let sig2 = kp.sign("world").unwrap();
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn signed_envelope_carries_timestamp_data_signature() {
        let kp = KeyPair::generate().unwrap();
        let envelope = kp.signed_envelope(serde_json::json!({"k": "v"})).unwrap();
        assert!(!envelope.timestamp.is_empty());
        assert_eq!(envelope.data, serde_json::json!({"k": "v"}));
        assert!(!envelope.signature.is_empty());
    }
}
