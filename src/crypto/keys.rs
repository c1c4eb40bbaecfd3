//! Time-sliced key derivation.
//!
//! Key scheme:
//!
//! ```text
//! Key-Nonce = LE-48(unix time in ms)          lower 48 bits, little-endian
//! Key-ID    = hex(Key-Nonce)
//! Key-Value = HKDF-SHA1(salt = Secret, IKM = Key-Nonce, info = "", L = 32)
//! ```
//!
//! Any process holding the same [`Secret`] derives the same key for a given
//! id, so nothing has to be stored or shared besides the secret itself.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, SessionError};

/// Size of the derived symmetric key in bytes.
pub const KEY_SIZE: usize = 256 / 8;
/// Size of the time nonce used as HKDF input key material.
pub const IKM_SIZE: usize = 48 / 8;
/// Size of a generated secret (one SHA-1 block output).
pub const GENERATED_SECRET_SIZE: usize = 160 / 8;

/// Root secret of all key derivation.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(Vec<u8>);

impl Secret {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Decode a base64 secret; strings that are not valid base64 are used
    /// as raw bytes.
    pub fn from_base64_or_raw(value: &str) -> Self {
        match STANDARD.decode(value.trim()) {
            Ok(bytes) if !bytes.is_empty() => Self(bytes),
            _ => Self(value.as_bytes().to_vec()),
        }
    }

    /// Fresh random secret. Sessions issued under it do not survive a restart.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; GENERATED_SECRET_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secret").field("len", &self.0.len()).finish_non_exhaustive()
    }
}

/// A derived key together with the id it was derived from.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyDescriptor {
    /// Hex encoding of the 48-bit key nonce
    pub id: String,
    /// Derived key bytes
    pub value: [u8; KEY_SIZE],
    /// Issue time in epoch milliseconds, 0 when only the id was known
    pub seq: u64,
}

impl std::fmt::Debug for KeyDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDescriptor")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .finish_non_exhaustive()
    }
}

impl Drop for KeyDescriptor {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}

/// Source of session keys.
///
/// Implementations must be deterministic in `id`: the key returned by
/// `key_by_id` for an id previously produced by `current_key` has to be the
/// same key.
#[async_trait]
pub trait KeyManager: Send + Sync {
    /// Key for the current epoch, used for every newly issued cookie.
    async fn current_key(&self) -> Result<KeyDescriptor>;

    /// Reconstruct the key a cookie was issued under.
    async fn key_by_id(&self, id: &str) -> Result<KeyDescriptor>;
}

/// Default [`KeyManager`] deriving keys with HKDF-SHA1 from a [`Secret`].
#[derive(Debug, Clone)]
pub struct HkdfKeyManager {
    secret: Secret,
}

impl HkdfKeyManager {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }

    /// Key for the epoch starting at `timestamp_ms`.
    pub fn key_at(&self, timestamp_ms: u64) -> Result<KeyDescriptor> {
        let ikm = nonce_from_timestamp(timestamp_ms);
        Ok(KeyDescriptor {
            id: hex::encode(ikm),
            value: derive_key(self.secret.as_bytes(), &ikm)?,
            seq: timestamp_ms,
        })
    }
}

#[async_trait]
impl KeyManager for HkdfKeyManager {
    async fn current_key(&self) -> Result<KeyDescriptor> {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let key = self.key_at(now)?;
        tracing::debug!(key_id = %key.id, "derived current session key");
        Ok(key)
    }

    async fn key_by_id(&self, id: &str) -> Result<KeyDescriptor> {
        let ikm = parse_key_id(id)?;
        Ok(KeyDescriptor {
            id: id.to_ascii_lowercase(),
            value: derive_key(self.secret.as_bytes(), &ikm)?,
            seq: 0,
        })
    }
}

/// Lower 48 bits of the timestamp, least significant byte first.
pub fn nonce_from_timestamp(timestamp_ms: u64) -> [u8; IKM_SIZE] {
    let mut ikm = [0u8; IKM_SIZE];
    ikm.copy_from_slice(&timestamp_ms.to_le_bytes()[..IKM_SIZE]);
    ikm
}

/// Inverse of [`nonce_from_timestamp`] for timestamps below 2^48.
pub fn timestamp_from_nonce(ikm: &[u8; IKM_SIZE]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[..IKM_SIZE].copy_from_slice(ikm);
    u64::from_le_bytes(bytes)
}

/// Decode a key id back into its nonce.
pub fn parse_key_id(id: &str) -> Result<[u8; IKM_SIZE]> {
    if id.len() != IKM_SIZE * 2 {
        return Err(SessionError::InvalidKeyId(format!(
            "expected {} hex characters, got {}",
            IKM_SIZE * 2,
            id.len()
        )));
    }

    let mut ikm = [0u8; IKM_SIZE];
    hex::decode_to_slice(id, &mut ikm)
        .map_err(|e| SessionError::InvalidKeyId(format!("{id}: {e}")))?;
    Ok(ikm)
}

fn derive_key(secret: &[u8], ikm: &[u8]) -> Result<[u8; KEY_SIZE]> {
    let hk = Hkdf::<Sha1>::new(Some(secret), ikm);
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(&[], &mut okm)
        .map_err(|e| SessionError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn manager() -> HkdfKeyManager {
        HkdfKeyManager::new(Secret::from_bytes(b"correct horse battery staple".to_vec()))
    }

    #[test]
    fn test_nonce_is_little_endian_48_bit() {
        let ikm = nonce_from_timestamp(0x0000_0102_0304_0506);
        assert_eq!(ikm, [0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(hex::encode(ikm), "060504030201");

        // Bits above 48 are dropped
        assert_eq!(nonce_from_timestamp(0xFFFF_0000_0000_0001), [1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_hkdf_matches_rfc5869_sha1_vector() {
        // RFC 5869 test case 4 with empty info, truncated to 32 bytes
        let ikm = hex::decode("0b0b0b0b0b0b0b0b0b0b0b").unwrap();
        let salt = hex::decode("000102030405060708090a0b0c").unwrap();
        let hk = Hkdf::<Sha1>::new(Some(&salt), &ikm);
        let mut full = [0u8; 42];
        hk.expand(&hex::decode("f0f1f2f3f4f5f6f7f8f9").unwrap(), &mut full).unwrap();
        assert_eq!(
            hex::encode(full),
            "085a01ea1b10f36933068b56efa5ad81a4f14b822f5b091568a9cdd4f155fda2c22e422478d305f3f896"
        );

    }

    #[test]
    fn test_derived_key_is_pinned() {
        // salt = secret, IKM = LE-48 nonce, empty info, L = 32
        let key = manager().key_at(1_700_000_000_000).unwrap();
        assert_eq!(key.id, "0068e5cf8b01");
        assert_eq!(
            hex::encode(key.value),
            "bb4043b5a236fce44130de0c25cbeec1b34eea55b44f19940b8e1bd2314a27a7"
        );
        assert_eq!(key.seq, 1_700_000_000_000);
    }

    #[tokio::test]
    async fn test_current_key_round_trips_through_id() {
        let keys = manager();
        let current = keys.current_key().await.unwrap();
        assert_eq!(current.id.len(), IKM_SIZE * 2);
        assert!(current.seq > 0);

        let restored = keys.key_by_id(&current.id).await.unwrap();
        assert_eq!(restored.id, current.id);
        assert_eq!(restored.value, current.value);
        assert_eq!(restored.seq, 0);
    }

    #[tokio::test]
    async fn test_different_secrets_derive_different_keys() {
        let a = manager().key_at(1_700_000_000_000).unwrap();
        let b = HkdfKeyManager::new(Secret::from_bytes(b"another secret".to_vec()))
            .key_at(1_700_000_000_000)
            .unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.value, b.value);
    }

    #[tokio::test]
    async fn test_key_by_id_rejects_bad_ids() {
        let keys = manager();
        assert!(matches!(
            keys.key_by_id("abcd").await,
            Err(SessionError::InvalidKeyId(_))
        ));
        assert!(matches!(
            keys.key_by_id("zzzzzzzzzzzz").await,
            Err(SessionError::InvalidKeyId(_))
        ));
    }

    #[test]
    fn test_secret_from_base64_or_raw() {
        assert_eq!(Secret::from_base64_or_raw("c2VjcmV0").as_bytes(), b"secret");
        assert_eq!(Secret::from_base64_or_raw("not base64!").as_bytes(), b"not base64!");
        assert_eq!(Secret::generate().as_bytes().len(), GENERATED_SECRET_SIZE);
        assert!(!format!("{:?}", Secret::from_bytes(b"hidden".to_vec())).contains("hidden"));
    }

    proptest! {
        #[test]
        fn prop_key_id_recovers_timestamp(ts in 0u64..(1u64 << 48)) {
            let key = manager().key_at(ts).unwrap();
            let ikm = parse_key_id(&key.id).unwrap();
            prop_assert_eq!(timestamp_from_nonce(&ikm), ts);
        }
    }
}
