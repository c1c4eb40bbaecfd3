//! Cookie envelope encryption.
//!
//! ```text
//! IV          = random-128bit()
//! Ciphertext  = AES-256-CBC(Key, IV, Plaintext)
//! Transmitted = IV | Ciphertext
//! ```
//!
//! There is no authentication tag. A tampered envelope either fails
//! unpadding or yields garbage that the document parser rejects.

use aes::Aes256;
use async_trait::async_trait;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};

use crate::error::{Result, SessionError};

pub const IV_SIZE: usize = 128 / 8;
const BLOCK_SIZE: usize = 16;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Encrypting half of a cookie codec.
#[async_trait]
pub trait Cipher: Send + Sync {
    async fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
}

/// Decrypting half of a cookie codec.
#[async_trait]
pub trait Decipher: Send + Sync {
    async fn decrypt(&self, key: &[u8], envelope: &[u8]) -> Result<Vec<u8>>;
}

/// AES-256-CBC with a random IV prepended to the ciphertext.
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCbcCodec;

impl AesCbcCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn seal(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        Self::seal_with_iv(key, &iv, plaintext)
    }

    fn seal_with_iv(key: &[u8], iv: &[u8; IV_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let encryptor = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| SessionError::Encryption(format!("invalid key: {e}")))?;
        let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut envelope = Vec::with_capacity(IV_SIZE + ciphertext.len());
        envelope.extend_from_slice(iv);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    pub fn open(key: &[u8], envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() < IV_SIZE + BLOCK_SIZE {
            return Err(SessionError::Decryption(format!(
                "envelope too short: {} bytes",
                envelope.len()
            )));
        }

        let (iv, ciphertext) = envelope.split_at(IV_SIZE);
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(SessionError::Decryption(
                "ciphertext is not a whole number of blocks".to_string(),
            ));
        }

        let decryptor = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| SessionError::Decryption(format!("invalid key: {e}")))?;
        decryptor
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| SessionError::Decryption("bad padding".to_string()))
    }
}

#[async_trait]
impl Cipher for AesCbcCodec {
    async fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        Self::seal(key, plaintext)
    }
}

#[async_trait]
impl Decipher for AesCbcCodec {
    async fn decrypt(&self, key: &[u8], envelope: &[u8]) -> Result<Vec<u8>> {
        Self::open(key, envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 32] = [7u8; 32];

    #[tokio::test]
    async fn test_encrypt_decrypt() {
        let codec = AesCbcCodec::new();
        let envelope = codec.encrypt(&KEY, b"{\"user\":\"alice\"}").await.unwrap();
        assert_eq!((envelope.len() - IV_SIZE) % BLOCK_SIZE, 0);

        let plaintext = codec.decrypt(&KEY, &envelope).await.unwrap();
        assert_eq!(plaintext, b"{\"user\":\"alice\"}");
    }

    #[test]
    fn test_fresh_iv_per_encryption() {
        let a = AesCbcCodec::seal(&KEY, b"same").unwrap();
        let b = AesCbcCodec::seal(&KEY, b"same").unwrap();
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_known_answer() {
        // NIST SP 800-38A F.2.5 CBC-AES256.Encrypt, first block
        let key = hex::decode("603deb1015ca71be2b73aef0857d77811f352c073b6108d72d9810a30914dff4")
            .unwrap();
        let iv: [u8; IV_SIZE] = hex::decode("000102030405060708090a0b0c0d0e0f")
            .unwrap()
            .try_into()
            .unwrap();
        let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();

        let envelope = AesCbcCodec::seal_with_iv(&key, &iv, &plaintext).unwrap();
        assert_eq!(&envelope[..IV_SIZE], &iv);
        assert_eq!(
            hex::encode(&envelope[IV_SIZE..IV_SIZE + BLOCK_SIZE]),
            "f58c4c04d6e5f1ba779eabfb5f7bfbd6"
        );
    }

    #[test]
    fn test_short_envelope_is_rejected() {
        assert!(matches!(
            AesCbcCodec::open(&KEY, &[0u8; 10]),
            Err(SessionError::Decryption(_))
        ));
        assert!(matches!(
            AesCbcCodec::open(&KEY, &[0u8; IV_SIZE + 5]),
            Err(SessionError::Decryption(_))
        ));
    }

    #[test]
    fn test_wrong_key_length() {
        assert!(matches!(
            AesCbcCodec::seal(&[1u8; 16], b"data"),
            Err(SessionError::Encryption(_))
        ));
    }

    #[test]
    fn test_wrong_key_never_yields_plaintext() {
        let envelope = AesCbcCodec::seal(&KEY, b"attack at dawn").unwrap();
        match AesCbcCodec::open(&[9u8; 32], &envelope) {
            Ok(plaintext) => assert_ne!(plaintext, b"attack at dawn"),
            Err(err) => assert!(matches!(err, SessionError::Decryption(_))),
        }
    }

    proptest! {
        #[test]
        fn prop_open_inverts_seal(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let envelope = AesCbcCodec::seal(&KEY, &data).unwrap();
            prop_assert_eq!(AesCbcCodec::open(&KEY, &envelope).unwrap(), data);
        }

        #[test]
        fn prop_open_never_panics(data in proptest::collection::vec(any::<u8>(), 0..96)) {
            let _ = AesCbcCodec::open(&KEY, &data);
        }
    }
}
