//! Cryptographic building blocks of the session cookie: key derivation and
//! envelope encryption.

pub mod cipher;
pub mod keys;

pub use cipher::{AesCbcCodec, Cipher, Decipher, IV_SIZE};
pub use keys::{HkdfKeyManager, KeyDescriptor, KeyManager, Secret, KEY_SIZE};
