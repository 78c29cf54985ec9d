//! At-rest transform for cached values.
//!
//! The cache serializes, transforms, then stores; reads run the inverse. The
//! production transform is AES-256-CBC keyed with process-random material, so
//! cached bytes are opaque in heap dumps but carry no cross-process
//! confidentiality. Tests swap in [`IdentityTransform`].

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::TejasError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Reversible byte transform applied between serialization and storage.
pub trait ValueTransform: Send + Sync {
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, TejasError>;
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, TejasError>;
}

/// AES-256-CBC with a key and IV drawn from the OS RNG at construction.
pub struct AesCbcTransform {
    key: [u8; 32],
    iv: [u8; 16],
}

impl AesCbcTransform {
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }
}

impl ValueTransform for AesCbcTransform {
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, TejasError> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| TejasError::Crypto(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plain))
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, TejasError> {
        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| TejasError::Crypto(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(stored)
            .map_err(|e| TejasError::Crypto(e.to_string()))
    }
}

/// Pass-through transform for tests and debugging.
pub struct IdentityTransform;

impl ValueTransform for IdentityTransform {
    fn encode(&self, plain: &[u8]) -> Result<Vec<u8>, TejasError> {
        Ok(plain.to_vec())
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, TejasError> {
        Ok(stored.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aes_round_trip() {
        let transform = AesCbcTransform::generate();
        let plain = b"the quick brown fox";
        let stored = transform.encode(plain).unwrap();
        assert_ne!(stored.as_slice(), plain.as_slice());
        assert_eq!(transform.decode(&stored).unwrap(), plain);
    }

    #[test]
    fn test_aes_round_trip_empty_and_block_sized() {
        let transform = AesCbcTransform::generate();
        for plain in [&b""[..], &[0u8; 16][..], &[7u8; 48][..]] {
            let stored = transform.encode(plain).unwrap();
            assert_eq!(transform.decode(&stored).unwrap(), plain);
        }
    }

    #[test]
    fn test_keys_differ_between_instances() {
        let a = AesCbcTransform::generate();
        let b = AesCbcTransform::generate();
        let stored = a.encode(b"payload").unwrap();
        // A different process key must not decode to the same plaintext.
        match b.decode(&stored) {
            Ok(other) => assert_ne!(other, b"payload"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_identity_transform() {
        let transform = IdentityTransform;
        let stored = transform.encode(b"abc").unwrap();
        assert_eq!(stored, b"abc");
        assert_eq!(transform.decode(&stored).unwrap(), b"abc");
    }
}
