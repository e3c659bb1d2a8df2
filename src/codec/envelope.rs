//! One-shot AES-256-GCM "envelope" sealing (§4.B), used below the streaming
//! threshold unless a force-content-type sentinel overrides the choice.

use super::CodecError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Seal `plaintext` under `dek`, returning a fresh random 12-byte IV and the
/// ciphertext with the 16-byte authentication tag appended.
pub fn seal(dek: &[u8], plaintext: &[u8]) -> Result<([u8; NONCE_LEN], Vec<u8>), CodecError> {
    if dek.len() != 32 {
        return Err(CodecError::InvalidKeyLength(dek.len()));
    }
    let cipher = Aes256Gcm::new_from_slice(dek).map_err(|e| CodecError::Aead(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| CodecError::Aead(e.to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Open a GCM-sealed `ciphertext_and_tag` (ciphertext with the 16-byte tag
/// appended) under `dek` and `iv`. Returns [`CodecError::IntegrityError`] on
/// tag mismatch.
pub fn open(dek: &[u8], iv: &[u8], ciphertext_and_tag: &[u8]) -> Result<Vec<u8>, CodecError> {
    if dek.len() != 32 {
        return Err(CodecError::InvalidKeyLength(dek.len()));
    }
    if iv.len() != NONCE_LEN {
        return Err(CodecError::InvalidIvLength {
            expected: NONCE_LEN,
            actual: iv.len(),
        });
    }
    let cipher = Aes256Gcm::new_from_slice(dek).map_err(|e| CodecError::Aead(e.to_string()))?;
    let nonce = Nonce::from_slice(iv);

    cipher
        .decrypt(nonce, ciphertext_and_tag)
        .map_err(|_| CodecError::IntegrityError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let dek = vec![0xAB; 32];
        let plaintext = b"hello envelope encryption".to_vec();
        let (iv, sealed) = seal(&dek, &plaintext).unwrap();
        assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);
        let opened = open(&dek, &iv, &sealed).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn tamper_detected() {
        let dek = vec![0xCD; 32];
        let plaintext = b"integrity matters".to_vec();
        let (iv, mut sealed) = seal(&dek, &plaintext).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            open(&dek, &iv, &sealed),
            Err(CodecError::IntegrityError)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let dek = vec![0x01; 32];
        let other = vec![0x02; 32];
        let (iv, sealed) = seal(&dek, b"secret").unwrap();
        assert!(open(&other, &iv, &sealed).is_err());
    }

    #[test]
    fn rejects_short_key() {
        let dek = vec![0u8; 16];
        assert!(matches!(
            seal(&dek, b"x"),
            Err(CodecError::InvalidKeyLength(16))
        ));
    }
}
