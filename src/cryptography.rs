use std::fmt;

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

pub use chacha20poly1305::aead::Error as AeadError;

use crate::{KEY_SIZE, NONCE_SIZE};

const KEY_CONTEXT: &[u8] = b"linkdrop-chunk-encryption";

/// Kind byte mixed into the associated data of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Header = 0,
    Data = 1,
}

/// Symmetric key both peers derive from the network credential.
///
/// Lives only in memory and is wiped when dropped.
#[derive(Clone)]
pub struct DerivedKey([u8; KEY_SIZE]);

impl DerivedKey {
    /// Hash the human-readable credential and expand it into a chunk key.
    pub fn from_credential(credential: &str) -> Self {
        let digest = Sha256::digest(credential.as_bytes());

        let hkdf = Hkdf::<Sha256>::new(None, digest.as_slice());
        let mut key = [0u8; KEY_SIZE];
        hkdf.expand(KEY_CONTEXT, &mut key)
            .expect("32 bytes is a valid length for HKDF");

        DerivedKey(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        DerivedKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(<redacted>)")
    }
}

/// Associated data binding a frame to its position in the session.
pub fn frame_aad(kind: FrameKind, file_index: u64, chunk_index: u64) -> [u8; 17] {
    let mut aad = [0u8; 17];
    aad[0] = kind as u8;
    aad[1..9].copy_from_slice(&file_index.to_be_bytes());
    aad[9..].copy_from_slice(&chunk_index.to_be_bytes());
    aad
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let mut bytes = [0u8; NONCE_SIZE];
    bytes.copy_from_slice(&nonce);
    bytes
}

pub fn encrypt_chunk(
    key: &DerivedKey,
    chunk: &[u8],
    nonce_bytes: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(nonce_bytes);

    // Ciphertext comes back with the 16-byte tag appended.
    cipher.encrypt(nonce, Payload { msg: chunk, aad })
}

pub fn decrypt_chunk(
    key: &DerivedKey,
    encrypted_chunk: &[u8],
    nonce_bytes: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = Nonce::from_slice(nonce_bytes);

    // Fails on a bad tag, so tampered bytes never reach the caller.
    cipher.decrypt(
        nonce,
        Payload {
            msg: encrypted_chunk,
            aad,
        },
    )
}
