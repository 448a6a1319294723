//! Secret encryption for the settings vault.
//!
//! Secrets are sealed with AES-256-GCM under a machine-local master key.
//! The secret's own key name is bound in as additional authenticated data,
//! so a ciphertext copied between rows fails to decrypt. Each encryption
//! uses a fresh 12-byte nonce prepended to the ciphertext.

use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Size of the master key in bytes (256-bit AES).
const MASTER_KEY_SIZE: usize = 32;
/// Size of the AES-GCM nonce in bytes.
const NONCE_SIZE: usize = 12;
/// Version byte for the current key file format.
const KEY_FILE_VERSION_V1: u8 = 0x01;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key file length: {0} bytes")]
    InvalidKeyFile(usize),
    #[error("unsupported key file version: 0x{0:02x}")]
    UnsupportedKeyVersion(u8),
    #[error("invalid ciphertext")]
    InvalidCiphertext,
    #[error("cipher init failed")]
    Cipher,
    #[error("decryption failed")]
    Decrypt,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Load the master key from disk, creating it on first use.
///
/// Key file format v1: `[0x01][32 bytes]` = 33 bytes, mode 0600.
/// Legacy 32-byte files are read transparently.
pub fn load_or_create_master_key(path: &Path) -> Result<[u8; MASTER_KEY_SIZE]> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }

    match std::fs::read(path) {
        Ok(raw) => parse_key_file(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut key = [0u8; MASTER_KEY_SIZE];
            OsRng.fill_bytes(&mut key);

            let mut versioned = Vec::with_capacity(1 + MASTER_KEY_SIZE);
            versioned.push(KEY_FILE_VERSION_V1);
            versioned.extend_from_slice(&key);

            let mut options = std::fs::OpenOptions::new();
            options.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            match options.open(path) {
                Ok(mut file) => {
                    file.write_all(&versioned)?;
                    Ok(key)
                }
                // Lost a create race; the winner's key is authoritative.
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    parse_key_file(&std::fs::read(path)?)
                }
                Err(e) => Err(e.into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Parse both legacy (32-byte) and versioned (33-byte) key files.
fn parse_key_file(raw: &[u8]) -> Result<[u8; MASTER_KEY_SIZE]> {
    let key_bytes = match raw.len() {
        MASTER_KEY_SIZE => raw,
        len if len == MASTER_KEY_SIZE + 1 => {
            if raw[0] != KEY_FILE_VERSION_V1 {
                return Err(CryptoError::UnsupportedKeyVersion(raw[0]));
            }
            &raw[1..]
        }
        len => return Err(CryptoError::InvalidKeyFile(len)),
    };

    let mut key = [0u8; MASTER_KEY_SIZE];
    key.copy_from_slice(key_bytes);
    Ok(key)
}

/// Encrypt a secret. Output layout: `nonce || ciphertext`.
pub fn encrypt(secret_name: &str, plaintext: &[u8], key: &[u8; MASTER_KEY_SIZE]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Cipher)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: secret_name.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Cipher)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a secret previously sealed with [`encrypt`] under the same name.
pub fn decrypt(secret_name: &str, data: &[u8], key: &[u8; MASTER_KEY_SIZE]) -> Result<Vec<u8>> {
    if data.len() <= NONCE_SIZE {
        return Err(CryptoError::InvalidCiphertext);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::Cipher)?;
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: secret_name.as_bytes(),
            },
        )
        .map_err(|_| CryptoError::Decrypt)
}
