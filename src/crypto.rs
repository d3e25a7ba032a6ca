use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use bip39::{Language, Mnemonic};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;

use crate::account::AccountId;
use crate::storage::{Storage, StorageError};

const PBKDF2_ROUNDS: u32 = 100_000;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

pub const ENCRYPTED_KEYS: &str = "mnemonicsEncrypted";

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid mnemonic: {0}")]
    InvalidMnemonic(String),
    #[error("Invalid password")]
    InvalidPassword,
    #[error("No key material stored for account {0}")]
    MissingKey(String),
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Malformed key material: {0}")]
    Malformed(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Anything able to produce detached ed25519 signatures for the privileged context.
pub trait MessageSigner: Send + Sync {
    fn public_key(&self) -> [u8; 32];
    fn sign_message(&self, message: &[u8]) -> [u8; 64];
}

pub struct KeyPair {
    pub signing_key: SigningKey,
}

impl KeyPair {
    /// Generate a new Ed25519 keypair
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        KeyPair {
            signing_key: SigningKey::generate(&mut csprng),
        }
    }

    pub fn from_secret(secret: &[u8; 32]) -> Self {
        KeyPair {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Generate a new 24-word mnemonic
    pub fn generate_mnemonic() -> Result<String, KeyError> {
        let mut entropy = [0u8; 32];
        OsRng.fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy_in(Language::English, &entropy)
            .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        Ok(mnemonic.to_string())
    }

    /// Restore keypair from mnemonic
    pub fn from_mnemonic(phrase: &str) -> Result<Self, KeyError> {
        let mnemonic = Mnemonic::parse_in_normalized(Language::English, phrase)
            .map_err(|e| KeyError::InvalidMnemonic(e.to_string()))?;
        let seed = mnemonic.to_seed("");

        // First 32 bytes of the BIP-39 seed are the ed25519 secret
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&seed[0..32]);
        Ok(Self::from_secret(&secret))
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    pub fn sign_hex(&self, message: &[u8]) -> String {
        hex::encode(self.sign(message).to_bytes())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_bytes())
    }
}

impl MessageSigner for KeyPair {
    fn public_key(&self) -> [u8; 32] {
        self.verifying_key().to_bytes()
    }

    fn sign_message(&self, message: &[u8]) -> [u8; 64] {
        self.sign(message).to_bytes()
    }
}

/// Verify a detached signature against a hex encoded public key.
pub fn verify_with_pubkey_hex(message: &[u8], signature: &[u8], pubkey_hex: &str) -> bool {
    let Ok(pk_bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(pk_bytes) = <[u8; 32]>::try_from(pk_bytes.as_slice()) else {
        return false;
    };
    let (Ok(pubkey), Ok(signature)) = (
        VerifyingKey::from_bytes(&pk_bytes),
        Signature::from_slice(signature),
    ) else {
        return false;
    };
    pubkey.verify(message, &signature).is_ok()
}

fn derive_encryption_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut key = [0u8; 32]; // AES-256
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
    key
}

/// Encrypt `data` with a password derived key; output is `nonce || ciphertext`.
pub fn encrypt_data(data: &[u8], password: &str, salt: &[u8]) -> Result<Vec<u8>, KeyError> {
    let key = derive_encryption_key(password, salt);
    let cipher = Aes256Gcm::new(&key.into());

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, data)
        .map_err(|_| KeyError::EncryptionFailed)?;

    let mut blob = nonce_bytes.to_vec();
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

pub fn decrypt_data(encrypted: &[u8], password: &str, salt: &[u8]) -> Result<Vec<u8>, KeyError> {
    if encrypted.len() < NONCE_LEN {
        return Err(KeyError::Malformed("blob shorter than nonce".to_string()));
    }

    let key = derive_encryption_key(password, salt);
    let cipher = Aes256Gcm::new(&key.into());
    let nonce = Nonce::from_slice(&encrypted[..NONCE_LEN]);

    cipher
        .decrypt(nonce, &encrypted[NONCE_LEN..])
        .map_err(|_| KeyError::InvalidPassword)
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct EncryptedSecret {
    salt: String,
    blob: String,
}

/// Password protected secrets, one per software account.
#[derive(Clone)]
pub struct KeyVault {
    storage: Arc<dyn Storage>,
    // Guards the read-modify-write of the shared encrypted-keys map
    write_lock: Arc<Mutex<()>>,
}

impl KeyVault {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self, account_id: &AccountId, key_pair: &KeyPair, password: &str) -> Result<(), KeyError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let blob = encrypt_data(&key_pair.secret_bytes(), password, &salt)?;

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: HashMap<String, EncryptedSecret> =
            self.storage.get(ENCRYPTED_KEYS)?.unwrap_or_default();
        all.insert(
            account_id.to_string(),
            EncryptedSecret {
                salt: hex::encode(salt),
                blob: hex::encode(blob),
            },
        );
        self.storage.set(ENCRYPTED_KEYS, &all)?;
        Ok(())
    }

    pub fn fetch_key_pair(&self, account_id: &AccountId, password: &str) -> Result<KeyPair, KeyError> {
        let all: HashMap<String, EncryptedSecret> =
            self.storage.get(ENCRYPTED_KEYS)?.unwrap_or_default();
        let entry = all
            .get(&account_id.to_string())
            .ok_or_else(|| KeyError::MissingKey(account_id.to_string()))?;

        let salt = hex::decode(&entry.salt).map_err(|e| KeyError::Malformed(e.to_string()))?;
        let blob = hex::decode(&entry.blob).map_err(|e| KeyError::Malformed(e.to_string()))?;
        let secret = decrypt_data(&blob, password, &salt)?;
        let secret: [u8; 32] = secret
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Malformed("secret is not 32 bytes".to_string()))?;

        Ok(KeyPair::from_secret(&secret))
    }

    pub fn remove(&self, account_id: &AccountId) -> Result<(), KeyError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut all: HashMap<String, EncryptedSecret> =
            self.storage.get(ENCRYPTED_KEYS)?.unwrap_or_default();
        if all.remove(&account_id.to_string()).is_some() {
            self.storage.set(ENCRYPTED_KEYS, &all)?;
        }
        Ok(())
    }
}
