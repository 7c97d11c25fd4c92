//! Trust and identity.
//!
//! The node's long-lived RSA keypair can be kept on disk as a PKCS#8 blob
//! encrypted with a password-derived AES-256-GCM key (layout:
//! `salt || nonce || ciphertext`). Trusted users live behind the small
//! `TrustStore` interface; the interactive accept/reject decision lives
//! behind `Operator`. The engine only consumes these interfaces.

use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use hmac::Hmac;
use pbkdf2::pbkdf2;
use rand_core::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use zeroize::Zeroize;

use crate::error::{NetError, Result};

const PBKDF2_ROUNDS: u32 = 100_000;
const RSA_BITS: usize = 2048;

/// A user identity the local operator has accepted (or is being asked to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedUser {
    pub name: String,
    pub key: Vec<u8>,
    pub iv: Vec<u8>,
}

/// Interface to the user database. The engine never persists anything
/// itself; it only looks identities up and records operator decisions.
pub trait TrustStore: Send + Sync {
    fn find_user(&self, name: &str) -> Option<TrustedUser>;
    fn is_trusted(&self, name: &str) -> bool {
        self.find_user(name).is_some()
    }
    fn keys_for(&self, name: &str) -> Option<(Vec<u8>, Vec<u8>)> {
        self.find_user(name).map(|u| (u.key, u.iv))
    }
    fn create_or_update(&self, user: TrustedUser);
}

/// In-memory trust store; the encrypted on-disk database is out of scope.
#[derive(Default)]
pub struct MemoryTrustStore {
    users: Mutex<HashMap<String, TrustedUser>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TrustStore for MemoryTrustStore {
    fn find_user(&self, name: &str) -> Option<TrustedUser> {
        self.users.lock().unwrap().get(name).cloned()
    }

    fn create_or_update(&self, user: TrustedUser) {
        self.users.lock().unwrap().insert(user.name.clone(), user);
    }
}

/// Blocking yes/no decision from a human. `cancelled` turns true when the
/// asking connection goes away; implementations must poll it instead of
/// waiting forever.
pub trait Operator: Send + Sync {
    fn approve_user(&self, peer: &str, user: &TrustedUser, cancelled: &dyn Fn() -> bool) -> bool;
}

/// Operator that refuses everything. Useful as a headless default.
pub struct DenyAll;

impl Operator for DenyAll {
    fn approve_user(&self, _peer: &str, _user: &TrustedUser, _cancelled: &dyn Fn() -> bool) -> bool {
        false
    }
}

/// Outcome of examining an incoming user-init request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserInitVerdict {
    /// No local session; the peer gets a not-logged-in reply.
    NotLoggedIn,
    /// Known name, identical key material: accept without asking.
    AlreadyTrusted,
    /// Known name but different key material: refuse, never auto-accept.
    KeyMismatch,
    /// Unknown identity: the operator decides.
    AskOperator,
}

pub fn evaluate_user_init(
    store: &dyn TrustStore,
    session: Option<&TrustedUser>,
    user: &TrustedUser,
) -> UserInitVerdict {
    if session.is_none() {
        return UserInitVerdict::NotLoggedIn;
    }
    if store.is_trusted(&user.name) {
        match store.keys_for(&user.name) {
            Some((key, iv)) if key == user.key && iv == user.iv => UserInitVerdict::AlreadyTrusted,
            _ => UserInitVerdict::KeyMismatch,
        }
    } else {
        UserInitVerdict::AskOperator
    }
}

/// The node's own RSA keypair plus its public key in wire form.
#[derive(Debug)]
pub struct NodeIdentity {
    pub private: RsaPrivateKey,
    pub public: RsaPublicKey,
    pub public_der: Vec<u8>,
}

impl NodeIdentity {
    /// Generate a fresh keypair. Failure here is fatal to the process: a
    /// node without a keypair has no identity to offer peers.
    pub fn generate() -> Result<Self> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, RSA_BITS)?;
        Self::from_private(private)
    }

    pub fn from_private(private: RsaPrivateKey) -> Result<Self> {
        let public = RsaPublicKey::from(&private);
        let public_der = public
            .to_public_key_der()
            .map_err(|e| NetError::Crypto(format!("public key encoding failed: {}", e)))?
            .as_bytes()
            .to_vec();
        Ok(Self {
            private,
            public,
            public_der,
        })
    }

    /// Decrypt and parse a keypair saved by `store_encrypted`.
    pub fn load_encrypted(path: &str, password: &str) -> Result<Self> {
        let blob = std::fs::read(path)
            .map_err(|e| NetError::Argument(format!("failed to read {}: {}", path, e)))?;
        if blob.len() < 16 + 12 + 16 {
            return Err(NetError::Argument(format!(
                "key file {} is too small or malformed",
                path
            )));
        }
        let salt = &blob[0..16];
        let nonce = &blob[16..28];
        let ciphertext = &blob[28..];

        let cipher = password_cipher(password, salt)?;
        let nonce_ga = aes_gcm::aead::generic_array::GenericArray::<u8, typenum::U12>::from_slice(nonce);
        let mut der = cipher.decrypt(nonce_ga, ciphertext).map_err(|_| {
            NetError::Crypto("failed to decrypt key file: wrong password or corrupted file".to_string())
        })?;
        let private = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| NetError::Crypto(format!("key file does not hold a valid key: {}", e)));
        der.zeroize();
        Self::from_private(private?)
    }

    /// Encrypt the private key with a password-derived key and write it out.
    pub fn store_encrypted(&self, path: &str, password: &str) -> Result<()> {
        let der = self
            .private
            .to_pkcs8_der()
            .map_err(|e| NetError::Crypto(format!("private key encoding failed: {}", e)))?;

        let mut rng = rand::rngs::OsRng;
        let mut salt = [0u8; 16];
        rng.fill_bytes(&mut salt);
        let mut nonce = [0u8; 12];
        rng.fill_bytes(&mut nonce);

        let cipher = password_cipher(password, &salt)?;
        let nonce_ga = aes_gcm::aead::generic_array::GenericArray::<u8, typenum::U12>::from_slice(&nonce);
        let ciphertext = cipher
            .encrypt(nonce_ga, der.as_bytes())
            .map_err(|_| NetError::Crypto("key file encryption failed".to_string()))?;

        if let Some(dir) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let mut blob = Vec::with_capacity(16 + 12 + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        std::fs::write(path, &blob)
            .map_err(|e| NetError::Argument(format!("failed to write {}: {}", path, e)))?;
        Ok(())
    }
}

fn password_cipher(password: &str, salt: &[u8]) -> Result<Aes256Gcm> {
    let mut derived = [0u8; 32];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut derived);
    let cipher = Aes256Gcm::new_from_slice(&derived)
        .map_err(|_| NetError::Crypto("invalid derived key".to_string()));
    derived.zeroize();
    cipher
}

/// Derive the symmetric parameters of a login session from a password.
/// Deterministic per (name, password) so both sides of a trust exchange can
/// recognize the same identity later.
pub fn derive_session_user(name: &str, password: &str) -> TrustedUser {
    let salt = Sha256::digest(name.as_bytes());
    let mut material = [0u8; 48];
    pbkdf2::<Hmac<Sha256>>(password.as_bytes(), &salt[..16], PBKDF2_ROUNDS, &mut material);
    let user = TrustedUser {
        name: name.to_string(),
        key: material[..32].to_vec(),
        iv: material[32..].to_vec(),
    };
    material.zeroize();
    user
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, key: u8) -> TrustedUser {
        TrustedUser {
            name: name.to_string(),
            key: vec![key; 32],
            iv: vec![key; 16],
        }
    }

    #[test]
    fn not_logged_in_wins_over_everything() {
        let store = MemoryTrustStore::new();
        store.create_or_update(user("bob", 1));
        let verdict = evaluate_user_init(&store, None, &user("bob", 1));
        assert_eq!(verdict, UserInitVerdict::NotLoggedIn);
    }

    #[test]
    fn matching_keys_auto_accept() {
        let store = MemoryTrustStore::new();
        store.create_or_update(user("bob", 1));
        let session = user("alice", 9);
        let verdict = evaluate_user_init(&store, Some(&session), &user("bob", 1));
        assert_eq!(verdict, UserInitVerdict::AlreadyTrusted);
    }

    #[test]
    fn mismatched_keys_never_auto_accept() {
        let store = MemoryTrustStore::new();
        store.create_or_update(user("bob", 1));
        let session = user("alice", 9);
        let verdict = evaluate_user_init(&store, Some(&session), &user("bob", 2));
        assert_eq!(verdict, UserInitVerdict::KeyMismatch);
    }

    #[test]
    fn unknown_identity_goes_to_the_operator() {
        let store = MemoryTrustStore::new();
        let session = user("alice", 9);
        let verdict = evaluate_user_init(&store, Some(&session), &user("mallory", 3));
        assert_eq!(verdict, UserInitVerdict::AskOperator);
    }

    #[test]
    fn session_derivation_is_deterministic() {
        let a = derive_session_user("alice", "hunter2");
        let b = derive_session_user("alice", "hunter2");
        assert_eq!(a, b);
        assert_eq!(a.key.len(), 32);
        assert_eq!(a.iv.len(), 16);
        let c = derive_session_user("alice", "other");
        assert_ne!(a.key, c.key);
    }

    #[test]
    fn key_file_round_trips_and_rejects_wrong_password() {
        let identity = NodeIdentity::generate().expect("keygen");
        let path = std::env::temp_dir().join(format!("veilnet-key-{}.bin", std::process::id()));
        let path_str = path.to_str().unwrap();

        identity.store_encrypted(path_str, "correct horse").expect("store");
        let loaded = NodeIdentity::load_encrypted(path_str, "correct horse").expect("load");
        assert_eq!(loaded.public_der, identity.public_der);

        let err = NodeIdentity::load_encrypted(path_str, "wrong").unwrap_err();
        assert!(matches!(err, NetError::Crypto(_)));
        let _ = std::fs::remove_file(&path);
    }
}
