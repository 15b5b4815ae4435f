// SPDX-License-Identifier: MIT OR Apache-2.0
//! aidp-keys
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Per-agent RSA proof-of-possession keys.
//!
//! Every registered agent owns a 2048-bit RSA keypair. The private half
//! never leaves the client process; the public half is registered with the
//! IDP and embedded in intent tokens as `cnf.jwk`. Dev persistence is a
//! pair of PEM files per agent in a runtime directory.

use aidp_model::claims::Jwk;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::Sha256;
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

const KEY_BITS: usize = 2048;
const PRIVATE_SUFFIX: &str = "-pop-privatekey.pem";
const PUBLIC_SUFFIX: &str = "-pop-publickey.pem";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors from key generation, persistence, and conversion.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Reading or writing a PEM file failed.
    #[error("key file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// RSA key generation or construction failed.
    #[error("rsa operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    /// PKCS#8 private-key encoding or decoding failed.
    #[error("private key encoding failed: {0}")]
    Pkcs8(#[from] rsa::pkcs8::Error),

    /// SPKI public-key encoding or decoding failed.
    #[error("public key encoding failed: {0}")]
    Spki(#[from] rsa::pkcs8::spki::Error),

    /// A JWK component was not valid base64url.
    #[error("jwk component decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    /// No key material exists for the agent.
    #[error("no key registered for agent '{0}'")]
    UnknownAgent(String),

    /// The JWK did not describe an RSA signing key.
    #[error("unsupported jwk: {0}")]
    UnsupportedJwk(String),
}

// ---------------------------------------------------------------------------
// Key pair
// ---------------------------------------------------------------------------

/// One agent's keypair, held in memory after load or generation.
#[derive(Debug, Clone)]
pub struct AgentKeyPair {
    private: RsaPrivateKey,
    public_pem: String,
}

impl AgentKeyPair {
    /// The private key. Never serialize this; it stays in the client.
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }

    /// SPKI PEM of the public half.
    #[must_use]
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// The public half as an RSA JWK (`kty`/`use`/`alg`/`n`/`e`).
    #[must_use]
    pub fn public_jwk(&self) -> Jwk {
        jwk_from_public_key(&self.private.to_public_key(), None)
    }
}

// ---------------------------------------------------------------------------
// Key manager
// ---------------------------------------------------------------------------

/// File-backed manager for per-agent PoP keypairs.
///
/// `open` scans the runtime directory for existing `<id>-pop-privatekey.pem`
/// files; a key that fails to load is skipped with a warning and will be
/// regenerated by the next [`AgentKeyManager::generate`] call.
#[derive(Debug)]
pub struct AgentKeyManager {
    key_dir: PathBuf,
    keys: RwLock<BTreeMap<String, Arc<AgentKeyPair>>>,
}

impl AgentKeyManager {
    /// Open a key manager over the given runtime directory.
    ///
    /// The directory is created if missing. Load failures are non-fatal.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::Io`] only if the directory cannot be created or
    /// listed.
    pub fn open(key_dir: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let key_dir = key_dir.into();
        std::fs::create_dir_all(&key_dir)?;

        let mut keys = BTreeMap::new();
        for entry in std::fs::read_dir(&key_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(agent_id) = name.strip_suffix(PRIVATE_SUFFIX) else {
                continue;
            };
            match load_keypair(&key_dir, agent_id) {
                Ok(pair) => {
                    debug!(agent_id, "loaded PoP keypair");
                    keys.insert(agent_id.to_string(), Arc::new(pair));
                }
                Err(err) => {
                    warn!(agent_id, error = %err, "skipping unloadable PoP keypair");
                }
            }
        }

        Ok(Self {
            key_dir,
            keys: RwLock::new(keys),
        })
    }

    /// Generate (or return the existing) keypair for an agent.
    ///
    /// Idempotent: if the agent already has a key, its public PEM is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if generation or persistence fails.
    pub fn generate(&self, agent_id: &str) -> Result<String, KeyError> {
        if let Some(pair) = self.keypair(agent_id) {
            return Ok(pair.public_pem.clone());
        }

        let private = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)?;
        let pair = persist_keypair(&self.key_dir, agent_id, private)?;
        let public_pem = pair.public_pem.clone();

        self.keys
            .write()
            .expect("key map lock poisoned")
            .insert(agent_id.to_string(), Arc::new(pair));
        debug!(agent_id, "generated PoP keypair");

        Ok(public_pem)
    }

    /// The agent's keypair, if one is loaded.
    #[must_use]
    pub fn keypair(&self, agent_id: &str) -> Option<Arc<AgentKeyPair>> {
        self.keys
            .read()
            .expect("key map lock poisoned")
            .get(agent_id)
            .cloned()
    }

    /// The agent's public key PEM.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::UnknownAgent`] if no key exists.
    pub fn public_key_pem(&self, agent_id: &str) -> Result<String, KeyError> {
        self.keypair(agent_id)
            .map(|pair| pair.public_pem.clone())
            .ok_or_else(|| KeyError::UnknownAgent(agent_id.to_string()))
    }

    /// The agent's public key as a JWK for the `cnf` claim.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError::UnknownAgent`] if no key exists.
    pub fn public_key_jwk(&self, agent_id: &str) -> Result<Jwk, KeyError> {
        self.keypair(agent_id)
            .map(|pair| pair.public_jwk())
            .ok_or_else(|| KeyError::UnknownAgent(agent_id.to_string()))
    }

    /// Agent ids with loaded keys.
    #[must_use]
    pub fn agent_ids(&self) -> Vec<String> {
        self.keys
            .read()
            .expect("key map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

fn load_keypair(dir: &Path, agent_id: &str) -> Result<AgentKeyPair, KeyError> {
    let private_pem = std::fs::read_to_string(dir.join(format!("{agent_id}{PRIVATE_SUFFIX}")))?;
    let private = RsaPrivateKey::from_pkcs8_pem(&private_pem)?;
    let public_pem = private.to_public_key().to_public_key_pem(LineEnding::LF)?;
    Ok(AgentKeyPair {
        private,
        public_pem,
    })
}

fn persist_keypair(
    dir: &Path,
    agent_id: &str,
    private: RsaPrivateKey,
) -> Result<AgentKeyPair, KeyError> {
    let private_pem = private.to_pkcs8_pem(LineEnding::LF)?;
    std::fs::write(
        dir.join(format!("{agent_id}{PRIVATE_SUFFIX}")),
        private_pem.as_bytes(),
    )?;

    let public_pem = private.to_public_key().to_public_key_pem(LineEnding::LF)?;
    std::fs::write(
        dir.join(format!("{agent_id}{PUBLIC_SUFFIX}")),
        public_pem.as_bytes(),
    )?;

    Ok(AgentKeyPair {
        private,
        public_pem,
    })
}

// ---------------------------------------------------------------------------
// JWK conversion
// ---------------------------------------------------------------------------

fn b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Convert an RSA public key to a signing JWK.
#[must_use]
pub fn jwk_from_public_key(key: &RsaPublicKey, kid: Option<String>) -> Jwk {
    Jwk {
        kty: "RSA".to_string(),
        use_: "sig".to_string(),
        alg: "RS256".to_string(),
        n: b64url(&key.n().to_bytes_be()),
        e: b64url(&key.e().to_bytes_be()),
        kid,
    }
}

/// Reconstruct an RSA public key from a JWK.
///
/// # Errors
///
/// Returns [`KeyError::UnsupportedJwk`] for non-RSA keys and decoding
/// errors for malformed components.
pub fn public_key_from_jwk(jwk: &Jwk) -> Result<RsaPublicKey, KeyError> {
    if jwk.kty != "RSA" {
        return Err(KeyError::UnsupportedJwk(format!(
            "expected kty RSA, got {}",
            jwk.kty
        )));
    }
    // Tolerate padded input from non-conforming issuers.
    let n = URL_SAFE_NO_PAD.decode(jwk.n.trim_end_matches('='))?;
    let e = URL_SAFE_NO_PAD.decode(jwk.e.trim_end_matches('='))?;
    Ok(RsaPublicKey::new(
        BigUint::from_bytes_be(&n),
        BigUint::from_bytes_be(&e),
    )?)
}

/// Parse a public key PEM into an [`RsaPublicKey`].
///
/// # Errors
///
/// Returns [`KeyError::Spki`] for malformed PEM.
pub fn public_key_from_pem(pem: &str) -> Result<RsaPublicKey, KeyError> {
    Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

// ---------------------------------------------------------------------------
// PKCS#1 v1.5 signing
// ---------------------------------------------------------------------------

/// Sign `message` with RSASSA-PKCS1-v1_5 / SHA-256.
#[must_use]
pub fn sign_sha256(private: &RsaPrivateKey, message: &[u8]) -> Vec<u8> {
    let signing_key = SigningKey::<Sha256>::new(private.clone());
    signing_key.sign(message).to_vec()
}

/// Verify an RSASSA-PKCS1-v1_5 / SHA-256 signature.
///
/// Returns `false` for malformed signatures as well as mismatches.
#[must_use]
pub fn verify_sha256(public: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public.clone());
    verifying_key.verify(message, &signature).is_ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
