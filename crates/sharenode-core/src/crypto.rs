//! Per-peer crypto session
//!
//! Each connection owns one [`CryptoSession`]. It holds an X25519 agreement
//! keypair and an Ed25519 signing keypair. Once the remote side's public keys
//! are applied, the shared secret is run through HKDF-SHA256 to derive an
//! AES-256 key, and the session becomes enabled.
//!
//! ```text
//! shared  = X25519(own_secret, remote_agreement_key)
//! key     = HKDF-SHA256(ikm = shared, info = "sharenode session key")
//! message = AES-256-CBC(key, iv = random 16 bytes, PKCS#7)
//! sig     = Ed25519_Sign(own_signing_key, ciphertext)
//! ```

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::{Error, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of public agreement and signing keys
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an Ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Length of the CBC initialization vector
pub const IV_LEN: usize = 16;

const KDF_INFO: &[u8] = b"sharenode session key";

/// Public half of a session, sent to the remote side during the handshake
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKeys {
    pub agreement: [u8; PUBLIC_KEY_LEN],
    pub signing: [u8; PUBLIC_KEY_LEN],
}

impl fmt::Debug for PublicKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKeys")
            .field("agreement", &hex::encode(self.agreement))
            .field("signing", &hex::encode(self.signing))
            .finish()
    }
}

struct RemoteKeys {
    verifying_key: VerifyingKey,
    cipher_key: Zeroizing<[u8; 32]>,
}

pub struct CryptoSession {
    agreement_secret: StaticSecret,
    agreement_public: PublicKey,
    signing_key: SigningKey,
    remote: Option<RemoteKeys>,
}

// Keep secret material out of logs
impl fmt::Debug for CryptoSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoSession")
            .field("public_keys", &self.public_keys())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl CryptoSession {
    /// Create a session with freshly generated agreement and signing keypairs
    pub fn generate() -> Result<Self> {
        let mut agreement_bytes = Zeroizing::new([0u8; 32]);
        let mut signing_bytes = Zeroizing::new([0u8; 32]);
        fill_random(&mut agreement_bytes[..])?;
        fill_random(&mut signing_bytes[..])?;

        let agreement_secret = StaticSecret::from(*agreement_bytes);
        let agreement_public = PublicKey::from(&agreement_secret);

        Ok(Self {
            agreement_secret,
            agreement_public,
            signing_key: SigningKey::from_bytes(&signing_bytes),
            remote: None,
        })
    }

    /// Our own public keys, available from creation
    pub fn public_keys(&self) -> PublicKeys {
        PublicKeys {
            agreement: self.agreement_public.to_bytes(),
            signing: self.signing_key.verifying_key().to_bytes(),
        }
    }

    /// Whether remote keys have been applied and symmetric operations are available
    pub fn is_enabled(&self) -> bool {
        self.remote.is_some()
    }

    /// Apply the remote side's public keys and derive the symmetric key.
    ///
    /// On error the session is left untouched and stays disabled.
    pub fn set_remote_keys(&mut self, agreement: &[u8], signing: &[u8]) -> Result<()> {
        let agreement: [u8; 32] = agreement.try_into().map_err(|_| {
            Error::MalformedKey(format!("agreement key must be 32 bytes, got {}", agreement.len()))
        })?;
        let signing: [u8; 32] = signing.try_into().map_err(|_| {
            Error::MalformedKey(format!("signing key must be 32 bytes, got {}", signing.len()))
        })?;

        let verifying_key = VerifyingKey::from_bytes(&signing)
            .map_err(|e| Error::MalformedKey(format!("signing key: {}", e)))?;

        let shared = self
            .agreement_secret
            .diffie_hellman(&PublicKey::from(agreement));
        if !shared.was_contributory() {
            return Err(Error::MalformedKey(
                "agreement key is a low-order point".to_string(),
            ));
        }

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut cipher_key = Zeroizing::new([0u8; 32]);
        hkdf.expand(KDF_INFO, &mut cipher_key[..])
            .map_err(|e| Error::Crypto(format!("key derivation: {}", e)))?;

        self.remote = Some(RemoteKeys {
            verifying_key,
            cipher_key,
        });
        Ok(())
    }

    /// Sign data with our own signing key
    pub fn sign(&self, data: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(data).to_bytes()
    }

    /// Verify a signature made by the remote side. Always false until enabled.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> bool {
        let Some(remote) = &self.remote else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        remote.verifying_key.verify(data, &signature).is_ok()
    }

    /// Encrypt with a freshly generated IV
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(Vec<u8>, [u8; IV_LEN])> {
        let remote = self.remote.as_ref().ok_or(Error::NotEnabled)?;

        let mut iv = [0u8; IV_LEN];
        fill_random(&mut iv)?;

        let key: &[u8; 32] = &remote.cipher_key;
        let ciphertext = Aes256CbcEnc::new(key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        Ok((ciphertext, iv))
    }

    pub fn decrypt(&self, ciphertext: &[u8], iv: &[u8]) -> Result<Vec<u8>> {
        let remote = self.remote.as_ref().ok_or(Error::NotEnabled)?;
        let iv: [u8; IV_LEN] = iv
            .try_into()
            .map_err(|_| Error::Crypto(format!("iv must be {} bytes, got {}", IV_LEN, iv.len())))?;

        let key: &[u8; 32] = &remote.cipher_key;
        Aes256CbcDec::new(key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::Crypto("decryption failed".to_string()))
    }
}

fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| Error::Crypto(format!("random source unavailable: {}", e)))
}
