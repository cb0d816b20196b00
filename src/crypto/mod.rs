// Crypto adaptor: signing keys, sealed-box encryption, digests

use base64::engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, Verifier};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const SIGNATURE_LEN: usize = 64;

const SEAL_INFO: &[u8] = b"smq sealed box v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("bad key material")]
    BadKey,
    #[error("bad signature encoding")]
    BadSignature,
    #[error("verification failed")]
    Verification,
    #[error("decryption failed")]
    Decryption,
}

/// Ed25519 signing keypair for one side of one queue.
#[derive(Clone)]
pub struct SignKeyPair {
    signing: ed25519_dalek::SigningKey,
}

impl SignKeyPair {
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    pub fn verify_key(&self) -> VerifyKey {
        VerifyKey(self.signing.verifying_key())
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing.sign(data).to_bytes().to_vec()
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.signing.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&raw),
        })
    }
}

impl std::fmt::Debug for SignKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SignKeyPair({})", self.verify_key())
    }
}

/// Public verification key as carried on the wire (base64 of the raw key).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyKey(ed25519_dalek::VerifyingKey);

impl VerifyKey {
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let raw: [u8; SIGNATURE_LEN] = signature
            .try_into()
            .map_err(|_| CryptoError::BadSignature)?;
        let sig = ed25519_dalek::Signature::from_bytes(&raw);
        self.0
            .verify(data, &sig)
            .map_err(|_| CryptoError::Verification)
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&raw).map_err(|_| CryptoError::BadKey)?;
        Ok(Self(key))
    }

    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.0.as_bytes())
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let bytes = b64_decode(s).map_err(|_| CryptoError::BadKey)?;
        let raw: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| CryptoError::BadKey)?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&raw).map_err(|_| CryptoError::BadKey)?;
        Ok(Self(key))
    }
}

impl std::fmt::Display for VerifyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// X25519 keypair owned by a queue recipient for inbound message bodies.
#[derive(Clone)]
pub struct EncKeyPair {
    secret: x25519_dalek::StaticSecret,
}

impl EncKeyPair {
    pub fn generate() -> Self {
        Self {
            secret: x25519_dalek::StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn public(&self) -> EncryptKey {
        EncryptKey(x25519_dalek::PublicKey::from(&self.secret))
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        self.secret.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self {
            secret: x25519_dalek::StaticSecret::from(raw),
        })
    }

    /// Opens a sealed box produced by [`EncryptKey::seal`].
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < KEY_LEN + NONCE_LEN {
            return Err(CryptoError::Decryption);
        }
        let eph_raw: [u8; KEY_LEN] = sealed[..KEY_LEN]
            .try_into()
            .map_err(|_| CryptoError::Decryption)?;
        let eph = x25519_dalek::PublicKey::from(eph_raw);
        let nonce = XNonce::from_slice(&sealed[KEY_LEN..KEY_LEN + NONCE_LEN]);
        let shared = self.secret.diffie_hellman(&eph);
        let key = derive_seal_key(shared.as_bytes(), &eph_raw);
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(nonce, &sealed[KEY_LEN + NONCE_LEN..])
            .map_err(|_| CryptoError::Decryption)
    }
}

impl std::fmt::Debug for EncKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncKeyPair({})", self.public())
    }
}

/// Public encryption key shared in an invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptKey(x25519_dalek::PublicKey);

impl EncryptKey {
    /// Seals `plaintext` to this key: an ephemeral ECDH with a fresh
    /// x25519 key, the shared secret expanded into an XChaCha20-Poly1305
    /// key. Layout: ephemeral public key, nonce, ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Vec<u8> {
        let eph_secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let eph_public = x25519_dalek::PublicKey::from(&eph_secret);
        let shared = eph_secret.diffie_hellman(&self.0);
        let key = derive_seal_key(shared.as_bytes(), eph_public.as_bytes());
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        // encrypt cannot fail for in-memory plaintext of sane size
        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .unwrap_or_default();

        let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(eph_public.as_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        out
    }

    pub fn to_bytes(&self) -> [u8; KEY_LEN] {
        *self.0.as_bytes()
    }

    pub fn encode(&self) -> String {
        URL_SAFE.encode(self.0.as_bytes())
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let bytes = b64_decode(s).map_err(|_| CryptoError::BadKey)?;
        let raw: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self(x25519_dalek::PublicKey::from(raw)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; KEY_LEN] = bytes.try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self(x25519_dalek::PublicKey::from(raw)))
    }
}

impl std::fmt::Display for EncryptKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

fn derive_seal_key(shared: &[u8], salt: &[u8]) -> [u8; KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared);
    let mut okm = [0u8; KEY_LEN];
    // expand only fails for oversized output lengths
    hk.expand(SEAL_INFO, &mut okm).unwrap_or_default();
    okm
}

/// SHA-256 digest of a server's end-entity certificate, pinned through the
/// `#key_hash` fragment of a server address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHash(pub [u8; KEY_LEN]);

impl KeyHash {
    pub fn of_certificate(cert_der: &[u8]) -> Self {
        Self(sha256(cert_der))
    }

    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    pub fn decode(s: &str) -> Result<Self, CryptoError> {
        let bytes = b64_decode(s).map_err(|_| CryptoError::BadKey)?;
        let raw: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| CryptoError::BadKey)?;
        Ok(Self(raw))
    }
}

impl std::fmt::Display for KeyHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

pub fn sha256(data: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Random opaque id bytes (queue ids, correlation ids).
pub fn random_id(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Decodes base64 accepting url-safe and standard alphabets, padded or not.
pub fn b64_decode(s: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
    let trimmed = s.trim_end_matches('=');
    if s.contains('+') || s.contains('/') {
        return STANDARD
            .decode(s)
            .or_else(|_| STANDARD_NO_PAD.decode(trimmed));
    }
    URL_SAFE
        .decode(s)
        .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
}

/// Encodes base64url, padded (the form all encoders emit).
pub fn b64_encode(bytes: &[u8]) -> String {
    URL_SAFE.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let pair = SignKeyPair::generate();
        let key = pair.verify_key();
        let sig = pair.sign(b"transmission bytes");

        assert!(key.verify(b"transmission bytes", &sig).is_ok());
        assert!(key.verify(b"tampered bytes", &sig).is_err());

        let other = SignKeyPair::generate().verify_key();
        assert!(other.verify(b"transmission bytes", &sig).is_err());
    }

    #[test]
    fn test_verify_key_encoding() {
        let key = SignKeyPair::generate().verify_key();
        let decoded = VerifyKey::decode(&key.encode()).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_seal_open() {
        let pair = EncKeyPair::generate();
        let sealed = pair.public().seal(b"hello queue");
        assert_eq!(pair.open(&sealed).unwrap(), b"hello queue");

        let other = EncKeyPair::generate();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn test_sealed_box_unique() {
        let pair = EncKeyPair::generate();
        let a = pair.public().seal(b"same body");
        let b = pair.public().seal(b"same body");
        assert_ne!(a, b);
    }

    #[test]
    fn test_b64_decode_accepts_unpadded() {
        let bytes = random_id(24);
        let padded = b64_encode(&bytes);
        let unpadded = padded.trim_end_matches('=').to_string();
        assert_eq!(b64_decode(&padded).unwrap(), bytes);
        assert_eq!(b64_decode(&unpadded).unwrap(), bytes);
    }

    #[test]
    fn test_key_hash_deterministic() {
        let der = b"certificate der bytes";
        let a = KeyHash::of_certificate(der);
        let b = KeyHash::of_certificate(der);
        assert_eq!(a, b);
        assert_eq!(KeyHash::decode(&a.encode()).unwrap(), a);
    }
}
