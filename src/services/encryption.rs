//! Hybrid message encryption: a fresh 128-bit AES session key encrypts the
//! body under CBC with PKCS#7 padding, and the session key is wrapped with
//! the recipient's RSA public key using OAEP. The three parts travel as one
//! base64 JSON envelope which is stored verbatim in `messages.content`.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AppError;
use crate::models::KeyPair;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

const AES_KEY_LEN: usize = 16;
const AES_IV_LEN: usize = 16;

/// Wire/storage format of an encrypted message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// base64(RSA-OAEP(AES session key))
    pub key: String,
    /// base64(AES-CBC IV)
    pub iv: String,
    /// base64(AES-CBC ciphertext)
    pub message: String,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, AppError> {
        serde_json::to_string(self).map_err(|e| AppError::Encryption(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        serde_json::from_str(raw).map_err(|e| AppError::Decryption(format!("bad envelope: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct EncryptionManager {
    key_bits: usize,
}

impl Default for EncryptionManager {
    fn default() -> Self {
        Self { key_bits: 2048 }
    }
}

impl EncryptionManager {
    pub fn new(key_bits: usize) -> Self {
        Self { key_bits }
    }

    /// Generate a fresh PEM-encoded RSA key pair for an identity.
    ///
    /// Called once per identity at creation; the directory guards the
    /// idempotency (an existing pair is always reused, never replaced).
    pub fn generate_key_pair(&self) -> Result<KeyPair, AppError> {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, self.key_bits)
            .map_err(|e| AppError::Encryption(format!("rsa keygen: {e}")))?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| AppError::Encryption(format!("private pem: {e}")))?
            .to_string();
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| AppError::Encryption(format!("public pem: {e}")))?;

        Ok(KeyPair {
            private_pem,
            public_pem,
        })
    }

    /// Encrypt `plaintext` for the holder of `recipient_public`.
    ///
    /// A fresh session key and IV are drawn per message and never reused.
    pub fn encrypt(
        &self,
        plaintext: &str,
        recipient_public: &RsaPublicKey,
    ) -> Result<Envelope, AppError> {
        let mut rng = rand::thread_rng();

        let mut session_key = [0u8; AES_KEY_LEN];
        let mut iv = [0u8; AES_IV_LEN];
        rand::RngCore::fill_bytes(&mut rng, &mut session_key);
        rand::RngCore::fill_bytes(&mut rng, &mut iv);

        let ciphertext = Aes128CbcEnc::new(&session_key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let wrapped_key = recipient_public
            .encrypt(&mut rng, Oaep::new::<Sha256>(), &session_key)
            .map_err(|e| AppError::Encryption(format!("rsa wrap: {e}")))?;

        Ok(Envelope {
            key: STANDARD.encode(wrapped_key),
            iv: STANDARD.encode(iv),
            message: STANDARD.encode(ciphertext),
        })
    }

    /// Decrypt an envelope with the matching private key.
    ///
    /// Any failure (malformed fields, wrong key, bad padding) comes back as
    /// `AppError::Decryption`; callers treat the message as undecryptable
    /// and skip it rather than abort the session.
    pub fn decrypt(&self, envelope: &Envelope, private: &RsaPrivateKey) -> Result<String, AppError> {
        let wrapped_key = STANDARD
            .decode(&envelope.key)
            .map_err(|e| AppError::Decryption(format!("key b64: {e}")))?;
        let iv = STANDARD
            .decode(&envelope.iv)
            .map_err(|e| AppError::Decryption(format!("iv b64: {e}")))?;
        let ciphertext = STANDARD
            .decode(&envelope.message)
            .map_err(|e| AppError::Decryption(format!("message b64: {e}")))?;

        let session_key = private
            .decrypt(Oaep::new::<Sha256>(), &wrapped_key)
            .map_err(|e| AppError::Decryption(format!("rsa unwrap: {e}")))?;

        let plaintext = Aes128CbcDec::new_from_slices(&session_key, &iv)
            .map_err(|e| AppError::Decryption(format!("cipher init: {e}")))?
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|e| AppError::Decryption(format!("aes unpad: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| AppError::Decryption(format!("utf8: {e}")))
    }
}

pub fn parse_private_key(pem: &str) -> Result<RsaPrivateKey, AppError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| AppError::Decryption(format!("private pem: {e}")))
}

pub fn parse_public_key(pem: &str) -> Result<RsaPublicKey, AppError> {
    RsaPublicKey::from_public_key_pem(pem)
        .map_err(|e| AppError::Encryption(format!("public pem: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> EncryptionManager {
        // Small modulus keeps keygen fast; the wrap still fits a 16-byte key.
        EncryptionManager::new(1024)
    }

    fn keys(mgr: &EncryptionManager) -> (RsaPrivateKey, RsaPublicKey) {
        let pair = mgr.generate_key_pair().expect("keygen");
        (
            parse_private_key(&pair.private_pem).expect("parse private"),
            parse_public_key(&pair.public_pem).expect("parse public"),
        )
    }

    #[test]
    fn roundtrip_recovers_plaintext() {
        let mgr = manager();
        let (private, public) = keys(&mgr);

        let envelope = mgr.encrypt("the quick brown fox", &public).expect("encrypt");
        let plaintext = mgr.decrypt(&envelope, &private).expect("decrypt");
        assert_eq!(plaintext, "the quick brown fox");
    }

    #[test]
    fn encryption_is_randomized() {
        let mgr = manager();
        let (_, public) = keys(&mgr);

        let a = mgr.encrypt("same plaintext", &public).expect("encrypt");
        let b = mgr.encrypt("same plaintext", &public).expect("encrypt");
        assert_ne!(a.iv, b.iv, "fresh IV per message");
        assert_ne!(a.message, b.message, "fresh session key per message");
    }

    #[test]
    fn wrong_private_key_fails_cleanly() {
        let mgr = manager();
        let (_, public) = keys(&mgr);
        let (other_private, _) = keys(&mgr);

        let envelope = mgr.encrypt("secret", &public).expect("encrypt");
        let err = mgr.decrypt(&envelope, &other_private).unwrap_err();
        assert!(matches!(err, AppError::Decryption(_)));
    }

    #[test]
    fn malformed_envelope_fails_cleanly() {
        let mgr = manager();
        let (private, _) = keys(&mgr);

        let envelope = Envelope {
            key: "not base64!!".into(),
            iv: String::new(),
            message: String::new(),
        };
        assert!(matches!(
            mgr.decrypt(&envelope, &private),
            Err(AppError::Decryption(_))
        ));

        assert!(matches!(
            Envelope::from_json("plain old text"),
            Err(AppError::Decryption(_))
        ));
    }

    #[test]
    fn envelope_serializes_to_one_json_object() {
        let mgr = manager();
        let (_, public) = keys(&mgr);

        let raw = mgr.encrypt("hi", &public).expect("encrypt").to_json().expect("json");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        assert!(value.get("key").is_some());
        assert!(value.get("iv").is_some());
        assert!(value.get("message").is_some());
    }
}
