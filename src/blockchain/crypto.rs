use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{ecdsa::Signature, All, Message, PublicKey, Secp256k1, SecretKey};
use serde::{de, Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use utoipa::ToSchema;

use std::fmt;
use std::str::FromStr;

/// Shared secp256k1 context, built once
static SECP256K1: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Failed to sign message: {0}")]
    SigningError(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Hex-encoded SHA-256 digest of `data`
pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Represents a wallet address (compressed secp256k1 public key, lowercase hex).
///
/// Deserialising goes through [`FromStr`], so every address that enters the
/// node is in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, ToSchema)]
pub struct Address(pub String);

impl Address {
    /// Creates a new address from a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Address(hex::encode(public_key.serialize()))
    }

    /// Recovers the public key the address was derived from
    pub fn to_public_key(&self) -> Result<PublicKey, CryptoError> {
        let bytes = hex::decode(self.0.trim())
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        PublicKey::from_slice(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    /// Accepts any case, surrounding whitespace and uncompressed keys,
    /// and re-encodes to the compressed lowercase form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let public_key = Address(s.to_string()).to_public_key()?;
        Ok(Address::from_public_key(&public_key))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// A secp256k1 key pair. Wallets only keep the secret half for keys the node custodies.
#[derive(Debug, Clone)]
pub struct KeyPair {
    secret_key: SecretKey,
    public_key: PublicKey,
    address: Address,
}

impl KeyPair {
    /// Creates a new random key pair
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1, &secret_key);
        let address = Address::from_public_key(&public_key);

        KeyPair {
            secret_key,
            public_key,
            address,
        }
    }

    /// Imports a key pair from a hex private key. Surrounding whitespace and case are ignored.
    pub fn from_private_key_hex(private_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(private_key.trim().to_ascii_lowercase())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        let secret_key = SecretKey::from_slice(&bytes)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        Ok(Self::from_secret_key(secret_key))
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Exports the private key as lowercase hex
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.secret_key.secret_bytes())
    }

    /// Signs SHA-256(`message`) and returns the DER signature as hex
    pub fn sign(&self, message: &[u8]) -> Result<String, CryptoError> {
        let digest = Sha256::digest(message);
        let message = Message::from_digest_slice(&digest)
            .map_err(|e| CryptoError::SigningError(e.to_string()))?;

        let signature = SECP256K1.sign_ecdsa(&message, &self.secret_key);
        Ok(hex::encode(signature.serialize_der()))
    }
}

/// Verifies a hex DER signature over SHA-256(`message`).
///
/// Malformed signatures are reported as errors, a well-formed signature
/// that does not match yields `Ok(false)`.
pub fn verify_signature(
    message: &[u8],
    signature_hex: &str,
    public_key: &PublicKey,
) -> Result<bool, CryptoError> {
    let bytes = hex::decode(signature_hex.trim())
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;
    let signature =
        Signature::from_der(&bytes).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    let digest = Sha256::digest(message);
    let message = Message::from_digest_slice(&digest)
        .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    Ok(SECP256K1.verify_ecdsa(&message, &signature, public_key).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_generation() {
        let keys = KeyPair::generate();
        // 33-byte compressed key
        assert_eq!(keys.address().0.len(), 66);
        assert_eq!(keys.private_key_hex().len(), 64);
    }

    #[test]
    fn test_signing_and_verification() {
        let keys = KeyPair::generate();
        let message = b"to50";

        let public_key = keys.address().to_public_key().unwrap();
        let signature = keys.sign(message).unwrap();
        assert!(verify_signature(message, &signature, &public_key).unwrap());

        assert!(!verify_signature(b"to51", &signature, &public_key).unwrap());

        let other = KeyPair::generate().address().to_public_key().unwrap();
        assert!(!verify_signature(message, &signature, &other).unwrap());
    }

    #[test]
    fn test_garbage_signature_is_an_error() {
        let public_key = KeyPair::generate().address().to_public_key().unwrap();
        assert!(verify_signature(b"x", "zz", &public_key).is_err());
        assert!(verify_signature(b"x", "3006", &public_key).is_err());
    }

    #[test]
    fn test_address_conversion() {
        let keys = KeyPair::generate();
        let public_key = keys.address().to_public_key().unwrap();
        assert_eq!(Address::from_public_key(&public_key), *keys.address());
        assert_eq!(keys.public_key_hex(), keys.address().0);
    }

    #[test]
    fn test_private_key_import_ignores_case_and_whitespace() {
        let keys = KeyPair::generate();
        let shouted = format!("  {}\n", keys.private_key_hex().to_uppercase());

        let imported = KeyPair::from_private_key_hex(&shouted).unwrap();
        assert_eq!(imported.address(), keys.address());
    }

    #[test]
    fn test_address_parse_normalizes_case() {
        let keys = KeyPair::generate();
        let parsed: Address = keys.address().0.to_uppercase().parse().unwrap();
        assert_eq!(&parsed, keys.address());

        assert!("not-an-address".parse::<Address>().is_err());
    }

    #[test]
    fn test_deserialize_canonicalizes_aliases() {
        let keys = KeyPair::generate();
        let public_key = keys.address().to_public_key().unwrap();
        let uncompressed = hex::encode(public_key.serialize_uncompressed());

        for alias in [
            keys.address().0.to_uppercase(),
            format!("  {} ", keys.address().0),
            uncompressed,
        ] {
            let parsed: Address = serde_json::from_value(serde_json::json!(alias)).unwrap();
            assert_eq!(&parsed, keys.address());
        }

        assert!(serde_json::from_value::<Address>(serde_json::json!("zz")).is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
