use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use super::crypto::{sha256_hex, verify_signature, Address, CryptoError, KeyPair};

/// Errors that can occur while admitting or signing a transaction
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Unknown sender: {0}")]
    UnknownSender(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Coinbase transactions cannot be submitted")]
    CoinbaseRejected,

    #[error("Transaction is already pending")]
    Duplicate,

    #[error("Invalid sender address: {0}")]
    InvalidSenderAddress(String),

    #[error("Invalid recipient address: {0}")]
    InvalidRecipientAddress(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Represents a value transfer. `from == None` marks a coinbase reward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Sender's address, `null` for coinbase
    pub from: Option<Address>,

    /// Recipient's address
    pub to: Address,

    /// Amount being transferred
    pub amount: u64,

    /// Declared fee. Recorded, never charged.
    #[serde(default)]
    pub fee: u64,

    /// Creation time in milliseconds since the Unix epoch
    pub timestamp: i64,

    /// Hex DER signature over the signing payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Transaction {
    /// Creates a new unsigned transfer
    pub fn new(from: Address, to: Address, amount: u64, timestamp: i64) -> Self {
        Transaction {
            from: Some(from),
            to,
            amount,
            fee: 0,
            timestamp,
            signature: None,
        }
    }

    /// Creates a new coinbase transaction (mining reward)
    pub fn new_coinbase(to: Address, amount: u64) -> Self {
        Transaction {
            from: None,
            to,
            amount,
            fee: 0,
            timestamp: Utc::now().timestamp_millis(),
            signature: None,
        }
    }

    /// Bytes the sender signs: `to ∥ amount ∥ timestamp`, concatenated as text
    pub fn signing_payload(&self) -> Vec<u8> {
        format!("{}{}{}", self.to.0, self.amount, self.timestamp).into_bytes()
    }

    /// Identity of a transfer for replay protection: sender plus signed payload.
    ///
    /// Independent of the signature bytes, so a re-encoded signature over the
    /// same payload maps to the same digest.
    pub fn digest(&self) -> String {
        let sender = self.from.as_ref().map_or("", |from| from.0.as_str());
        let mut bytes = sender.as_bytes().to_vec();
        bytes.push(b':');
        bytes.extend(self.signing_payload());
        sha256_hex(&bytes)
    }

    /// Signs the transaction with the sender's key pair
    pub fn sign(&mut self, keys: &KeyPair) -> Result<(), TransactionError> {
        match &self.from {
            Some(from) if from == keys.address() => {}
            _ => {
                return Err(TransactionError::InvalidSenderAddress(
                    "Key pair does not match sender address".to_string(),
                ))
            }
        }

        self.signature = Some(keys.sign(&self.signing_payload())?);
        Ok(())
    }

    /// Verifies the signature against the public key recovered from `from`.
    ///
    /// Coinbase transactions carry no signature and always pass.
    pub fn verify_signature(&self) -> Result<(), TransactionError> {
        let from = match &self.from {
            Some(from) => from,
            None => return Ok(()),
        };

        let signature = self
            .signature
            .as_deref()
            .ok_or(TransactionError::InvalidSignature)?;

        let public_key = from
            .to_public_key()
            .map_err(|e| TransactionError::InvalidSenderAddress(e.to_string()))?;

        match verify_signature(&self.signing_payload(), signature, &public_key) {
            Ok(true) => Ok(()),
            Ok(false) | Err(CryptoError::InvalidSignature(_)) => {
                Err(TransactionError::InvalidSignature)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_coinbase(&self) -> bool {
        self.from.is_none()
    }
}
