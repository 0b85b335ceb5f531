use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

use std::collections::{BTreeMap, HashMap};

use super::crypto::{Address, CryptoError, KeyPair};

/// Errors that can occur during wallet operations
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Wallet not found: {0}")]
    NotFound(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: u64, available: u64 },

    #[error("Balance overflow for wallet {0}")]
    Overflow(String),

    #[error("The owner wallet cannot be deleted")]
    OwnerUndeletable,

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Represents a wallet known to the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    /// The wallet's address
    pub address: Address,

    /// Compressed public key, hex. Equal to the address.
    pub public_key: String,

    /// Only kept for the owner wallet, which the node custodies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Spendable balance. Never negative.
    pub balance: u64,

    /// Whether this is the node's mining beneficiary
    #[serde(default)]
    pub is_owner: bool,

    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub created_at: DateTime<Utc>,

    #[schema(value_type = String, example = "2023-01-01T12:00:00Z")]
    pub last_updated: DateTime<Utc>,
}

impl Wallet {
    /// A zero-balance, address-only wallet
    pub fn shell(address: Address) -> Self {
        let now = Utc::now();
        Wallet {
            public_key: address.0.clone(),
            address,
            private_key: None,
            balance: 0,
            is_owner: false,
            created_at: now,
            last_updated: now,
        }
    }

    fn from_keys(keys: &KeyPair) -> Self {
        Wallet {
            public_key: keys.public_key_hex(),
            ..Wallet::shell(keys.address().clone())
        }
    }

    fn set_balance(&mut self, balance: u64) {
        if self.balance != balance {
            self.balance = balance;
            self.last_updated = Utc::now();
        }
    }
}

/// Address → wallet map. Balances here are a cache of the chain replay.
#[derive(Debug, Default, Clone)]
pub struct WalletRegistry {
    wallets: BTreeMap<Address, Wallet>,
}

impl WalletRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_wallets(wallets: Vec<Wallet>) -> Self {
        WalletRegistry {
            wallets: wallets
                .into_iter()
                .map(|wallet| (wallet.address.clone(), wallet))
                .collect(),
        }
    }

    /// Makes sure exactly one owner wallet exists, generating one on first boot.
    ///
    /// # Returns
    ///
    /// The owner's address and whether it was just created
    pub fn ensure_owner(&mut self) -> (Address, bool) {
        let mut owners = self.wallets.values().filter(|w| w.is_owner).map(|w| w.address.clone());
        if let Some(owner) = owners.next() {
            let extra: Vec<Address> = owners.collect();
            for address in extra {
                if let Some(wallet) = self.wallets.get_mut(&address) {
                    wallet.is_owner = false;
                }
            }
            return (owner, false);
        }

        let keys = KeyPair::generate();
        let wallet = Wallet {
            private_key: Some(keys.private_key_hex()),
            is_owner: true,
            ..Wallet::from_keys(&keys)
        };
        self.wallets.insert(wallet.address.clone(), wallet);
        (keys.address().clone(), true)
    }

    pub fn owner(&self) -> Option<&Wallet> {
        self.wallets.values().find(|w| w.is_owner)
    }

    /// Generates a fresh key pair and registers an empty wallet for it.
    ///
    /// The private key is handed back to the caller and not kept.
    pub fn create(&mut self) -> KeyPair {
        let keys = KeyPair::generate();
        let wallet = Wallet::from_keys(&keys);
        self.wallets.insert(wallet.address.clone(), wallet);
        keys
    }

    pub fn get(&self, address: &Address) -> Option<&Wallet> {
        self.wallets.get(address)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.wallets.contains_key(address)
    }

    /// Cached balance, zero for unknown addresses
    pub fn balance(&self, address: &Address) -> u64 {
        self.wallets.get(address).map_or(0, |w| w.balance)
    }

    /// Login lookup by private key
    pub fn find_by_private_key(&self, private_key: &str) -> Result<&Wallet, WalletError> {
        let keys = KeyPair::from_private_key_hex(private_key)?;
        self.wallets
            .get(keys.address())
            .ok_or_else(|| WalletError::NotFound(keys.address().to_string()))
    }

    /// Subtracts `amount`, refusing to go below zero
    pub fn debit(&mut self, address: &Address, amount: u64) -> Result<(), WalletError> {
        let wallet = self
            .wallets
            .get_mut(address)
            .ok_or_else(|| WalletError::NotFound(address.to_string()))?;

        let remaining = wallet
            .balance
            .checked_sub(amount)
            .ok_or(WalletError::InsufficientBalance {
                required: amount,
                available: wallet.balance,
            })?;
        wallet.set_balance(remaining);
        Ok(())
    }

    /// Adds `amount`, creating an address-only wallet the first time it is seen
    pub fn credit(&mut self, address: &Address, amount: u64) -> Result<(), WalletError> {
        let wallet = self
            .wallets
            .entry(address.clone())
            .or_insert_with(|| Wallet::shell(address.clone()));

        let total = wallet
            .balance
            .checked_add(amount)
            .ok_or_else(|| WalletError::Overflow(address.to_string()))?;
        wallet.set_balance(total);
        Ok(())
    }

    pub fn remove(&mut self, address: &Address) -> Result<Wallet, WalletError> {
        match self.wallets.get(address) {
            None => Err(WalletError::NotFound(address.to_string())),
            Some(wallet) if wallet.is_owner => Err(WalletError::OwnerUndeletable),
            Some(_) => self
                .wallets
                .remove(address)
                .ok_or_else(|| WalletError::NotFound(address.to_string())),
        }
    }

    /// Overwrites every cached balance with the replayed one.
    ///
    /// Addresses present in the replay but unknown here become shells,
    /// known wallets missing from the replay drop to zero.
    pub fn reset_balances(&mut self, replayed: &HashMap<Address, u64>) {
        for wallet in self.wallets.values_mut() {
            wallet.set_balance(replayed.get(&wallet.address).copied().unwrap_or(0));
        }
        for (address, balance) in replayed {
            self.wallets
                .entry(address.clone())
                .or_insert_with(|| Wallet::shell(address.clone()))
                .set_balance(*balance);
        }
    }

    /// All wallets, ordered by address
    pub fn wallets(&self) -> Vec<Wallet> {
        self.wallets.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Wallet> {
        self.wallets.values()
    }
}
