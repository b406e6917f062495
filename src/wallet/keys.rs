use bip39::Mnemonic;
use bitcoin::bip32::{ChildNumber, DerivationPath, Fingerprint, Xpriv, Xpub};
use bitcoin::key::{rand, CompressedPublicKey};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Address, Network, PrivateKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::bitcoin::network::coin_type;
use crate::error::WalletError;

/// BIP84 chain selector (`account/<chain>/<index>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Receive,
    Change,
}

impl Chain {
    pub fn number(self) -> u32 {
        match self {
            Chain::Receive => 0,
            Chain::Change => 1,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Receive => write!(f, "receive"),
            Chain::Change => write!(f, "change"),
        }
    }
}

pub struct KeyManager;

impl KeyManager {
    /// Generate a new random 12-word mnemonic
    pub fn generate_mnemonic() -> Result<Mnemonic, WalletError> {
        let entropy = rand::random::<[u8; 16]>();

        Mnemonic::from_entropy(&entropy).map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
    }

    /// Parse and checksum-validate a recovery phrase
    pub fn parse_mnemonic(words: &str) -> Result<Mnemonic, WalletError> {
        Mnemonic::parse(words.trim()).map_err(|e| WalletError::InvalidMnemonic(e.to_string()))
    }
}

/// One derived key: the P2WPKH address and the public key behind it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedKey {
    pub chain: Chain,
    pub index: u32,
    pub address: Address,
    pub public_key: CompressedPublicKey,
}

/// Watch-only account key (`m/84'/coin'/0'`), enough to derive every address.
#[derive(Clone)]
pub struct AccountXpub {
    xpub: Xpub,
    network: Network,
    secp: Secp256k1<All>,
}

impl AccountXpub {
    pub fn network(&self) -> Network {
        self.network
    }

    /// Derive the P2WPKH address at `chain/index`. Pure: the same inputs always
    /// produce the same address.
    pub fn derive(&self, chain: Chain, index: u32) -> Result<DerivedKey, WalletError> {
        let path = relative_path(chain, index)?;
        let derived = self
            .xpub
            .derive_pub(&self.secp, &path)
            .map_err(|e| WalletError::derivation(format!("{}/{}", chain.number(), index), e))?;

        let public_key = CompressedPublicKey(derived.public_key);
        let address = Address::p2wpkh(&public_key, self.network);

        Ok(DerivedKey {
            chain,
            index,
            address,
            public_key,
        })
    }

    /// Derive `count` consecutive addresses starting at `start`
    pub fn derive_range(
        &self,
        chain: Chain,
        start: u32,
        count: u32,
    ) -> Result<Vec<DerivedKey>, WalletError> {
        (start..start.saturating_add(count))
            .map(|index| self.derive(chain, index))
            .collect()
    }
}

/// Full signing keys of one wallet, seeded from its recovery phrase.
///
/// Built on demand from the secret store and dropped after use; the wallet
/// record never holds it.
pub struct AccountKeys {
    master: Xpriv,
    fingerprint: Fingerprint,
    account_path: DerivationPath,
    account: AccountXpub,
}

impl AccountKeys {
    pub fn from_mnemonic(mnemonic: &Mnemonic, network: Network) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let seed = mnemonic.to_seed("");

        let master = Xpriv::new_master(network, &seed)
            .map_err(|e| WalletError::derivation("m", e))?;
        let fingerprint = master.fingerprint(&secp);

        let path_str = format!("m/84'/{}'/0'", coin_type(network));
        let account_path = DerivationPath::from_str(&path_str)
            .map_err(|e| WalletError::derivation(&path_str, e))?;

        let account_priv = master
            .derive_priv(&secp, &account_path)
            .map_err(|e| WalletError::derivation(&path_str, e))?;
        let xpub = Xpub::from_priv(&secp, &account_priv);

        Ok(Self {
            master,
            fingerprint,
            account_path,
            account: AccountXpub { xpub, network, secp },
        })
    }

    pub fn account_xpub(&self) -> AccountXpub {
        self.account.clone()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Full path from the master key for `chain/index`
    pub fn full_path(&self, chain: Chain, index: u32) -> Result<DerivationPath, WalletError> {
        Ok(self.account_path.extend(relative_path(chain, index)?))
    }

    pub fn derive_address(&self, chain: Chain, index: u32) -> Result<DerivedKey, WalletError> {
        self.account.derive(chain, index)
    }

    /// Derive the private key for `chain/index` from the master key
    pub fn derive_private_key(&self, chain: Chain, index: u32) -> Result<PrivateKey, WalletError> {
        let path = self.full_path(chain, index)?;
        let derived = self
            .master
            .derive_priv(&self.account.secp, &path)
            .map_err(|e| WalletError::derivation(path.to_string(), e))?;

        Ok(PrivateKey::new(derived.private_key, self.account.network))
    }
}

fn relative_path(chain: Chain, index: u32) -> Result<[ChildNumber; 2], WalletError> {
    let chain_child = ChildNumber::from_normal_idx(chain.number())
        .map_err(|e| WalletError::derivation(format!("{}/{}", chain.number(), index), e))?;
    let index_child = ChildNumber::from_normal_idx(index)
        .map_err(|e| WalletError::derivation(format!("{}/{}", chain.number(), index), e))?;
    Ok([chain_child, index_child])
}
