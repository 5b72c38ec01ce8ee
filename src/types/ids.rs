//! Identifier newtypes shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

id_type!(
    /// A substrate-style chain id (e.g. "polkadot").
    ChainId
);
id_type!(
    /// An EVM-style network id (e.g. "1" for mainnet).
    NetworkId
);
id_type!(
    /// A token id, unique across all chains and networks
    /// (e.g. "polkadot-substrate-native-dot").
    TokenId
);
id_type!(
    /// An account address, opaque to the engine (SS58 or 0x-hex).
    AccountAddress
);
id_type!(
    /// Identifies a balance module implementation (token family),
    /// e.g. "substrate-native" or "evm-erc20".
    ModuleId
);

/// A chain or an EVM network: the two kinds of ledger the engine tracks.
///
/// Most of the engine is agnostic to the distinction; it only matters for
/// transport selection and genesis-hash account restrictions (networks carry
/// no genesis hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LedgerId {
    Chain(ChainId),
    Network(NetworkId),
}

impl LedgerId {
    pub fn as_str(&self) -> &str {
        match self {
            LedgerId::Chain(id) => id.as_str(),
            LedgerId::Network(id) => id.as_str(),
        }
    }

    pub fn as_chain(&self) -> Option<&ChainId> {
        match self {
            LedgerId::Chain(id) => Some(id),
            LedgerId::Network(_) => None,
        }
    }

    pub fn as_network(&self) -> Option<&NetworkId> {
        match self {
            LedgerId::Chain(_) => None,
            LedgerId::Network(id) => Some(id),
        }
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ChainId> for LedgerId {
    fn from(id: ChainId) -> Self {
        LedgerId::Chain(id)
    }
}

impl From<NetworkId> for LedgerId {
    fn from(id: NetworkId) -> Self {
        LedgerId::Network(id)
    }
}
