use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::store::AccountError;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ton,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
        }
    }
}

impl FromStr for Network {
    type Err = AccountError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            _ => Err(AccountError::InvalidId(format!("unknown network '{}'", s))),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Ton => write!(f, "ton"),
        }
    }
}

impl FromStr for Chain {
    type Err = AccountError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ton" => Ok(Chain::Ton),
            _ => Err(AccountError::InvalidId(format!("unknown chain '{}'", s))),
        }
    }
}

/// Composite account identifier, serialized as `{index}-{chain}-{network}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountId {
    pub index: u32,
    pub network: Network,
    pub chain: Chain,
}

impl AccountId {
    pub fn new(index: u32, network: Network, chain: Chain) -> Self {
        Self { index, network, chain }
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.index, self.chain, self.network)
    }
}

impl FromStr for AccountId {
    type Err = AccountError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('-');
        let (Some(index), Some(chain), Some(network), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(AccountError::InvalidId(s.to_string()));
        };

        let index = index
            .parse::<u32>()
            .map_err(|_| AccountError::InvalidId(s.to_string()))?;
        Ok(AccountId {
            index,
            chain: chain.parse()?,
            network: network.parse()?,
        })
    }
}

impl TryFrom<String> for AccountId {
    type Error = AccountError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AccountId> for String {
    fn from(id: AccountId) -> Self {
        id.to_string()
    }
}
