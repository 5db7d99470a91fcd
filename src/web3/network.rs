use std::str::FromStr;

use ethers_core::types::{Address, H256};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};

pub const ENTRY_POINT_V06: &str = "0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789";
pub const SIMPLE_ACCOUNT_FACTORY_V06: &str = "0x9406Cc6185a346906296840746125a0E44976454";

pub const SCROLL_SEPOLIA: u64 = 534351;
pub const BASE_SEPOLIA: u64 = 84532;
pub const SEPOLIA: u64 = 11155111;
pub const ANVIL: u64 = 31337;

/// A chain the app knows how to reach, with its deployed contracts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Network {
    pub chain_id: u64,
    pub name: String,
    pub rpc_url: String,
    pub explorer_url: Option<String>,
    pub entry_point: Address,
    pub account_factory: Address,
    pub invoice_factory: Option<Address>,
    pub usdc: Option<Address>,
    pub bundler_url: Option<String>,
}

impl Network {
    pub fn invoice_factory(&self) -> Result<Address> {
        self.invoice_factory
            .ok_or(Error::MissingContract("invoice factory", self.chain_id))
    }

    pub fn usdc(&self) -> Result<Address> {
        self.usdc.ok_or(Error::MissingContract("USDC token", self.chain_id))
    }
}

/// Registry of supported chains
#[derive(Debug, Clone)]
pub struct NetworkManager {
    networks: Vec<Network>,
    default_chain_id: u64,
}

impl NetworkManager {
    pub fn new(networks: Vec<Network>, default_chain_id: u64) -> Self {
        Self {
            networks,
            default_chain_id,
        }
    }

    /// Scroll Sepolia (the default), Base Sepolia, Sepolia and a local Anvil node
    pub fn builtin() -> Self {
        let entry_point = parse_address(ENTRY_POINT_V06);
        let account_factory = parse_address(SIMPLE_ACCOUNT_FACTORY_V06);

        let network = |chain_id: u64, name: &str, rpc_url: &str, explorer_url: Option<&str>| Network {
            chain_id,
            name: name.to_string(),
            rpc_url: rpc_url.to_string(),
            explorer_url: explorer_url.map(str::to_string),
            entry_point,
            account_factory,
            invoice_factory: None,
            usdc: None,
            bundler_url: None,
        };

        Self::new(
            vec![
                network(
                    SCROLL_SEPOLIA,
                    "Scroll Sepolia",
                    "https://sepolia-rpc.scroll.io",
                    Some("https://sepolia.scrollscan.com"),
                ),
                network(BASE_SEPOLIA, "Base Sepolia", "https://sepolia.base.org", Some("https://sepolia.basescan.org")),
                network(SEPOLIA, "Sepolia", "https://rpc.sepolia.org", Some("https://sepolia.etherscan.io")),
                network(ANVIL, "Anvil", "http://127.0.0.1:8545", None),
            ],
            SCROLL_SEPOLIA,
        )
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut manager = Self::builtin();
        manager.apply_config(config)?;
        Ok(manager)
    }

    pub fn get(&self, chain_id: u64) -> Result<&Network> {
        self.networks
            .iter()
            .find(|n| n.chain_id == chain_id)
            .ok_or(Error::UnsupportedNetwork(chain_id))
    }

    pub fn is_supported(&self, chain_id: u64) -> bool {
        self.networks.iter().any(|n| n.chain_id == chain_id)
    }

    pub fn default_network(&self) -> Result<&Network> {
        self.get(self.default_chain_id)
    }

    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// Register a chain, replacing any existing entry with the same id
    pub fn add_network(&mut self, network: Network) {
        info!(chain_id = network.chain_id, name = %network.name, "Registering network");
        self.networks.retain(|n| n.chain_id != network.chain_id);
        self.networks.push(network);
    }

    /// A network for a chain only known from the command line or environment
    pub fn custom(chain_id: u64, name: Option<&str>, rpc_url: &str, explorer_url: Option<&str>) -> Network {
        Network {
            chain_id,
            name: name.map(str::to_string).unwrap_or_else(|| format!("Chain {chain_id}")),
            rpc_url: rpc_url.to_string(),
            explorer_url: explorer_url.map(str::to_string),
            entry_point: parse_address(ENTRY_POINT_V06),
            account_factory: parse_address(SIMPLE_ACCOUNT_FACTORY_V06),
            invoice_factory: None,
            usdc: None,
            bundler_url: None,
        }
    }

    /// Apply environment overrides to the configured chain and make it the default
    pub fn apply_config(&mut self, config: &Config) -> Result<()> {
        let chain_id = config.chain_id;
        let index = match self.networks.iter().position(|n| n.chain_id == chain_id) {
            Some(index) => index,
            None => {
                let rpc_url = config
                    .rpc_url
                    .clone()
                    .ok_or(Error::UnsupportedNetwork(chain_id))?;
                self.add_network(Self::custom(chain_id, None, &rpc_url, None));
                self.networks.len() - 1
            }
        };

        let network = &mut self.networks[index];
        if let Some(url) = &config.rpc_url {
            network.rpc_url = url.clone();
        }
        if let Some(url) = &config.bundler_url {
            network.bundler_url = Some(url.clone());
        }
        if let Some(address) = &config.invoice_factory_address {
            network.invoice_factory = Some(address_from_config("INVOICE_FACTORY_ADDRESS", address)?);
        }
        if let Some(address) = &config.usdc_address {
            network.usdc = Some(address_from_config("USDC_ADDRESS", address)?);
        }
        if let Some(address) = &config.entry_point_address {
            network.entry_point = address_from_config("ENTRY_POINT_ADDRESS", address)?;
        }
        if let Some(address) = &config.account_factory_address {
            network.account_factory = address_from_config("ACCOUNT_FACTORY_ADDRESS", address)?;
        }

        debug!(?network, "Network configured");
        self.default_chain_id = chain_id;
        Ok(())
    }

    pub fn explorer_tx_url(&self, chain_id: u64, hash: H256) -> Option<String> {
        let network = self.get(chain_id).ok()?;
        network
            .explorer_url
            .as_ref()
            .map(|base| format!("{}/tx/{:?}", base.trim_end_matches('/'), hash))
    }
}

fn address_from_config(key: &str, value: &str) -> Result<Address> {
    Address::from_str(value.trim()).map_err(|e| Error::Config(format!("{key}: {e}")))
}

fn parse_address(value: &str) -> Address {
    Address::from_str(value).unwrap_or_default()
}
