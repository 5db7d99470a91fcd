//! Wallet connection state and network selection.
//!
//! `Web3Service` owns the signer and the transport for the active network.
//! Contract access and the account-abstraction pipeline are built from it
//! only while the wallet is connected to a supported chain.

pub mod abi;
pub mod contracts;
pub mod network;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::{Address, U256};
use ethers_signers::{LocalWallet, Signer};
use serde_json::json;
use tracing::{info, warn};

use crate::aa::{AccountAbstractionService, PaymasterMode};
use crate::error::{Error, Result};
use crate::rpc::{self, HttpTransport, RpcTransport};
use contracts::ContractManager;
use network::{Network, NetworkManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting { chain_id: u64 },
    Connected { account: Address, chain_id: u64 },
    WrongNetwork { account: Address, chain_id: u64 },
}

/// Opens a transport to a network's node
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, network: &Network) -> Result<Arc<dyn RpcTransport>>;
}

pub struct HttpConnector {
    timeout: Duration,
}

impl HttpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn open(&self, network: &Network) -> Result<Arc<dyn RpcTransport>> {
        Ok(Arc::new(HttpTransport::new(&network.rpc_url, self.timeout)?))
    }
}

pub struct Web3Service {
    networks: NetworkManager,
    connector: Box<dyn Connector>,
    state: ConnectionState,
    wallet: Option<LocalWallet>,
    transport: Option<Arc<dyn RpcTransport>>,
    /// Chain whose node `transport` talks to
    bound_chain: Option<u64>,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl Web3Service {
    pub fn new(networks: NetworkManager, connector: Box<dyn Connector>) -> Self {
        Self {
            networks,
            connector,
            state: ConnectionState::Disconnected,
            wallet: None,
            transport: None,
            bound_chain: None,
            poll_interval: Duration::from_secs(2),
            receipt_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.receipt_timeout = timeout;
        self
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn networks(&self) -> &NetworkManager {
        &self.networks
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, ConnectionState::Connected { .. })
    }

    /// Chain id the signer stamps on transactions
    pub fn wallet_chain_id(&self) -> Option<u64> {
        self.wallet.as_ref().map(|w| w.chain_id())
    }

    /// Connect `wallet` to `chain_id`, ending in `Connected` or `WrongNetwork`
    pub async fn connect(&mut self, wallet: LocalWallet, chain_id: u64) -> Result<&ConnectionState> {
        let network = self.networks.get(chain_id)?.clone();
        let account = wallet.address();

        self.state = ConnectionState::Connecting { chain_id };
        self.wallet = Some(wallet.with_chain_id(chain_id));

        if let Err(e) = self.bind(&network, account).await {
            warn!(chain_id, error = %e, "Connection failed");
            self.reset();
            return Err(e);
        }

        Ok(&self.state)
    }

    /// Move the connection to another supported chain
    pub async fn switch_network(&mut self, chain_id: u64) -> Result<&ConnectionState> {
        let network = self.networks.get(chain_id)?.clone();
        let account = self.account().ok_or(Error::NotConnected)?;

        info!(chain_id, name = %network.name, "Switching network");
        let previous = std::mem::replace(&mut self.state, ConnectionState::Connecting { chain_id });
        let previous_chain = self.wallet_chain_id();
        self.wallet = self.wallet.take().map(|w| w.with_chain_id(chain_id));

        if let Err(e) = self.bind(&network, account).await {
            warn!(chain_id, error = %e, "Network switch failed");
            self.state = previous;
            if let Some(previous_chain) = previous_chain {
                self.wallet = self.wallet.take().map(|w| w.with_chain_id(previous_chain));
            }
            return Err(e);
        }

        Ok(&self.state)
    }

    /// Switch to `network`, registering it first when its chain is unknown
    pub async fn switch_or_add_network(&mut self, network: Network) -> Result<&ConnectionState> {
        let chain_id = network.chain_id;
        if !self.networks.is_supported(chain_id) {
            info!(chain_id, "Chain is not registered, adding it before switching");
            self.networks.add_network(network);
        }
        self.switch_network(chain_id).await
    }

    pub fn disconnect(&mut self) {
        info!("Wallet disconnected");
        self.reset();
    }

    /// The wallet reported a new account list
    pub fn on_accounts_changed(&mut self, accounts: &[Address]) {
        let Some(&first) = accounts.first() else {
            self.disconnect();
            return;
        };

        let held = self.wallet.as_ref().map(|w| w.address());
        if held != Some(first) {
            warn!(account = ?first, "Account is not held by the local signer, disconnecting");
            self.disconnect();
            return;
        }

        self.state = match &self.state {
            ConnectionState::WrongNetwork { chain_id, .. } => ConnectionState::WrongNetwork {
                account: first,
                chain_id: *chain_id,
            },
            ConnectionState::Connected { chain_id, .. } | ConnectionState::Connecting { chain_id } => {
                ConnectionState::Connected {
                    account: first,
                    chain_id: *chain_id,
                }
            }
            ConnectionState::Disconnected => ConnectionState::Disconnected,
        };
    }

    /// The node reported a chain change underneath the current connection.
    ///
    /// Only the chain the transport and signer are bound to counts as
    /// connected; anything else needs `switch_network`.
    pub fn on_chain_changed(&mut self, chain_id: u64) {
        let Some(account) = self.account() else {
            return;
        };

        self.state = if self.bound_chain == Some(chain_id) {
            ConnectionState::Connected { account, chain_id }
        } else {
            warn!(chain_id, bound = ?self.bound_chain, "Node moved off the bound chain");
            ConnectionState::WrongNetwork { account, chain_id }
        };
    }

    /// Ask the bound node for its chain id and apply the answer
    pub async fn refresh_chain(&mut self) -> Result<&ConnectionState> {
        let transport = self.transport.clone().ok_or(Error::NotConnected)?;
        let reported: U256 = rpc::call(transport.as_ref(), "eth_chainId", json!([])).await?;
        self.on_chain_changed(reported.low_u64());
        Ok(&self.state)
    }

    pub fn account(&self) -> Option<Address> {
        match self.state {
            ConnectionState::Connected { account, .. } | ConnectionState::WrongNetwork { account, .. } => {
                Some(account)
            }
            _ => None,
        }
    }

    /// Connected account and its network, or why there is none
    pub fn require_connected(&self) -> Result<(Address, &Network)> {
        match self.state {
            ConnectionState::Connected { account, chain_id } => Ok((account, self.networks.get(chain_id)?)),
            ConnectionState::WrongNetwork { chain_id, .. } => Err(Error::WrongNetwork {
                expected: self
                    .bound_chain
                    .or_else(|| self.networks.default_network().ok().map(|n| n.chain_id))
                    .unwrap_or_default(),
                actual: chain_id,
            }),
            _ => Err(Error::NotConnected),
        }
    }

    pub async fn native_balance(&self) -> Result<U256> {
        let (account, _) = self.require_connected()?;
        let transport = self.transport.as_ref().ok_or(Error::NotConnected)?;
        Ok(rpc::call(transport.as_ref(), "eth_getBalance", json!([account, "latest"])).await?)
    }

    pub fn contracts(&self) -> Result<ContractManager> {
        let (_, network) = self.require_connected()?;
        let transport = self.transport.clone().ok_or(Error::NotConnected)?;

        Ok(ContractManager::new(transport, network.clone(), self.wallet.clone())
            .with_polling(self.poll_interval, self.receipt_timeout))
    }

    /// Build the gasless pipeline for the connected network
    pub fn account_abstraction(
        &self,
        paymaster: PaymasterMode,
        salt: U256,
        timeout: Duration,
    ) -> Result<AccountAbstractionService> {
        let (_, network) = self.require_connected()?;
        let node = self.transport.clone().ok_or(Error::NotConnected)?;
        let wallet = self.wallet.clone().ok_or(Error::NotConnected)?;
        let bundler_url = network
            .bundler_url
            .as_deref()
            .ok_or_else(|| Error::Config(format!("no bundler configured for chain {}", network.chain_id)))?;
        let bundler: Arc<dyn RpcTransport> = Arc::new(HttpTransport::new(bundler_url, timeout)?);

        Ok(AccountAbstractionService::new(node, bundler, wallet, network, paymaster)
            .with_salt(salt)
            .with_polling(self.poll_interval, self.receipt_timeout))
    }

    async fn bind(&mut self, network: &Network, account: Address) -> Result<()> {
        let transport = self.connector.open(network).await?;
        let reported: U256 = rpc::call(transport.as_ref(), "eth_chainId", json!([])).await?;
        let reported = reported.low_u64();

        self.transport = Some(transport);
        self.bound_chain = Some(network.chain_id);
        self.state = if reported == network.chain_id {
            info!(account = ?account, chain_id = reported, "Wallet connected");
            ConnectionState::Connected {
                account,
                chain_id: reported,
            }
        } else {
            warn!(expected = network.chain_id, reported, "Node is on a different chain");
            ConnectionState::WrongNetwork {
                account,
                chain_id: reported,
            }
        };

        Ok(())
    }

    fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.wallet = None;
        self.transport = None;
        self.bound_chain = None;
    }
}
