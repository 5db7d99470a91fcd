use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, Eip1559TransactionRequest, TransactionReceipt, H256, U256, U64};
use ethers_signers::{LocalWallet, Signer};
use serde_json::json;
use tracing::{debug, info, warn};

use super::abi;
use super::network::Network;
use crate::error::{Error, Result};
use crate::models::{Invoice, NewInvoice, Role, USDC_DECIMALS};
use crate::rpc::{self, RpcTransport};

/// Priority fee used when the node cannot suggest one (1.5 gwei)
const FALLBACK_PRIORITY_FEE: u64 = 1_500_000_000;

/// Current EIP-1559 fees as `(max_fee_per_gas, max_priority_fee_per_gas)`
pub async fn fee_data(transport: &dyn RpcTransport) -> Result<(U256, U256)> {
    let gas_price: U256 = rpc::call(transport, "eth_gasPrice", json!([])).await?;
    let priority = match rpc::call::<U256>(transport, "eth_maxPriorityFeePerGas", json!([])).await {
        Ok(fee) => fee,
        Err(e) => {
            warn!(error = %e, "Node has no priority fee suggestion, using fallback");
            U256::from(FALLBACK_PRIORITY_FEE)
        }
    };

    Ok((gas_price.saturating_mul(U256::from(2)).saturating_add(priority), priority))
}

/// What the token contract says about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

/// Reads and writes against the invoice factory and token on one network
pub struct ContractManager {
    transport: Arc<dyn RpcTransport>,
    network: Network,
    wallet: Option<LocalWallet>,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl ContractManager {
    pub fn new(transport: Arc<dyn RpcTransport>, network: Network, wallet: Option<LocalWallet>) -> Self {
        let wallet = wallet.map(|w| w.with_chain_id(network.chain_id));
        Self {
            transport,
            network,
            wallet,
            poll_interval: Duration::from_secs(2),
            receipt_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.receipt_timeout = timeout;
        self
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn transport(&self) -> Arc<dyn RpcTransport> {
        Arc::clone(&self.transport)
    }

    pub fn account(&self) -> Result<Address> {
        Ok(self.wallet()?.address())
    }

    fn wallet(&self) -> Result<&LocalWallet> {
        self.wallet.as_ref().ok_or(Error::NotConnected)
    }

    pub async fn eth_call(&self, to: Address, data: Bytes) -> Result<Bytes> {
        let mut request = json!({ "to": to, "data": data });
        if let Some(wallet) = &self.wallet {
            request["from"] = json!(wallet.address());
        }
        Ok(rpc::call(self.transport.as_ref(), "eth_call", json!([request, "latest"])).await?)
    }

    // Invoice factory reads

    pub async fn invoice(&self, id: u64) -> Result<Invoice> {
        let factory = self.network.invoice_factory()?;
        let data = self.eth_call(factory, abi::get_invoice(id)).await?;
        let invoice = abi::decode_invoice(id, &data)?;

        // The contract returns an empty struct for unknown ids
        if invoice.freelancer.is_zero() {
            return Err(Error::InvoiceNotFound(id));
        }
        Ok(invoice)
    }

    pub async fn invoice_ids(&self, role: Role, address: Address) -> Result<Vec<u64>> {
        let factory = self.network.invoice_factory()?;
        let data = match role {
            Role::Freelancer => abi::get_freelancer_invoices(address),
            Role::Client => abi::get_client_invoices(address),
        };
        abi::decode_id_list(&self.eth_call(factory, data).await?)
    }

    pub async fn invoices(&self, role: Role, address: Address) -> Result<Vec<Invoice>> {
        let ids = self.invoice_ids(role, address).await?;
        let mut invoices = Vec::with_capacity(ids.len());
        for id in ids {
            invoices.push(self.invoice(id).await?);
        }
        Ok(invoices)
    }

    pub async fn platform_fee_bps(&self) -> Result<u64> {
        let factory = self.network.invoice_factory()?;
        let data = self.eth_call(factory, abi::encode_call(abi::PLATFORM_FEE_BPS, &[])).await?;
        Ok(abi::decode_uint(&data)?.low_u64())
    }

    pub async fn fee_collector(&self) -> Result<Address> {
        let factory = self.network.invoice_factory()?;
        let data = self.eth_call(factory, abi::encode_call(abi::FEE_COLLECTOR, &[])).await?;
        abi::decode_address(&data)
    }

    // Token reads

    pub async fn balance_of(&self, owner: Address) -> Result<U256> {
        let usdc = self.network.usdc()?;
        abi::decode_uint(&self.eth_call(usdc, abi::balance_of(owner)).await?)
    }

    pub async fn usdc_info(&self) -> Result<TokenInfo> {
        let usdc = self.network.usdc()?;
        let symbol = abi::decode_string(&self.eth_call(usdc, abi::encode_call(abi::SYMBOL, &[])).await?)?;
        let decimals = abi::decode_uint(&self.eth_call(usdc, abi::encode_call(abi::DECIMALS, &[])).await?)?;
        if decimals.bits() > 8 {
            return Err(Error::Abi(format!("{symbol} reports {decimals} decimals")));
        }
        let decimals = decimals.low_u64() as u8;

        // Amounts are parsed and printed at six decimals throughout
        if u32::from(decimals) != USDC_DECIMALS {
            warn!(%symbol, decimals, "Token does not use six decimals");
        }
        Ok(TokenInfo {
            address: usdc,
            symbol,
            decimals,
        })
    }

    pub async fn allowance(&self, owner: Address, spender: Address) -> Result<U256> {
        let usdc = self.network.usdc()?;
        abi::decode_uint(&self.eth_call(usdc, abi::allowance(owner, spender)).await?)
    }

    // Writes

    pub async fn create_invoice(&self, request: &NewInvoice) -> Result<(u64, TransactionReceipt)> {
        let factory = self.network.invoice_factory()?;
        let receipt = self.send_transaction(factory, abi::create_invoice(request)).await?;
        let id = abi::invoice_created_id(&receipt.logs, factory)
            .ok_or_else(|| Error::Abi("receipt has no InvoiceCreated event".into()))?;

        info!(id, tx = ?receipt.transaction_hash, "Invoice created on chain");
        Ok((id, receipt))
    }

    /// Pay an invoice, approving the factory first when the allowance is short
    pub async fn pay_invoice(&self, id: u64) -> Result<TransactionReceipt> {
        let factory = self.network.invoice_factory()?;
        let invoice = self.invoice(id).await?;
        let owner = self.account()?;

        let allowed = self.allowance(owner, factory).await?;
        if allowed < invoice.amount {
            debug!(id, %allowed, needed = %invoice.amount, "Approving factory before payment");
            self.approve(factory, invoice.amount).await?;
        }

        let receipt = self.send_transaction(factory, abi::pay_invoice(id)).await?;
        info!(id, tx = ?receipt.transaction_hash, "Invoice paid on chain");
        Ok(receipt)
    }

    pub async fn cancel_invoice(&self, id: u64) -> Result<TransactionReceipt> {
        let factory = self.network.invoice_factory()?;
        let receipt = self.send_transaction(factory, abi::cancel_invoice(id)).await?;
        info!(id, tx = ?receipt.transaction_hash, "Invoice cancelled on chain");
        Ok(receipt)
    }

    pub async fn approve(&self, spender: Address, amount: U256) -> Result<TransactionReceipt> {
        let usdc = self.network.usdc()?;
        self.send_transaction(usdc, abi::approve(spender, amount)).await
    }

    /// Mint from the mock token; fails against real USDC
    pub async fn mint(&self, to: Address, amount: U256) -> Result<TransactionReceipt> {
        let usdc = self.network.usdc()?;
        self.send_transaction(usdc, abi::mint(to, amount)).await
    }

    /// Sign and broadcast an EIP-1559 transaction, then wait for its receipt
    pub async fn send_transaction(&self, to: Address, data: Bytes) -> Result<TransactionReceipt> {
        let wallet = self.wallet()?;
        let from = wallet.address();
        let transport = self.transport.as_ref();

        let nonce: U256 = rpc::call(transport, "eth_getTransactionCount", json!([from, "pending"])).await?;
        let estimate: U256 = rpc::call(
            transport,
            "eth_estimateGas",
            json!([{ "from": from, "to": to, "data": data }]),
        )
        .await?;
        let gas = estimate.saturating_mul(U256::from(120)) / U256::from(100);
        let (max_fee, priority_fee) = fee_data(transport).await?;

        let tx: TypedTransaction = Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .nonce(nonce)
            .gas(gas)
            .max_fee_per_gas(max_fee)
            .max_priority_fee_per_gas(priority_fee)
            .chain_id(self.network.chain_id)
            .into();

        let signature = wallet.sign_transaction(&tx).await?;
        let raw = tx.rlp_signed(&signature);

        let hash: H256 = rpc::call(transport, "eth_sendRawTransaction", json!([raw])).await?;
        debug!(?hash, %nonce, %gas, "Transaction broadcast");

        self.wait_for_transaction(hash).await
    }

    pub async fn wait_for_transaction(&self, hash: H256) -> Result<TransactionReceipt> {
        let transport = self.transport.as_ref();
        let receipt: TransactionReceipt = rpc::poll(
            &format!("transaction {hash:?}"),
            self.poll_interval,
            self.receipt_timeout,
            || rpc::call_optional(transport, "eth_getTransactionReceipt", json!([hash])),
        )
        .await?;

        if receipt.status == Some(U64::zero()) {
            return Err(Error::Reverted(hash));
        }
        Ok(receipt)
    }
}
