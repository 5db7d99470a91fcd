//! Gasless invoice actions through an EIP-4337 smart account.
//!
//! The pipeline is linear: build the call data and gas fields, attach the
//! paymaster, sign the operation hash with the owner key, dry-run the
//! validation against the EntryPoint, hand it to the bundler and wait for it
//! to be included.

mod paymaster;

pub use paymaster::{sponsor, PaymasterMode};

use std::sync::Arc;
use std::time::Duration;

use ethers_core::types::{Address, Bytes, Log, TransactionReceipt, H256, U256};
use ethers_signers::{LocalWallet, Signer};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::UserOperation;
use crate::rpc::{self, HttpTransport, RpcError, RpcTransport};
use crate::web3::abi::{self, Call, Validation};
use crate::web3::contracts::fee_data;
use crate::web3::network::Network;

/// JSON-RPC "method not found"; the only estimation failure that falls back
const METHOD_NOT_FOUND: i64 = -32601;

/// Well-formed 65-byte signature used only for gas estimation
const DUMMY_SIGNATURE: &str = "fffffffffffffffffffffffffffffff0000000000000000000000000000000007aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa1c";

/// Gas values used when the bundler has no estimation method
#[derive(Debug, Clone, Copy)]
pub struct GasDefaults {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    /// Extra verification gas when the account is deployed by this operation
    pub deployment_gas: U256,
    pub pre_verification_gas: U256,
}

impl Default for GasDefaults {
    fn default() -> Self {
        Self {
            call_gas_limit: U256::from(200_000),
            verification_gas_limit: U256::from(150_000),
            deployment_gas: U256::from(250_000),
            pre_verification_gas: U256::from(60_000),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GasEstimate {
    pre_verification_gas: U256,
    verification_gas_limit: U256,
    call_gas_limit: U256,
}

/// Result of an included user operation, as reported by the bundler
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOpReceipt {
    pub user_op_hash: H256,
    pub sender: Address,
    pub nonce: U256,
    #[serde(default)]
    pub paymaster: Option<Address>,
    pub actual_gas_cost: U256,
    pub actual_gas_used: U256,
    pub success: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub logs: Vec<Log>,
    pub receipt: TransactionReceipt,
}

pub struct AccountAbstractionService {
    node: Arc<dyn RpcTransport>,
    bundler: Arc<dyn RpcTransport>,
    owner: LocalWallet,
    chain_id: u64,
    entry_point: Address,
    account_factory: Address,
    salt: U256,
    paymaster: PaymasterMode,
    gas_defaults: GasDefaults,
    poll_interval: Duration,
    receipt_timeout: Duration,
}

impl AccountAbstractionService {
    pub fn new(
        node: Arc<dyn RpcTransport>,
        bundler: Arc<dyn RpcTransport>,
        owner: LocalWallet,
        network: &Network,
        paymaster: PaymasterMode,
    ) -> Self {
        Self {
            node,
            bundler,
            owner,
            chain_id: network.chain_id,
            entry_point: network.entry_point,
            account_factory: network.account_factory,
            salt: U256::zero(),
            paymaster,
            gas_defaults: GasDefaults::default(),
            poll_interval: Duration::from_secs(2),
            receipt_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_salt(mut self, salt: U256) -> Self {
        self.salt = salt;
        self
    }

    pub fn with_polling(mut self, interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = interval;
        self.receipt_timeout = timeout;
        self
    }

    pub fn owner(&self) -> Address {
        self.owner.address()
    }

    /// Counterfactual address of the owner's smart account
    pub async fn account_address(&self) -> Result<Address> {
        let request = json!({
            "to": self.account_factory,
            "data": abi::get_address(self.owner(), self.salt),
        });
        let data: Bytes = rpc::call(self.node.as_ref(), "eth_call", json!([request, "latest"])).await?;
        abi::decode_address(&data)
    }

    /// Factory call that deploys the account, or nothing when it already exists
    pub async fn init_code(&self, sender: Address) -> Result<Bytes> {
        let code: Bytes = rpc::call(self.node.as_ref(), "eth_getCode", json!([sender, "latest"])).await?;
        if !code.is_empty() {
            return Ok(Bytes::default());
        }

        let mut init_code = self.account_factory.as_bytes().to_vec();
        init_code.extend_from_slice(&abi::create_account(self.owner(), self.salt));
        debug!(?sender, "Account not deployed yet, attaching init code");
        Ok(Bytes::from(init_code))
    }

    pub async fn nonce(&self, sender: Address) -> Result<U256> {
        let request = json!({
            "to": self.entry_point,
            "data": abi::get_nonce(sender, U256::zero()),
        });
        let data: Bytes = rpc::call(self.node.as_ref(), "eth_call", json!([request, "latest"])).await?;
        abi::decode_uint(&data)
    }

    /// Unsigned operation carrying `calls`, with fees and gas filled in
    pub async fn build_user_operation(&self, calls: &[Call]) -> Result<UserOperation> {
        let call_data = match calls {
            [] => return Err(Error::Abi("a user operation needs at least one call".into())),
            [single] => abi::execute(single),
            many => {
                if many.iter().any(|c| !c.value.is_zero()) {
                    return Err(Error::Abi("batched calls cannot carry value".into()));
                }
                abi::execute_batch(many)
            }
        };

        let sender = self.account_address().await?;
        let init_code = self.init_code(sender).await?;
        let nonce = self.nonce(sender).await?;
        let (max_fee_per_gas, max_priority_fee_per_gas) = fee_data(self.node.as_ref()).await?;

        let mut op = UserOperation {
            sender,
            nonce,
            init_code,
            call_data,
            max_fee_per_gas,
            max_priority_fee_per_gas,
            signature: dummy_signature(),
            ..Default::default()
        };
        self.estimate_gas(&mut op).await?;

        Ok(op)
    }

    /// Fill the gas fields from the bundler. A revert during estimation is an
    /// error; only a bundler without the method gets the defaults.
    async fn estimate_gas(&self, op: &mut UserOperation) -> Result<()> {
        let estimate: std::result::Result<GasEstimate, RpcError> = rpc::call(
            self.bundler.as_ref(),
            "eth_estimateUserOperationGas",
            json!([&*op, self.entry_point]),
        )
        .await;

        match estimate {
            Ok(gas) => {
                op.pre_verification_gas = gas.pre_verification_gas;
                op.verification_gas_limit = gas.verification_gas_limit;
                op.call_gas_limit = gas.call_gas_limit;
            }
            Err(e) if e.code() == Some(METHOD_NOT_FOUND) => {
                warn!(error = %e, "Bundler cannot estimate gas, using defaults");
                let defaults = self.gas_defaults;
                op.pre_verification_gas = defaults.pre_verification_gas;
                op.call_gas_limit = defaults.call_gas_limit;
                op.verification_gas_limit = if op.init_code.is_empty() {
                    defaults.verification_gas_limit
                } else {
                    defaults.verification_gas_limit + defaults.deployment_gas
                };
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn attach_paymaster(&self, op: &mut UserOperation) -> Result<()> {
        match &self.paymaster {
            PaymasterMode::None => op.paymaster_and_data = Bytes::default(),
            PaymasterMode::Static(data) => op.paymaster_and_data = data.clone(),
            PaymasterMode::Sponsored { url, policy_id } => {
                let transport: Arc<dyn RpcTransport> = match url {
                    Some(url) => Arc::new(HttpTransport::new(url, self.receipt_timeout)?),
                    None => Arc::clone(&self.bundler),
                };
                sponsor(transport.as_ref(), op, self.entry_point, policy_id.as_deref()).await?;
            }
        }
        Ok(())
    }

    /// EIP-191 signature by the owner over the operation hash
    pub async fn sign(&self, op: &mut UserOperation) -> Result<H256> {
        let hash = op.hash(self.entry_point, self.chain_id);
        let signature = self.owner.sign_message(hash.as_bytes()).await?;
        op.signature = Bytes::from(signature.to_vec());
        Ok(hash)
    }

    /// Dry-run the signed operation through `EntryPoint.simulateValidation`.
    ///
    /// The v0.6 EntryPoint always reverts here: `ValidationResult` means the
    /// account and paymaster accepted the operation, `FailedOp` carries the
    /// reason they did not.
    pub async fn simulate_validation(&self, op: &UserOperation) -> Result<()> {
        let request = json!({
            "to": self.entry_point,
            "data": abi::simulate_validation(op),
        });
        let revert = match self.node.request("eth_call", json!([request, "latest"])).await {
            Ok(_) => return Err(Error::Abi("simulateValidation returned instead of reverting".into())),
            Err(RpcError::Node { data: Some(data), message, .. }) => revert_data(&data).ok_or(Error::UserOpRejected(message))?,
            Err(e) => return Err(e.into()),
        };

        match abi::decode_validation(&revert)? {
            Validation::Valid => {
                debug!(sender = ?op.sender, "User operation passed validation");
                Ok(())
            }
            Validation::Rejected(reason) => Err(Error::UserOpRejected(reason)),
        }
    }

    pub async fn submit(&self, op: &UserOperation) -> Result<H256> {
        let local = op.hash(self.entry_point, self.chain_id);
        let hash: H256 = rpc::call(
            self.bundler.as_ref(),
            "eth_sendUserOperation",
            json!([op, self.entry_point]),
        )
        .await?;

        if hash != local {
            warn!(bundler = ?hash, local = ?local, "Bundler returned a different user operation hash");
        }
        info!(
            ?hash,
            sender = ?op.sender,
            sponsored = op.is_sponsored(),
            max_cost = %op.max_cost(),
            "User operation submitted"
        );
        Ok(hash)
    }

    pub async fn wait_for_receipt(&self, hash: H256) -> Result<UserOpReceipt> {
        let bundler = self.bundler.as_ref();
        let receipt: UserOpReceipt = rpc::poll(
            &format!("user operation {hash:?}"),
            self.poll_interval,
            self.receipt_timeout,
            || rpc::call_optional(bundler, "eth_getUserOperationReceipt", json!([hash])),
        )
        .await?;

        if !receipt.success {
            return Err(Error::UserOpFailed {
                hash,
                reason: receipt.reason.unwrap_or_else(|| "execution reverted".to_string()),
            });
        }

        info!(?hash, tx = ?receipt.receipt.transaction_hash, gas_cost = %receipt.actual_gas_cost, "User operation included");
        Ok(receipt)
    }

    /// Run the whole pipeline for `calls`
    pub async fn send(&self, calls: &[Call]) -> Result<UserOpReceipt> {
        // Gas is estimated with a dummy signature, so the paymaster must be
        // attached to the final gas values before the owner signs
        let mut op = self.build_user_operation(calls).await?;
        self.attach_paymaster(&mut op).await?;
        self.sign(&mut op).await?;

        // Nothing reaches the bundler unless the EntryPoint would accept it
        self.simulate_validation(&op).await?;
        let hash = self.submit(&op).await?;
        self.wait_for_receipt(hash).await
    }
}

fn dummy_signature() -> Bytes {
    Bytes::from(hex::decode(DUMMY_SIGNATURE).unwrap_or_default())
}

/// Revert bytes from a node error's `data`, which is either the hex string
/// itself or an object wrapping it
fn revert_data(data: &serde_json::Value) -> Option<Vec<u8>> {
    let text = match data {
        serde_json::Value::String(text) => text.as_str(),
        serde_json::Value::Object(map) => map.get("data")?.as_str()?,
        _ => return None,
    };
    hex::decode(text.strip_prefix("0x").unwrap_or(text)).ok()
}
