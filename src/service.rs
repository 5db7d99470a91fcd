//! Invoice actions as the CLI sees them.
//!
//! Every write takes one of two paths: a signed transaction from the owner
//! wallet, or a user operation from the owner's smart account when gasless
//! mode is on. The acting address differs between the two, so reads that
//! depend on "my invoices" ask `acting_address` first.

use chrono::Utc;
use ethers_core::types::{Address, Log, H256, U256};
use tracing::{info, warn};

use crate::aa::AccountAbstractionService;
use crate::db::{Database, UserOpStatus};
use crate::error::{Error, Result};
use crate::ledger::LedgerError;
use crate::models::{Invoice, InvoiceStatus, InvoiceSummary, NewInvoice, Role};
use crate::web3::abi::{self, Call};
use crate::web3::contracts::ContractManager;

/// How a write landed on chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    pub tx_hash: H256,
    /// Set when the write went through the smart account
    pub user_op_hash: Option<H256>,
    pub sponsored: bool,
}

pub struct InvoiceService {
    contracts: ContractManager,
    aa: Option<AccountAbstractionService>,
    db: Option<Database>,
}

impl InvoiceService {
    pub fn new(contracts: ContractManager) -> Self {
        Self {
            contracts,
            aa: None,
            db: None,
        }
    }

    /// Route writes through the smart account
    pub fn with_gasless(mut self, aa: AccountAbstractionService) -> Self {
        self.aa = Some(aa);
        self
    }

    pub fn with_database(mut self, db: Database) -> Self {
        self.db = Some(db);
        self
    }

    pub fn contracts(&self) -> &ContractManager {
        &self.contracts
    }

    pub fn database(&self) -> Option<&Database> {
        self.db.as_ref()
    }

    fn chain_id(&self) -> u64 {
        self.contracts.network().chain_id
    }

    /// The smart account in gasless mode, the owner wallet otherwise
    pub async fn acting_address(&self) -> Result<Address> {
        match &self.aa {
            Some(aa) => aa.account_address().await,
            None => self.contracts.account(),
        }
    }

    pub async fn create(&self, request: NewInvoice) -> Result<(u64, WriteReceipt)> {
        validate(&request)?;
        if request.client == self.acting_address().await? {
            return Err(LedgerError::InvalidClient.into());
        }
        let factory = self.contracts.network().invoice_factory()?;

        let (id, receipt) = match &self.aa {
            None => {
                let (id, receipt) = self.contracts.create_invoice(&request).await?;
                (id, self.direct(receipt.transaction_hash))
            }
            Some(aa) => {
                let call = Call::new(factory, abi::create_invoice(&request));
                let (receipt, logs) = self.send_gasless(aa, "create", None, &[call]).await?;
                let id = abi::invoice_created_id(&logs, factory)
                    .ok_or_else(|| Error::Abi("user operation emitted no InvoiceCreated event".into()))?;
                (id, receipt)
            }
        };

        info!(id, amount = %request.amount, client = ?request.client, "Invoice created");
        self.mirror(id).await;
        Ok((id, receipt))
    }

    /// Pay `id`, approving the factory for the invoice amount when needed
    pub async fn pay(&self, id: u64) -> Result<WriteReceipt> {
        let invoice = self.contracts.invoice(id).await?;
        if invoice.status != InvoiceStatus::Pending {
            return Err(LedgerError::NotPending { id, status: invoice.status }.into());
        }
        let payer = self.acting_address().await?;
        if payer != invoice.client {
            return Err(LedgerError::NotClient(id).into());
        }

        let receipt = match &self.aa {
            None => {
                let receipt = self.contracts.pay_invoice(id).await?;
                self.direct(receipt.transaction_hash)
            }
            Some(aa) => {
                let factory = self.contracts.network().invoice_factory()?;
                let usdc = self.contracts.network().usdc()?;

                let mut calls = Vec::with_capacity(2);
                let allowed = self.contracts.allowance(payer, factory).await?;
                if allowed < invoice.amount {
                    calls.push(Call::new(usdc, abi::approve(factory, invoice.amount)));
                }
                calls.push(Call::new(factory, abi::pay_invoice(id)));

                self.send_gasless(aa, "pay", Some(id), &calls).await?.0
            }
        };

        info!(id, tx = ?receipt.tx_hash, "Invoice paid");
        self.mirror(id).await;
        Ok(receipt)
    }

    pub async fn cancel(&self, id: u64) -> Result<WriteReceipt> {
        let invoice = self.contracts.invoice(id).await?;
        if invoice.status != InvoiceStatus::Pending {
            return Err(LedgerError::NotPending { id, status: invoice.status }.into());
        }
        if self.acting_address().await? != invoice.freelancer {
            return Err(LedgerError::NotFreelancer(id).into());
        }

        let receipt = match &self.aa {
            None => {
                let receipt = self.contracts.cancel_invoice(id).await?;
                self.direct(receipt.transaction_hash)
            }
            Some(aa) => {
                let factory = self.contracts.network().invoice_factory()?;
                let call = Call::new(factory, abi::cancel_invoice(id));
                self.send_gasless(aa, "cancel", Some(id), &[call]).await?.0
            }
        };

        info!(id, tx = ?receipt.tx_hash, "Invoice cancelled");
        self.mirror(id).await;
        Ok(receipt)
    }

    pub async fn approve(&self, amount: U256) -> Result<WriteReceipt> {
        let factory = self.contracts.network().invoice_factory()?;
        match &self.aa {
            None => {
                let receipt = self.contracts.approve(factory, amount).await?;
                Ok(self.direct(receipt.transaction_hash))
            }
            Some(aa) => {
                let call = Call::new(self.contracts.network().usdc()?, abi::approve(factory, amount));
                Ok(self.send_gasless(aa, "approve", None, &[call]).await?.0)
            }
        }
    }

    /// Mint mock USDC to the acting address
    pub async fn faucet(&self, amount: U256) -> Result<WriteReceipt> {
        let to = self.acting_address().await?;
        match &self.aa {
            None => {
                let receipt = self.contracts.mint(to, amount).await?;
                Ok(self.direct(receipt.transaction_hash))
            }
            Some(aa) => {
                let call = Call::new(self.contracts.network().usdc()?, abi::mint(to, amount));
                Ok(self.send_gasless(aa, "faucet", None, &[call]).await?.0)
            }
        }
    }

    /// Read `id` from the factory, with timestamps from the mirror. When the
    /// node is unreachable the mirrored copy is returned instead.
    pub async fn show(&self, id: u64) -> Result<Invoice> {
        let Some(db) = &self.db else {
            return self.contracts.invoice(id).await;
        };

        match self.contracts.invoice(id).await {
            Ok(invoice) => {
                let mirrored = db.get_invoice(self.chain_id(), id).await.unwrap_or_else(|e| {
                    warn!(id, error = %e, "Could not read mirrored invoice");
                    None
                });
                Ok(with_mirrored_times(invoice, mirrored))
            }
            Err(Error::Rpc(e)) => {
                warn!(id, error = %e, "Node unreachable, reading invoice from the database");
                db.get_invoice(self.chain_id(), id)
                    .await?
                    .ok_or(Error::Rpc(e))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn list(&self, role: Role) -> Result<Vec<Invoice>> {
        let address = self.acting_address().await?;
        let Some(db) = &self.db else {
            return self.contracts.invoices(role, address).await;
        };

        match self.contracts.invoices(role, address).await {
            Ok(invoices) => {
                let mirrored = db.invoices_by(self.chain_id(), role, address).await.unwrap_or_else(|e| {
                    warn!(error = %e, "Could not read mirrored invoices");
                    Vec::new()
                });
                Ok(invoices
                    .into_iter()
                    .map(|invoice| {
                        let copy = mirrored.iter().find(|m| m.id == invoice.id).cloned();
                        with_mirrored_times(invoice, copy)
                    })
                    .collect())
            }
            Err(Error::Rpc(e)) => {
                warn!(error = %e, "Node unreachable, listing invoices from the database");
                db.invoices_by(self.chain_id(), role, address).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn summary(&self, role: Role) -> Result<InvoiceSummary> {
        let invoices = self.list(role).await?;
        Ok(InvoiceSummary::from_invoices(&invoices, Utc::now()))
    }

    /// USDC balance of the acting address
    pub async fn balance(&self) -> Result<(Address, U256)> {
        let address = self.acting_address().await?;
        Ok((address, self.contracts.balance_of(address).await?))
    }

    /// Copy every invoice the acting address is party to into the database
    pub async fn sync(&self) -> Result<usize> {
        let db = self.db.as_ref().ok_or_else(|| Error::Config("DATABASE_URL is not set".into()))?;
        let address = self.acting_address().await?;
        let chain_id = self.chain_id();

        // An address can be both freelancer and client on different
        // invoices, so both indexes are walked
        let mut synced = 0;
        for role in [Role::Freelancer, Role::Client] {
            for invoice in self.contracts.invoices(role, address).await? {
                // The upsert keeps the first created_at and paid_at it saw
                db.upsert_invoice(chain_id, &invoice).await?;
                synced += 1;
            }
        }

        info!(synced, chain_id, "Invoices synced to database");
        Ok(synced)
    }

    fn direct(&self, tx_hash: H256) -> WriteReceipt {
        WriteReceipt {
            tx_hash,
            user_op_hash: None,
            sponsored: false,
        }
    }

    /// Run the user operation pipeline step by step so the database sees each stage
    async fn send_gasless(
        &self,
        aa: &AccountAbstractionService,
        action: &str,
        invoice_id: Option<u64>,
        calls: &[Call],
    ) -> Result<(WriteReceipt, Vec<Log>)> {
        let mut op = aa.build_user_operation(calls).await?;
        aa.attach_paymaster(&mut op).await?;
        aa.sign(&mut op).await?;
        // A rejected operation never reaches the bundler, so no row is recorded
        aa.simulate_validation(&op).await?;
        let hash = aa.submit(&op).await?;

        // From here on the bundler holds the operation; database trouble
        // must not hide that
        if let Some(db) = &self.db {
            if let Err(e) = db
                .record_user_operation(self.chain_id(), hash, op.sender, action, invoice_id, op.is_sponsored())
                .await
            {
                warn!(error = %e, "Could not record user operation");
            }
        }

        let outcome = aa.wait_for_receipt(hash).await;

        if let Some(db) = &self.db {
            // A timeout leaves the row as submitted
            let update = match &outcome {
                Ok(receipt) => Some((UserOpStatus::Included, Some(receipt.receipt.transaction_hash), None)),
                Err(Error::UserOpFailed { reason, .. }) => Some((UserOpStatus::Failed, None, Some(reason.as_str()))),
                Err(_) => None,
            };
            if let Some((status, tx_hash, error)) = update {
                if let Err(e) = db.update_user_operation(hash, status, tx_hash, error).await {
                    warn!(error = %e, "Could not update user operation");
                }
            }
        }

        let receipt = outcome?;
        let tx_hash = receipt.receipt.transaction_hash;
        let logs = if receipt.logs.is_empty() {
            receipt.receipt.logs
        } else {
            receipt.logs
        };

        Ok((
            WriteReceipt {
                tx_hash,
                user_op_hash: Some(hash),
                sponsored: op.is_sponsored(),
            },
            logs,
        ))
    }

    /// Refresh the database copy of one invoice; failures only warn
    async fn mirror(&self, id: u64) {
        let Some(db) = &self.db else {
            return;
        };

        let result = match self.contracts.invoice(id).await {
            Ok(mut invoice) => {
                // Called right after our own write, so now is the payment time
                if invoice.status == InvoiceStatus::Paid {
                    invoice.paid_at = Some(Utc::now());
                }
                db.upsert_invoice(self.chain_id(), &invoice).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(id, error = %e, "Could not mirror invoice");
        }
    }
}

/// Chain state with the timestamps only the mirror knows
fn with_mirrored_times(mut invoice: Invoice, mirrored: Option<Invoice>) -> Invoice {
    if let Some(copy) = mirrored {
        invoice.created_at = invoice.created_at.or(copy.created_at);
        invoice.paid_at = invoice.paid_at.or(copy.paid_at);
    }
    invoice
}

/// Reject requests the factory would revert on
fn validate(request: &NewInvoice) -> Result<()> {
    if request.amount.is_zero() {
        return Err(LedgerError::InvalidAmount.into());
    }
    if request.client.is_zero() {
        return Err(LedgerError::InvalidClient.into());
    }
    if request.token.is_zero() {
        return Err(LedgerError::InvalidToken.into());
    }
    if request.description.trim().is_empty() {
        return Err(LedgerError::EmptyDescription.into());
    }
    if request.due_date <= Utc::now() {
        return Err(LedgerError::DueDateInPast.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aa::PaymasterMode;
    use crate::rpc::mock::MockTransport;
    use crate::web3::network::{Network, NetworkManager, ANVIL};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use ethers_core::abi::{encode, Token};
    use ethers_core::types::Bytes;
    use ethers_core::utils::keccak256;
    use ethers_signers::LocalWallet;
    use serde_json::json;
    use std::str::FromStr;
    use std::sync::Arc;
    use std::time::Duration;

    const ANVIL_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const FACTORY: Address = Address::repeat_byte(0xf0);
    const USDC: Address = Address::repeat_byte(0x33);
    const ACCOUNT: Address = Address::repeat_byte(0xac);

    fn network() -> Network {
        let mut network = NetworkManager::builtin().get(ANVIL).unwrap().clone();
        network.invoice_factory = Some(FACTORY);
        network.usdc = Some(USDC);
        network
    }

    fn wallet() -> LocalWallet {
        LocalWallet::from_str(ANVIL_KEY).unwrap()
    }

    fn contracts(node: Arc<MockTransport>) -> ContractManager {
        ContractManager::new(node, network(), Some(wallet()))
            .with_polling(Duration::from_millis(1), Duration::from_millis(200))
    }

    fn invoice(id: u64, client: Address, status: InvoiceStatus, due_in_days: i64) -> Invoice {
        Invoice {
            id,
            freelancer: Address::repeat_byte(0x11),
            client,
            token: USDC,
            amount: U256::from(250_000_000u64),
            description: "Logo design".into(),
            due_date: Utc::now() + ChronoDuration::days(due_in_days),
            status,
            created_at: None,
            paid_at: None,
        }
    }

    fn gasless_node() -> Arc<MockTransport> {
        let node = MockTransport::new();
        node.respond_call(abi::selector(abi::GET_ADDRESS), &encode(&[Token::Address(ACCOUNT)]))
            .respond_call(abi::selector(abi::GET_NONCE), &encode(&[Token::Uint(U256::zero())]))
            .respond("eth_getCode", json!("0x6080"))
            .respond("eth_gasPrice", json!("0x3b9aca00"))
            .respond("eth_maxPriorityFeePerGas", json!("0x5f5e100"))
            .revert_call(abi::selector(abi::SIMULATE_VALIDATION), &abi::selector(abi::VALIDATION_RESULT));
        Arc::new(node)
    }

    fn bundler(logs: serde_json::Value) -> Arc<MockTransport> {
        let bundler = MockTransport::new();
        bundler
            .respond(
                "eth_estimateUserOperationGas",
                json!({
                    "preVerificationGas": "0xb5e8",
                    "verificationGasLimit": "0x186a0",
                    "callGasLimit": "0x11170"
                }),
            )
            .respond("eth_sendUserOperation", json!(format!("{:?}", H256::repeat_byte(0x0e))))
            .respond(
                "eth_getUserOperationReceipt",
                json!({
                    "userOpHash": format!("{:?}", H256::repeat_byte(0x0e)),
                    "sender": format!("{:?}", ACCOUNT),
                    "nonce": "0x0",
                    "paymaster": format!("{:?}", Address::repeat_byte(0x42)),
                    "actualGasCost": "0x1",
                    "actualGasUsed": "0x1",
                    "success": true,
                    "logs": logs,
                    "receipt": {
                        "transactionHash": format!("{:?}", H256::repeat_byte(0xbb)),
                        "transactionIndex": "0x0",
                        "from": "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266",
                        "cumulativeGasUsed": "0x1",
                        "logs": [],
                        "status": "0x1",
                        "logsBloom": format!("0x{}", "00".repeat(256))
                    }
                }),
            );
        Arc::new(bundler)
    }

    fn gasless_service(node: Arc<MockTransport>, bundler: Arc<MockTransport>) -> InvoiceService {
        let paymaster = PaymasterMode::Static(Bytes::from(vec![0x42; 20]));
        let aa = AccountAbstractionService::new(node.clone(), bundler, wallet(), &network(), paymaster)
            .with_polling(Duration::from_millis(1), Duration::from_millis(200));
        InvoiceService::new(contracts(node)).with_gasless(aa)
    }

    fn request(due_in_days: i64) -> NewInvoice {
        NewInvoice {
            client: Address::repeat_byte(0x22),
            token: USDC,
            amount: U256::from(1_000_000u64),
            description: "Website copy".into(),
            due_date: Utc::now() + ChronoDuration::days(due_in_days),
        }
    }

    #[tokio::test]
    async fn rejects_invalid_requests_before_sending() {
        let node = Arc::new(MockTransport::new());
        let service = InvoiceService::new(contracts(node.clone()));

        let mut zero = request(7);
        zero.amount = U256::zero();
        assert!(matches!(
            service.create(zero).await,
            Err(Error::Ledger(LedgerError::InvalidAmount))
        ));
        assert!(matches!(
            service.create(request(-1)).await,
            Err(Error::Ledger(LedgerError::DueDateInPast))
        ));
        assert!(node.calls().is_empty());

        let mut to_self = request(7);
        to_self.client = wallet_address();
        assert!(matches!(
            service.create(to_self).await,
            Err(Error::Ledger(LedgerError::InvalidClient))
        ));
    }

    #[tokio::test]
    async fn paying_a_settled_invoice_fails_early() {
        let node = Arc::new(MockTransport::new());
        let paid = invoice(3, Address::repeat_byte(0x22), InvoiceStatus::Paid, 5);
        node.respond_call(abi::selector(abi::GET_INVOICE), &abi::encode_invoice(&paid));

        let err = InvoiceService::new(contracts(node.clone())).pay(3).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(LedgerError::NotPending { id: 3, status: InvoiceStatus::Paid })
        ));
        assert!(node.calls_to("eth_sendRawTransaction").is_empty());
    }

    #[tokio::test]
    async fn summary_counts_the_owner_invoices() {
        let node = Arc::new(MockTransport::new());
        let ids = encode(&[Token::Array(vec![Token::Uint(U256::from(9))])]);
        let overdue = invoice(9, wallet_address(), InvoiceStatus::Pending, -2);
        node.respond_call(abi::selector(abi::GET_CLIENT_INVOICES), &ids)
            .respond_call(abi::selector(abi::GET_INVOICE), &abi::encode_invoice(&overdue));

        let summary = InvoiceService::new(contracts(node.clone())).summary(Role::Client).await.unwrap();
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.overdue, 1);
        assert_eq!(summary.outstanding, U256::from(250_000_000u64));

        let asked = &node.calls_to("eth_call")[0];
        assert!(asked[0]["data"].as_str().unwrap().ends_with(&hex::encode(wallet_address())));
    }

    fn wallet_address() -> Address {
        use ethers_signers::Signer;
        wallet().address()
    }

    #[tokio::test]
    async fn gasless_pay_batches_approve_and_pay() {
        let node = gasless_node();
        node.respond_call(
            abi::selector(abi::GET_INVOICE),
            &abi::encode_invoice(&invoice(3, ACCOUNT, InvoiceStatus::Pending, 5)),
        )
        .respond_call(abi::selector(abi::ALLOWANCE), &encode(&[Token::Uint(U256::zero())]));
        let bundler = bundler(json!([]));

        let receipt = gasless_service(node, bundler.clone()).pay(3).await.unwrap();
        assert_eq!(receipt.tx_hash, H256::repeat_byte(0xbb));
        assert_eq!(receipt.user_op_hash, Some(H256::repeat_byte(0x0e)));
        assert!(receipt.sponsored);

        let sent = &bundler.calls_to("eth_sendUserOperation")[0];
        let call_data = sent[0]["callData"].as_str().unwrap();
        assert!(call_data.starts_with(&format!("0x{}", hex::encode(abi::selector(abi::EXECUTE_BATCH)))));
    }

    #[tokio::test]
    async fn gasless_pay_skips_approve_with_enough_allowance() {
        let node = gasless_node();
        node.respond_call(
            abi::selector(abi::GET_INVOICE),
            &abi::encode_invoice(&invoice(3, ACCOUNT, InvoiceStatus::Pending, 5)),
        )
        .respond_call(abi::selector(abi::ALLOWANCE), &encode(&[Token::Uint(U256::MAX)]));
        let bundler = bundler(json!([]));

        gasless_service(node, bundler.clone()).pay(3).await.unwrap();

        let sent = &bundler.calls_to("eth_sendUserOperation")[0];
        let call_data = sent[0]["callData"].as_str().unwrap();
        assert!(call_data.starts_with(&format!("0x{}", hex::encode(abi::selector(abi::EXECUTE)))));
    }

    #[tokio::test]
    async fn gasless_pay_requires_the_client_account() {
        let node = gasless_node();
        node.respond_call(
            abi::selector(abi::GET_INVOICE),
            &abi::encode_invoice(&invoice(3, Address::repeat_byte(0x22), InvoiceStatus::Pending, 5)),
        );

        let err = gasless_service(node, bundler(json!([]))).pay(3).await.unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::NotClient(3))));
    }

    #[tokio::test]
    async fn gasless_create_reads_id_from_operation_logs() {
        let topic = H256::from(keccak256(abi::INVOICE_CREATED_EVENT.as_bytes()));
        let bundler = bundler(json!([{
            "address": format!("{:?}", FACTORY),
            "topics": [format!("{:?}", topic), format!("{:?}", H256::from_low_u64_be(31))],
            "data": "0x"
        }]));

        let (id, receipt) = gasless_service(gasless_node(), bundler).create(request(14)).await.unwrap();
        assert_eq!(id, 31);
        assert!(receipt.user_op_hash.is_some());
    }

    #[tokio::test]
    async fn only_the_client_pays() {
        let node = Arc::new(MockTransport::new());
        let someone_elses = invoice(3, Address::repeat_byte(0x22), InvoiceStatus::Pending, 5);
        node.respond_call(abi::selector(abi::GET_INVOICE), &abi::encode_invoice(&someone_elses));

        let err = InvoiceService::new(contracts(node.clone())).pay(3).await.unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::NotClient(3))));
        assert!(node.calls_to("eth_sendRawTransaction").is_empty());
        assert!(node.calls_to("eth_estimateGas").is_empty());
    }

    #[tokio::test]
    async fn only_the_freelancer_cancels() {
        let node = Arc::new(MockTransport::new());
        let billed_to_me = invoice(3, wallet_address(), InvoiceStatus::Pending, 5);
        node.respond_call(abi::selector(abi::GET_INVOICE), &abi::encode_invoice(&billed_to_me));

        let err = InvoiceService::new(contracts(node.clone())).cancel(3).await.unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::NotFreelancer(3))));
        assert!(node.calls_to("eth_sendRawTransaction").is_empty());
    }

    #[tokio::test]
    async fn gasless_cancel_by_a_stranger_sends_nothing() {
        let node = gasless_node();
        node.respond_call(
            abi::selector(abi::GET_INVOICE),
            &abi::encode_invoice(&invoice(3, Address::repeat_byte(0x22), InvoiceStatus::Pending, 5)),
        );
        let bundler = bundler(json!([]));

        let err = gasless_service(node, bundler.clone()).cancel(3).await.unwrap_err();
        assert!(matches!(err, Error::Ledger(LedgerError::NotFreelancer(3))));
        assert!(bundler.calls().is_empty());
    }

    #[tokio::test]
    async fn gasless_write_stops_when_validation_fails() {
        let node = gasless_node();
        let mut failed = abi::selector(abi::FAILED_OP).to_vec();
        failed.extend(encode(&[Token::Uint(U256::zero()), Token::String("AA33 reverted".into())]));
        node.revert_call(abi::selector(abi::SIMULATE_VALIDATION), &failed);
        let bundler = bundler(json!([]));

        let err = gasless_service(node, bundler.clone()).create(request(14)).await.unwrap_err();
        assert!(matches!(err, Error::UserOpRejected(_)));
        assert!(bundler.calls_to("eth_sendUserOperation").is_empty());
    }

    #[test]
    fn mirror_fills_in_timestamps() {
        let created = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let chain = invoice(4, wallet_address(), InvoiceStatus::Paid, 5);
        let mut mirrored = chain.clone();
        mirrored.created_at = Some(created);
        mirrored.paid_at = Some(created + ChronoDuration::days(1));

        let merged = with_mirrored_times(chain.clone(), Some(mirrored));
        assert_eq!(merged.created_at, Some(created));
        assert_eq!(merged.paid_at, Some(created + ChronoDuration::days(1)));
        assert_eq!(merged.status, InvoiceStatus::Paid);
        assert_eq!(with_mirrored_times(chain.clone(), None), chain);
    }

    #[tokio::test]
    async fn sync_needs_a_database() {
        let service = InvoiceService::new(contracts(Arc::new(MockTransport::new())));
        assert!(matches!(service.sync().await, Err(Error::Config(_))));
    }
}
