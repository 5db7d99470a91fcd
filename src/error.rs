use ethers_core::types::{Address, H256};
use thiserror::Error;

use crate::ledger::LedgerError;
use crate::rpc::RpcError;

/// Errors surfaced by the chain-facing services
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("wallet error: {0}")]
    Wallet(#[from] ethers_signers::WalletError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("abi error: {0}")]
    Abi(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("wallet is not connected")]
    NotConnected,

    #[error("wallet is on chain {actual}, expected chain {expected}")]
    WrongNetwork { expected: u64, actual: u64 },

    #[error("chain {0} is not supported")]
    UnsupportedNetwork(u64),

    #[error("{0} is not deployed on chain {1}")]
    MissingContract(&'static str, u64),

    #[error("transaction {0:?} reverted")]
    Reverted(H256),

    #[error("user operation {hash:?} failed: {reason}")]
    UserOpFailed { hash: H256, reason: String },

    #[error("user operation rejected by the entry point: {0}")]
    UserOpRejected(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("invoice {0} not found on chain")]
    InvoiceNotFound(u64),

    #[error("account {0:?} does not control this wallet")]
    UnknownAccount(Address),
}

impl From<ethers_core::abi::Error> for Error {
    fn from(e: ethers_core::abi::Error) -> Self {
        Error::Abi(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
