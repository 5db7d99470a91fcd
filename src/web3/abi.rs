//! Call encoders and return decoders for the contracts the app talks to:
//! the invoice factory, the USDC token, the smart account, its factory and
//! the EntryPoint.

use chrono::{TimeZone, Utc};
use ethers_core::abi::{decode, encode, ParamType, Token};
use ethers_core::types::{Address, Bytes, Log, H256, U256};
use ethers_core::utils::keccak256;

use crate::error::{Error, Result};
use crate::models::{Invoice, InvoiceStatus, NewInvoice, UserOperation};

pub const CREATE_INVOICE: &str = "createInvoice(address,uint256,address,string,uint256)";
pub const PAY_INVOICE: &str = "payInvoice(uint256)";
pub const CANCEL_INVOICE: &str = "cancelInvoice(uint256)";
pub const GET_INVOICE: &str = "getInvoice(uint256)";
pub const GET_FREELANCER_INVOICES: &str = "getFreelancerInvoices(address)";
pub const GET_CLIENT_INVOICES: &str = "getClientInvoices(address)";
pub const PLATFORM_FEE_BPS: &str = "platformFeeBps()";
pub const FEE_COLLECTOR: &str = "feeCollector()";
pub const INVOICE_CREATED_EVENT: &str = "InvoiceCreated(uint256,address,address,uint256)";

pub const BALANCE_OF: &str = "balanceOf(address)";
pub const ALLOWANCE: &str = "allowance(address,address)";
pub const APPROVE: &str = "approve(address,uint256)";
pub const DECIMALS: &str = "decimals()";
pub const SYMBOL: &str = "symbol()";
pub const MINT: &str = "mint(address,uint256)";

pub const EXECUTE: &str = "execute(address,uint256,bytes)";
pub const EXECUTE_BATCH: &str = "executeBatch(address[],bytes[])";
pub const CREATE_ACCOUNT: &str = "createAccount(address,uint256)";
pub const GET_ADDRESS: &str = "getAddress(address,uint256)";
pub const GET_NONCE: &str = "getNonce(address,uint192)";
pub const SIMULATE_VALIDATION: &str =
    "simulateValidation((address,uint256,bytes,bytes,uint256,uint256,uint256,uint256,uint256,bytes,bytes))";

// EntryPoint v0.6 revert payloads
pub const VALIDATION_RESULT: &str =
    "ValidationResult((uint256,uint256,bool,uint48,uint48,bytes),(uint256,uint256),(uint256,uint256),(uint256,uint256))";
pub const VALIDATION_RESULT_WITH_AGGREGATION: &str = "ValidationResultWithAggregation((uint256,uint256,bool,uint48,uint48,bytes),(uint256,uint256),(uint256,uint256),(uint256,uint256),(address,(uint256,uint256)))";
pub const FAILED_OP: &str = "FailedOp(uint256,string)";
pub const ERROR_STRING: &str = "Error(string)";

/// First four bytes of the keccak256 of a canonical function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn encode_call(signature: &str, args: &[Token]) -> Bytes {
    let mut data = selector(signature).to_vec();
    data.extend(encode(args));
    Bytes::from(data)
}

/// A single call made from the smart account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

impl Call {
    pub fn new(to: Address, data: Bytes) -> Self {
        Self {
            to,
            value: U256::zero(),
            data,
        }
    }
}

// Invoice factory

pub fn create_invoice(request: &NewInvoice) -> Bytes {
    encode_call(
        CREATE_INVOICE,
        &[
            Token::Address(request.client),
            Token::Uint(request.amount),
            Token::Address(request.token),
            Token::String(request.description.clone()),
            Token::Uint(U256::from(request.due_date.timestamp().max(0) as u64)),
        ],
    )
}

pub fn pay_invoice(id: u64) -> Bytes {
    encode_call(PAY_INVOICE, &[Token::Uint(U256::from(id))])
}

pub fn cancel_invoice(id: u64) -> Bytes {
    encode_call(CANCEL_INVOICE, &[Token::Uint(U256::from(id))])
}

pub fn get_invoice(id: u64) -> Bytes {
    encode_call(GET_INVOICE, &[Token::Uint(U256::from(id))])
}

pub fn get_freelancer_invoices(freelancer: Address) -> Bytes {
    encode_call(GET_FREELANCER_INVOICES, &[Token::Address(freelancer)])
}

pub fn get_client_invoices(client: Address) -> Bytes {
    encode_call(GET_CLIENT_INVOICES, &[Token::Address(client)])
}

/// `getInvoice` returns `(freelancer, client, amount, token, description,
/// dueDate, status)`; the id is the one asked for.
fn invoice_tuple() -> ParamType {
    ParamType::Tuple(vec![
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Address,
        ParamType::String,
        ParamType::Uint(256),
        ParamType::Uint(8),
    ])
}

#[cfg(test)]
pub(crate) fn encode_invoice(invoice: &Invoice) -> Vec<u8> {
    encode(&[Token::Tuple(vec![
        Token::Address(invoice.freelancer),
        Token::Address(invoice.client),
        Token::Uint(invoice.amount),
        Token::Address(invoice.token),
        Token::String(invoice.description.clone()),
        Token::Uint(U256::from(invoice.due_date.timestamp().max(0) as u64)),
        Token::Uint(U256::from(u8::from(invoice.status))),
    ])])
}

pub fn decode_invoice(id: u64, data: &[u8]) -> Result<Invoice> {
    let mut tokens = decode(&[invoice_tuple()], data)?;
    let fields = tokens
        .pop()
        .and_then(Token::into_tuple)
        .ok_or_else(|| Error::Abi("getInvoice did not return a tuple".into()))?;

    let mut fields = fields.into_iter();
    let mut next = || fields.next().ok_or_else(|| Error::Abi("getInvoice tuple is short".into()));

    let freelancer = address(next()?)?;
    let client = address(next()?)?;
    let amount = uint(next()?)?;
    let token = address(next()?)?;
    let description = next()?
        .into_string()
        .ok_or_else(|| Error::Abi("expected string".into()))?;
    let due_date = uint(next()?)?;
    let status = invoice_status(uint(next()?)?)?;

    Ok(Invoice {
        id,
        freelancer,
        client,
        token,
        amount,
        description,
        due_date: datetime(due_date),
        status,
        created_at: None,
        paid_at: None,
    })
}

fn invoice_status(value: U256) -> Result<InvoiceStatus> {
    if value.bits() > 8 {
        return Err(Error::Abi(format!("unknown invoice status {value}")));
    }
    InvoiceStatus::try_from(value.low_u64() as u8).map_err(Error::Abi)
}

pub fn decode_id_list(data: &[u8]) -> Result<Vec<u64>> {
    let tokens = decode(&[ParamType::Array(Box::new(ParamType::Uint(256)))], data)?;
    tokens
        .into_iter()
        .next()
        .and_then(Token::into_array)
        .ok_or_else(|| Error::Abi("expected uint256[]".into()))?
        .into_iter()
        .map(|t| uint(t).map(|v| v.low_u64()))
        .collect()
}

/// Id of the invoice announced by an `InvoiceCreated` log, if any
pub fn invoice_created_id(logs: &[Log], factory: Address) -> Option<u64> {
    let topic = H256::from(keccak256(INVOICE_CREATED_EVENT.as_bytes()));
    logs.iter()
        .filter(|log| log.address == factory)
        .find(|log| log.topics.first() == Some(&topic))
        .and_then(|log| log.topics.get(1))
        .map(|id| U256::from_big_endian(id.as_bytes()).low_u64())
}

// Token

pub fn balance_of(owner: Address) -> Bytes {
    encode_call(BALANCE_OF, &[Token::Address(owner)])
}

pub fn allowance(owner: Address, spender: Address) -> Bytes {
    encode_call(ALLOWANCE, &[Token::Address(owner), Token::Address(spender)])
}

pub fn approve(spender: Address, amount: U256) -> Bytes {
    encode_call(APPROVE, &[Token::Address(spender), Token::Uint(amount)])
}

pub fn mint(to: Address, amount: U256) -> Bytes {
    encode_call(MINT, &[Token::Address(to), Token::Uint(amount)])
}

// Smart account and EntryPoint

pub fn execute(call: &Call) -> Bytes {
    encode_call(
        EXECUTE,
        &[
            Token::Address(call.to),
            Token::Uint(call.value),
            Token::Bytes(call.data.to_vec()),
        ],
    )
}

/// SimpleAccount v0.6 `executeBatch` carries no values, so every call must be
/// value-free.
pub fn execute_batch(calls: &[Call]) -> Bytes {
    encode_call(
        EXECUTE_BATCH,
        &[
            Token::Array(calls.iter().map(|c| Token::Address(c.to)).collect()),
            Token::Array(calls.iter().map(|c| Token::Bytes(c.data.to_vec())).collect()),
        ],
    )
}

pub fn create_account(owner: Address, salt: U256) -> Bytes {
    encode_call(CREATE_ACCOUNT, &[Token::Address(owner), Token::Uint(salt)])
}

pub fn get_address(owner: Address, salt: U256) -> Bytes {
    encode_call(GET_ADDRESS, &[Token::Address(owner), Token::Uint(salt)])
}

pub fn get_nonce(sender: Address, key: U256) -> Bytes {
    encode_call(GET_NONCE, &[Token::Address(sender), Token::Uint(key)])
}

pub fn simulate_validation(op: &UserOperation) -> Bytes {
    encode_call(
        SIMULATE_VALIDATION,
        &[Token::Tuple(vec![
            Token::Address(op.sender),
            Token::Uint(op.nonce),
            Token::Bytes(op.init_code.to_vec()),
            Token::Bytes(op.call_data.to_vec()),
            Token::Uint(op.call_gas_limit),
            Token::Uint(op.verification_gas_limit),
            Token::Uint(op.pre_verification_gas),
            Token::Uint(op.max_fee_per_gas),
            Token::Uint(op.max_priority_fee_per_gas),
            Token::Bytes(op.paymaster_and_data.to_vec()),
            Token::Bytes(op.signature.to_vec()),
        ])],
    )
}

/// What a `simulateValidation` revert says about the operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Rejected(String),
}

pub fn decode_validation(revert: &[u8]) -> Result<Validation> {
    if revert.len() < 4 {
        return Err(Error::Abi("simulateValidation reverted without data".into()));
    }
    let (head, body) = revert.split_at(4);

    if head == selector(VALIDATION_RESULT) || head == selector(VALIDATION_RESULT_WITH_AGGREGATION) {
        return Ok(Validation::Valid);
    }
    if head == selector(FAILED_OP) {
        let mut tokens = decode(&[ParamType::Uint(256), ParamType::String], body)?;
        let reason = tokens.pop().and_then(Token::into_string).unwrap_or_default();
        return Ok(Validation::Rejected(reason));
    }
    if head == selector(ERROR_STRING) {
        let reason = decode_string(body)?;
        return Ok(Validation::Rejected(reason));
    }
    Err(Error::Abi(format!("unknown simulateValidation revert 0x{}", hex::encode(head))))
}

// Return decoders

pub fn decode_uint(data: &[u8]) -> Result<U256> {
    let token = decode(&[ParamType::Uint(256)], data)?
        .pop()
        .ok_or_else(|| Error::Abi("empty return data".into()))?;
    uint(token)
}

pub fn decode_address(data: &[u8]) -> Result<Address> {
    let token = decode(&[ParamType::Address], data)?
        .pop()
        .ok_or_else(|| Error::Abi("empty return data".into()))?;
    address(token)
}

pub fn decode_string(data: &[u8]) -> Result<String> {
    decode(&[ParamType::String], data)?
        .pop()
        .and_then(Token::into_string)
        .ok_or_else(|| Error::Abi("expected string".into()))
}

fn uint(token: Token) -> Result<U256> {
    token.into_uint().ok_or_else(|| Error::Abi("expected uint".into()))
}

fn address(token: Token) -> Result<Address> {
    token.into_address().ok_or_else(|| Error::Abi("expected address".into()))
}

fn datetime(seconds: U256) -> chrono::DateTime<Utc> {
    Utc.timestamp_opt(seconds.low_u64() as i64, 0)
        .single()
        .unwrap_or_default()
}
