//! In-memory rendition of the invoice factory contract.
//!
//! `InvoiceBook` enforces the same rules the deployed contract does: ids are
//! assigned sequentially from 1, only pending invoices move, the client pays
//! and the freelancer cancels, and each payment is split between the
//! freelancer and a fixed fee collector.

mod token;

pub use token::{MockUsdc, TokenLedger};

use std::collections::HashMap;

use chrono::{DateTime, TimeZone, Utc};
use ethers_core::types::{Address, U256};
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{FeeSplit, Invoice, InvoiceStatus, NewInvoice, BPS_DENOMINATOR};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("invoice {0} does not exist")]
    InvoiceNotFound(u64),

    #[error("invoice {id} is {status}, not pending")]
    NotPending { id: u64, status: InvoiceStatus },

    #[error("only the client of invoice {0} can pay it")]
    NotClient(u64),

    #[error("only the freelancer of invoice {0} can cancel it")]
    NotFreelancer(u64),

    #[error("invoice amount must be greater than zero")]
    InvalidAmount,

    #[error("invalid client address")]
    InvalidClient,

    #[error("invalid token address")]
    InvalidToken,

    #[error("invoice description is empty")]
    EmptyDescription,

    #[error("due date must be in the future")]
    DueDateInPast,

    #[error("insufficient balance: needed {needed}, have {balance}")]
    InsufficientBalance { needed: U256, balance: U256 },

    #[error("insufficient allowance: needed {needed}, allowed {allowed}")]
    InsufficientAllowance { needed: U256, allowed: U256 },

    #[error("token {0:?} is not known to the ledger")]
    UnknownToken(Address),

    #[error("fee of {0} bps exceeds 100%")]
    InvalidFee(u64),
}

/// State changes, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerEvent {
    InvoiceCreated {
        id: u64,
        freelancer: Address,
        client: Address,
        amount: U256,
    },
    InvoicePaid {
        id: u64,
        client: Address,
        payout: U256,
        fee: U256,
    },
    InvoiceCancelled {
        id: u64,
    },
}

pub struct InvoiceBook<T: TokenLedger> {
    tokens: T,
    /// The address the book acts as when spending client allowances
    address: Address,
    fee_collector: Address,
    fee_bps: u64,
    next_id: u64,
    invoices: HashMap<u64, Invoice>,
    by_freelancer: HashMap<Address, Vec<u64>>,
    by_client: HashMap<Address, Vec<u64>>,
    events: Vec<LedgerEvent>,
}

impl<T: TokenLedger> InvoiceBook<T> {
    pub fn new(tokens: T, address: Address, fee_collector: Address, fee_bps: u64) -> Result<Self, LedgerError> {
        if fee_bps > BPS_DENOMINATOR {
            return Err(LedgerError::InvalidFee(fee_bps));
        }

        Ok(Self {
            tokens,
            address,
            fee_collector,
            fee_bps,
            next_id: 1,
            invoices: HashMap::new(),
            by_freelancer: HashMap::new(),
            by_client: HashMap::new(),
            events: Vec::new(),
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn fee_bps(&self) -> u64 {
        self.fee_bps
    }

    pub fn fee_collector(&self) -> Address {
        self.fee_collector
    }

    pub fn tokens(&self) -> &T {
        &self.tokens
    }

    pub fn tokens_mut(&mut self) -> &mut T {
        &mut self.tokens
    }

    pub fn invoice_count(&self) -> u64 {
        self.next_id - 1
    }

    pub fn create_invoice(&mut self, caller: Address, request: NewInvoice, now: u64) -> Result<u64, LedgerError> {
        if request.amount.is_zero() {
            return Err(LedgerError::InvalidAmount);
        }
        if request.client.is_zero() || request.client == caller {
            return Err(LedgerError::InvalidClient);
        }
        if request.token.is_zero() {
            return Err(LedgerError::InvalidToken);
        }
        if request.description.trim().is_empty() {
            return Err(LedgerError::EmptyDescription);
        }
        if request.due_date.timestamp() <= now as i64 {
            return Err(LedgerError::DueDateInPast);
        }

        let id = self.next_id;
        self.next_id += 1;

        let invoice = Invoice {
            id,
            freelancer: caller,
            client: request.client,
            token: request.token,
            amount: request.amount,
            description: request.description,
            due_date: request.due_date,
            status: InvoiceStatus::Pending,
            created_at: Some(timestamp(now)),
            paid_at: None,
        };

        self.by_freelancer.entry(caller).or_default().push(id);
        self.by_client.entry(invoice.client).or_default().push(id);
        self.events.push(LedgerEvent::InvoiceCreated {
            id,
            freelancer: caller,
            client: invoice.client,
            amount: invoice.amount,
        });

        info!(id, freelancer = ?caller, client = ?invoice.client, amount = %invoice.amount, "Invoice created");
        self.invoices.insert(id, invoice);

        Ok(id)
    }

    pub fn pay_invoice(&mut self, caller: Address, id: u64, now: u64) -> Result<FeeSplit, LedgerError> {
        let invoice = self.invoices.get(&id).ok_or(LedgerError::InvoiceNotFound(id))?;
        if invoice.status != InvoiceStatus::Pending {
            return Err(LedgerError::NotPending { id, status: invoice.status });
        }
        if invoice.client != caller {
            return Err(LedgerError::NotClient(id));
        }

        let (token, amount, freelancer) = (invoice.token, invoice.amount, invoice.freelancer);
        let split = FeeSplit::compute(amount, self.fee_bps);

        // Both legs must succeed, so check the full amount up front
        let allowed = self.tokens.allowance(token, caller, self.address)?;
        if allowed < amount {
            return Err(LedgerError::InsufficientAllowance { needed: amount, allowed });
        }
        let balance = self.tokens.balance_of(token, caller)?;
        if balance < amount {
            return Err(LedgerError::InsufficientBalance { needed: amount, balance });
        }

        self.tokens
            .transfer_from(token, self.address, caller, freelancer, split.payout)?;
        if !split.fee.is_zero() {
            self.tokens
                .transfer_from(token, self.address, caller, self.fee_collector, split.fee)?;
        }

        if let Some(invoice) = self.invoices.get_mut(&id) {
            invoice.status = InvoiceStatus::Paid;
            invoice.paid_at = Some(timestamp(now));
        }
        self.events.push(LedgerEvent::InvoicePaid {
            id,
            client: caller,
            payout: split.payout,
            fee: split.fee,
        });

        info!(id, payout = %split.payout, fee = %split.fee, "Invoice paid");
        Ok(split)
    }

    pub fn cancel_invoice(&mut self, caller: Address, id: u64) -> Result<(), LedgerError> {
        let invoice = self.invoices.get_mut(&id).ok_or(LedgerError::InvoiceNotFound(id))?;
        if invoice.status != InvoiceStatus::Pending {
            return Err(LedgerError::NotPending { id, status: invoice.status });
        }
        if invoice.freelancer != caller {
            return Err(LedgerError::NotFreelancer(id));
        }

        invoice.status = InvoiceStatus::Cancelled;
        self.events.push(LedgerEvent::InvoiceCancelled { id });

        info!(id, "Invoice cancelled");
        Ok(())
    }

    pub fn invoice(&self, id: u64) -> Result<&Invoice, LedgerError> {
        self.invoices.get(&id).ok_or(LedgerError::InvoiceNotFound(id))
    }

    pub fn freelancer_invoices(&self, freelancer: Address) -> &[u64] {
        self.by_freelancer.get(&freelancer).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn client_invoices(&self, client: Address) -> &[u64] {
        self.by_client.get(&client).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn drain_events(&mut self) -> Vec<LedgerEvent> {
        debug!(count = self.events.len(), "Draining ledger events");
        std::mem::take(&mut self.events)
    }
}

fn timestamp(secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const TOKEN: Address = Address::repeat_byte(0x55);
    const BOOK: Address = Address::repeat_byte(0xf0);
    const COLLECTOR: Address = Address::repeat_byte(0xfe);
    const FREELANCER: Address = Address::repeat_byte(0x11);
    const CLIENT: Address = Address::repeat_byte(0x22);
    const STRANGER: Address = Address::repeat_byte(0x99);
    const NOW: u64 = 1_700_000_000;

    fn book(fee_bps: u64) -> InvoiceBook<MockUsdc> {
        InvoiceBook::new(MockUsdc::with_token(TOKEN), BOOK, COLLECTOR, fee_bps).unwrap()
    }

    fn request(amount: u64) -> NewInvoice {
        NewInvoice {
            client: CLIENT,
            token: TOKEN,
            amount: U256::from(amount),
            description: "Website redesign".into(),
            due_date: timestamp(NOW) + Duration::days(14),
        }
    }

    fn fund_client(book: &mut InvoiceBook<MockUsdc>, amount: u64) {
        let usdc = book.tokens_mut();
        usdc.mint(TOKEN, CLIENT, U256::from(amount)).unwrap();
        usdc.approve(TOKEN, CLIENT, BOOK, U256::from(amount)).unwrap();
    }

    #[test]
    fn ids_are_sequential_and_indexed() {
        let mut book = book(100);
        let first = book.create_invoice(FREELANCER, request(1_000), NOW).unwrap();
        let second = book.create_invoice(FREELANCER, request(2_000), NOW).unwrap();

        assert_eq!((first, second), (1, 2));
        assert_eq!(book.invoice_count(), 2);
        assert_eq!(book.freelancer_invoices(FREELANCER), &[1, 2]);
        assert_eq!(book.client_invoices(CLIENT), &[1, 2]);
        assert!(book.client_invoices(STRANGER).is_empty());

        let invoice = book.invoice(1).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Pending);
        assert_eq!(invoice.freelancer, FREELANCER);
        assert_eq!(invoice.created_at.map(|t| t.timestamp()), Some(NOW as i64));
    }

    #[test]
    fn create_validates_input() {
        let mut book = book(100);

        assert_eq!(book.create_invoice(FREELANCER, request(0), NOW), Err(LedgerError::InvalidAmount));

        let mut own = request(10);
        own.client = FREELANCER;
        assert_eq!(book.create_invoice(FREELANCER, own, NOW), Err(LedgerError::InvalidClient));

        let mut zero_client = request(10);
        zero_client.client = Address::zero();
        assert_eq!(book.create_invoice(FREELANCER, zero_client, NOW), Err(LedgerError::InvalidClient));

        let mut no_token = request(10);
        no_token.token = Address::zero();
        assert_eq!(book.create_invoice(FREELANCER, no_token, NOW), Err(LedgerError::InvalidToken));

        let mut blank = request(10);
        blank.description = "   ".into();
        assert_eq!(book.create_invoice(FREELANCER, blank, NOW), Err(LedgerError::EmptyDescription));

        let mut late = request(10);
        late.due_date = timestamp(NOW);
        assert_eq!(book.create_invoice(FREELANCER, late, NOW), Err(LedgerError::DueDateInPast));

        assert_eq!(book.invoice_count(), 0);
    }

    #[test]
    fn payment_splits_fee_to_collector() {
        let mut book = book(250);
        let id = book.create_invoice(FREELANCER, request(1_000_000), NOW).unwrap();
        fund_client(&mut book, 1_000_000);

        let split = book.pay_invoice(CLIENT, id, NOW + 60).unwrap();
        assert_eq!(split.fee, U256::from(25_000));
        assert_eq!(split.payout, U256::from(975_000));

        let usdc = book.tokens();
        assert_eq!(usdc.balance_of(TOKEN, FREELANCER).unwrap(), U256::from(975_000));
        assert_eq!(usdc.balance_of(TOKEN, COLLECTOR).unwrap(), U256::from(25_000));
        assert_eq!(usdc.balance_of(TOKEN, CLIENT).unwrap(), U256::zero());

        let invoice = book.invoice(id).unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Paid);
        assert_eq!(invoice.paid_at.map(|t| t.timestamp()), Some((NOW + 60) as i64));
        assert_eq!(invoice.amount, U256::from(1_000_000));
    }

    #[test]
    fn only_client_can_pay() {
        let mut book = book(100);
        let id = book.create_invoice(FREELANCER, request(500), NOW).unwrap();
        fund_client(&mut book, 500);

        assert_eq!(book.pay_invoice(STRANGER, id, NOW), Err(LedgerError::NotClient(id)));
        assert_eq!(book.pay_invoice(FREELANCER, id, NOW), Err(LedgerError::NotClient(id)));
        assert_eq!(book.invoice(id).unwrap().status, InvoiceStatus::Pending);
    }

    #[test]
    fn only_freelancer_can_cancel() {
        let mut book = book(100);
        let id = book.create_invoice(FREELANCER, request(500), NOW).unwrap();

        assert_eq!(book.cancel_invoice(CLIENT, id), Err(LedgerError::NotFreelancer(id)));
        book.cancel_invoice(FREELANCER, id).unwrap();
        assert_eq!(book.invoice(id).unwrap().status, InvoiceStatus::Cancelled);
    }

    #[test]
    fn terminal_states_do_not_move() {
        let mut book = book(100);
        let paid = book.create_invoice(FREELANCER, request(500), NOW).unwrap();
        let cancelled = book.create_invoice(FREELANCER, request(500), NOW).unwrap();
        fund_client(&mut book, 1_000);

        book.pay_invoice(CLIENT, paid, NOW).unwrap();
        book.cancel_invoice(FREELANCER, cancelled).unwrap();

        assert!(matches!(book.pay_invoice(CLIENT, paid, NOW), Err(LedgerError::NotPending { .. })));
        assert!(matches!(book.cancel_invoice(FREELANCER, paid), Err(LedgerError::NotPending { .. })));
        assert!(matches!(book.pay_invoice(CLIENT, cancelled, NOW), Err(LedgerError::NotPending { .. })));
        assert!(matches!(book.cancel_invoice(FREELANCER, cancelled), Err(LedgerError::NotPending { .. })));

        // The cancelled invoice never drew on the client's allowance
        assert_eq!(book.tokens().balance_of(TOKEN, CLIENT).unwrap(), U256::from(500));
    }

    #[test]
    fn failed_payment_moves_nothing() {
        let mut book = book(100);
        let id = book.create_invoice(FREELANCER, request(1_000), NOW).unwrap();
        book.tokens_mut().mint(TOKEN, CLIENT, U256::from(1_000)).unwrap();
        book.tokens_mut().approve(TOKEN, CLIENT, BOOK, U256::from(995)).unwrap();

        let err = book.pay_invoice(CLIENT, id, NOW).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientAllowance { .. }));
        assert_eq!(book.tokens().balance_of(TOKEN, FREELANCER).unwrap(), U256::zero());
        assert_eq!(book.tokens().balance_of(TOKEN, CLIENT).unwrap(), U256::from(1_000));
        assert_eq!(book.invoice(id).unwrap().status, InvoiceStatus::Pending);
    }

    #[test]
    fn unknown_invoice_is_reported() {
        let mut book = book(100);
        assert_eq!(book.pay_invoice(CLIENT, 42, NOW), Err(LedgerError::InvoiceNotFound(42)));
        assert_eq!(book.cancel_invoice(FREELANCER, 42), Err(LedgerError::InvoiceNotFound(42)));
        assert!(book.invoice(42).is_err());
    }

    #[test]
    fn fee_above_hundred_percent_is_rejected() {
        let result = InvoiceBook::new(MockUsdc::new(), BOOK, COLLECTOR, 10_001);
        assert!(matches!(result, Err(LedgerError::InvalidFee(10_001))));
    }

    #[test]
    fn events_are_recorded_in_order() {
        let mut book = book(0);
        let id = book.create_invoice(FREELANCER, request(300), NOW).unwrap();
        fund_client(&mut book, 300);
        book.pay_invoice(CLIENT, id, NOW).unwrap();

        let events = book.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LedgerEvent::InvoiceCreated { id: 1, .. }));
        assert_eq!(
            events[1],
            LedgerEvent::InvoicePaid {
                id: 1,
                client: CLIENT,
                payout: U256::from(300),
                fee: U256::zero(),
            }
        );
        assert!(book.drain_events().is_empty());
    }
}
