use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ethers_core::types::{Address, U256};
use serde::{Deserialize, Serialize};

/// Fees are expressed in basis points of the invoice amount
pub const BPS_DENOMINATOR: u64 = 10_000;

/// Lifecycle of an invoice. `Paid` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Cancelled,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Paid => "paid",
            InvoiceStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, InvoiceStatus::Pending)
    }
}

impl TryFrom<u8> for InvoiceStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(InvoiceStatus::Pending),
            1 => Ok(InvoiceStatus::Paid),
            2 => Ok(InvoiceStatus::Cancelled),
            other => Err(format!("unknown invoice status {other}")),
        }
    }
}

impl From<InvoiceStatus> for u8 {
    fn from(status: InvoiceStatus) -> Self {
        match status {
            InvoiceStatus::Pending => 0,
            InvoiceStatus::Paid => 1,
            InvoiceStatus::Cancelled => 2,
        }
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(InvoiceStatus::Pending),
            "paid" => Ok(InvoiceStatus::Paid),
            "cancelled" => Ok(InvoiceStatus::Cancelled),
            other => Err(format!("unknown invoice status '{other}'")),
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of an invoice an address is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Freelancer,
    Client,
}

/// An amount owed by a client to a freelancer in a given token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: u64,
    pub freelancer: Address,
    pub client: Address,
    pub token: Address,
    /// Token base units
    pub amount: U256,
    pub description: String,
    pub due_date: DateTime<Utc>,
    pub status: InvoiceStatus,
    /// The factory does not store timestamps; these come from the local
    /// ledger or the database mirror
    pub created_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl Invoice {
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == InvoiceStatus::Pending && self.due_date < now
    }

    pub fn fee_split(&self, fee_bps: u64) -> FeeSplit {
        FeeSplit::compute(self.amount, fee_bps)
    }
}

/// Parameters for a new invoice. The freelancer is whoever submits it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub client: Address,
    pub token: Address,
    pub amount: U256,
    pub description: String,
    pub due_date: DateTime<Utc>,
}

/// How a payment is divided between the freelancer and the fee collector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub fee: U256,
    pub payout: U256,
}

impl FeeSplit {
    /// Fee rounds down, so the freelancer never receives less than
    /// `amount - amount * fee_bps / 10_000`.
    pub fn compute(amount: U256, fee_bps: u64) -> Self {
        let fee = amount.full_mul(U256::from(fee_bps)) / U256::from(BPS_DENOMINATOR);
        // fee_bps <= 10_000 keeps the quotient within U256
        let fee = U256::try_from(fee).unwrap_or(amount).min(amount);

        Self {
            fee,
            payout: amount - fee,
        }
    }
}

/// Dashboard totals over a set of invoices
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvoiceSummary {
    pub pending: usize,
    pub paid: usize,
    pub cancelled: usize,
    pub overdue: usize,
    pub outstanding: U256,
    pub collected: U256,
}

impl InvoiceSummary {
    pub fn from_invoices(invoices: &[Invoice], now: DateTime<Utc>) -> Self {
        let mut summary = Self::default();

        for invoice in invoices {
            match invoice.status {
                InvoiceStatus::Pending => {
                    summary.pending += 1;
                    summary.outstanding = summary.outstanding.saturating_add(invoice.amount);
                    if invoice.is_overdue(now) {
                        summary.overdue += 1;
                    }
                }
                InvoiceStatus::Paid => {
                    summary.paid += 1;
                    summary.collected = summary.collected.saturating_add(invoice.amount);
                }
                InvoiceStatus::Cancelled => summary.cancelled += 1,
            }
        }

        summary
    }

    pub fn total(&self) -> usize {
        self.pending + self.paid + self.cancelled
    }
}
