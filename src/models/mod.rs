mod amount;
mod invoice;
mod user_operation;

pub use amount::{format_usdc, parse_usdc, USDC_DECIMALS};
pub use invoice::{FeeSplit, Invoice, InvoiceStatus, InvoiceSummary, NewInvoice, Role, BPS_DENOMINATOR};
pub use user_operation::UserOperation;
