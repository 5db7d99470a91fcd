use std::str::FromStr;

use chrono::{DateTime, Utc};
use ethers_core::types::{Address, H256, U256};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::BigDecimal;
use sqlx::PgPool;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::{Invoice, InvoiceStatus, Role};

/// Off-chain mirror of invoices and the log of submitted user operations
pub struct Database {
    pool: PgPool,
}

/// An `invoices` row
#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct InvoiceRow {
    pub chain_id: i64,
    pub invoice_id: i64,
    pub freelancer: String,
    pub client: String,
    pub token: String,
    pub amount: BigDecimal,
    pub description: String,
    pub due_date: DateTime<Utc>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl InvoiceRow {
    pub fn from_invoice(chain_id: u64, invoice: &Invoice) -> Result<Self> {
        let amount = BigDecimal::from_str(&invoice.amount.to_string())
            .map_err(|e| Error::InvalidAmount(e.to_string()))?;

        Ok(Self {
            chain_id: chain_id as i64,
            invoice_id: invoice.id as i64,
            freelancer: address_text(invoice.freelancer),
            client: address_text(invoice.client),
            token: address_text(invoice.token),
            amount,
            description: invoice.description.clone(),
            due_date: invoice.due_date,
            status: invoice.status.as_str().to_string(),
            // First sighting stands in for the creation time the chain lacks
            created_at: invoice.created_at.unwrap_or_else(Utc::now),
            paid_at: invoice.paid_at,
        })
    }

    pub fn into_invoice(self) -> Result<Invoice> {
        let amount = U256::from_dec_str(&self.amount.with_scale(0).to_string())
            .map_err(|e| Error::InvalidAmount(format!("{}: {e}", self.amount)))?;
        let status = InvoiceStatus::from_str(&self.status).map_err(Error::Config)?;

        Ok(Invoice {
            id: self.invoice_id as u64,
            freelancer: parse_address(&self.freelancer)?,
            client: parse_address(&self.client)?,
            token: parse_address(&self.token)?,
            amount,
            description: self.description,
            due_date: self.due_date,
            status,
            created_at: Some(self.created_at),
            paid_at: self.paid_at,
        })
    }
}

/// Where a submitted user operation stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserOpStatus {
    Submitted,
    Included,
    Failed,
}

impl UserOpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserOpStatus::Submitted => "submitted",
            UserOpStatus::Included => "included",
            UserOpStatus::Failed => "failed",
        }
    }
}

/// A `user_operations` row
#[derive(sqlx::FromRow, Debug, Clone)]
pub struct UserOperationRecord {
    pub user_op_hash: String,
    pub chain_id: i64,
    pub sender: String,
    pub action: String,
    pub invoice_id: Option<i64>,
    pub sponsored: bool,
    pub status: String,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const INVOICE_COLUMNS: &str = "chain_id, invoice_id, freelancer, client, token, amount, description, \
                               due_date, status, created_at, paid_at";

impl Database {
    /// Create a new Database instance with a connection pool
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn get_pool(&self) -> &PgPool {
        &self.pool
    }

    // Invoice mirror

    pub async fn upsert_invoice(&self, chain_id: u64, invoice: &Invoice) -> Result<()> {
        let row = InvoiceRow::from_invoice(chain_id, invoice)?;

        sqlx::query(
            r#"
            INSERT INTO invoices (chain_id, invoice_id, freelancer, client, token, amount,
                                  description, due_date, status, created_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (chain_id, invoice_id) DO UPDATE
            SET status = EXCLUDED.status,
                paid_at = COALESCE(invoices.paid_at, EXCLUDED.paid_at),
                synced_at = NOW()
            "#,
        )
        .bind(row.chain_id)
        .bind(row.invoice_id)
        .bind(&row.freelancer)
        .bind(&row.client)
        .bind(&row.token)
        .bind(&row.amount)
        .bind(&row.description)
        .bind(row.due_date)
        .bind(&row.status)
        .bind(row.created_at)
        .bind(row.paid_at)
        .execute(self.get_pool())
        .await?;

        debug!(chain_id, id = invoice.id, status = %invoice.status, "Invoice mirrored");
        Ok(())
    }

    pub async fn get_invoice(&self, chain_id: u64, id: u64) -> Result<Option<Invoice>> {
        let row = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE chain_id = $1 AND invoice_id = $2"
        ))
        .bind(chain_id as i64)
        .bind(id as i64)
        .fetch_optional(self.get_pool())
        .await?;

        row.map(InvoiceRow::into_invoice).transpose()
    }

    /// Mirrored invoices where `address` plays `role`
    pub async fn invoices_by(&self, chain_id: u64, role: Role, address: Address) -> Result<Vec<Invoice>> {
        let column = match role {
            Role::Freelancer => "freelancer",
            Role::Client => "client",
        };

        let rows = sqlx::query_as::<_, InvoiceRow>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE chain_id = $1 AND {column} = $2 ORDER BY due_date ASC"
        ))
        .bind(chain_id as i64)
        .bind(address_text(address))
        .fetch_all(self.get_pool())
        .await?;

        rows.into_iter().map(InvoiceRow::into_invoice).collect()
    }

    // User operation log

    pub async fn record_user_operation(
        &self,
        chain_id: u64,
        hash: H256,
        sender: Address,
        action: &str,
        invoice_id: Option<u64>,
        sponsored: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_operations (user_op_hash, chain_id, sender, action, invoice_id, sponsored, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_op_hash) DO NOTHING
            "#,
        )
        .bind(format!("{hash:?}"))
        .bind(chain_id as i64)
        .bind(address_text(sender))
        .bind(action)
        .bind(invoice_id.map(|id| id as i64))
        .bind(sponsored)
        .bind(UserOpStatus::Submitted.as_str())
        .execute(self.get_pool())
        .await?;

        info!(?hash, action, "User operation recorded");
        Ok(())
    }

    pub async fn update_user_operation(
        &self,
        hash: H256,
        status: UserOpStatus,
        tx_hash: Option<H256>,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE user_operations
            SET status = $1, tx_hash = COALESCE($2, tx_hash), error = $3, updated_at = NOW()
            WHERE user_op_hash = $4
            "#,
        )
        .bind(status.as_str())
        .bind(tx_hash.map(|h| format!("{h:?}")))
        .bind(error)
        .bind(format!("{hash:?}"))
        .execute(self.get_pool())
        .await?;

        Ok(())
    }

    pub async fn recent_user_operations(&self, chain_id: u64, sender: Address, limit: i64) -> Result<Vec<UserOperationRecord>> {
        let records = sqlx::query_as::<_, UserOperationRecord>(
            r#"
            SELECT user_op_hash, chain_id, sender, action, invoice_id, sponsored, status,
                   tx_hash, error, submitted_at, updated_at
            FROM user_operations
            WHERE chain_id = $1 AND sender = $2
            ORDER BY submitted_at DESC
            LIMIT $3
            "#,
        )
        .bind(chain_id as i64)
        .bind(address_text(sender))
        .bind(limit)
        .fetch_all(self.get_pool())
        .await?;

        Ok(records)
    }
}

fn address_text(address: Address) -> String {
    format!("{address:?}")
}

fn parse_address(text: &str) -> Result<Address> {
    Address::from_str(text).map_err(|e| Error::Config(format!("stored address {text}: {e}")))
}

/// Connect and bring the schema up to date
pub async fn init(database_url: &str) -> Result<Database> {
    let db = Database::new(database_url).await?;

    sqlx::migrate!().run(db.get_pool()).await?;
    info!("Database migrations applied");

    Ok(db)
}
