mod aa;
mod config;
mod db;
mod error;
mod invoice_gen;
mod ledger;
mod logging;
mod models;
mod rpc;
mod service;
mod web3;

use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use ethers_core::types::{Address, Bytes, U256};
use ethers_signers::LocalWallet;
use tracing::{info, warn};

use crate::aa::PaymasterMode;
use crate::config::Config;
use crate::error::Error;
use crate::invoice_gen::InvoiceGenerator;
use crate::ledger::{InvoiceBook, MockUsdc};
use crate::models::{format_usdc, parse_usdc, Invoice, InvoiceSummary, NewInvoice, Role};
use crate::service::{InvoiceService, WriteReceipt};
use crate::web3::network::{Network, NetworkManager};
use crate::web3::{ConnectionState, HttpConnector, Web3Service};

#[derive(Parser)]
#[command(name = "invoice-chain", version, about = "USDC invoices on an EVM chain")]
struct Cli {
    /// Send writes as sponsored user operations from the smart account
    #[arg(long, global = true)]
    gasless: bool,

    /// Chain id to use instead of CHAIN_ID
    #[arg(long, global = true)]
    chain: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Freelancer,
    Client,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Freelancer => Role::Freelancer,
            RoleArg::Client => Role::Client,
        }
    }
}

#[derive(Subcommand)]
enum NetworkAction {
    /// List supported networks
    List,
    /// Connect, then move the wallet to another chain
    Switch {
        chain_id: u64,
        /// Registers the chain when it is not built in or configured
        #[arg(long)]
        rpc_url: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        explorer_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum Command {
    /// Supported networks and switching between them
    Network {
        #[command(subcommand)]
        action: NetworkAction,
    },
    /// Connect and report wallet, chain and balances
    Status,
    /// Create an invoice billed to a client
    Create {
        #[arg(long)]
        client: String,
        /// Amount in USDC, e.g. 125.50
        #[arg(long)]
        amount: String,
        #[arg(long)]
        description: String,
        #[arg(long, default_value_t = 30)]
        due_in_days: i64,
    },
    /// Pay an invoice as its client
    Pay { id: u64 },
    /// Cancel a pending invoice as its freelancer
    Cancel { id: u64 },
    Show { id: u64 },
    List {
        #[arg(long, value_enum, default_value_t = RoleArg::Freelancer)]
        role: RoleArg,
    },
    Summary {
        #[arg(long, value_enum, default_value_t = RoleArg::Freelancer)]
        role: RoleArg,
    },
    /// USDC balance of the acting account
    Balance,
    /// Approve the invoice factory to spend USDC
    Approve { amount: String },
    /// Mint test USDC from the mock token
    Faucet {
        #[arg(default_value = "1000")]
        amount: String,
    },
    /// Mirror on-chain invoices into the database
    Sync,
    /// Recent user operations recorded in the database
    History {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Write an invoice to Markdown and PDF
    Export { id: u64 },
    /// Run a create and pay cycle against the in-memory ledger
    Simulate {
        #[arg(long, default_value = "250")]
        amount: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::init()?;
    if let Some(chain_id) = cli.chain {
        config.chain_id = chain_id;
    }
    logging::init_logging(&config)?;

    match cli.command {
        Command::Network { action: NetworkAction::List } => {
            print_networks(&NetworkManager::from_config(&config)?);
            Ok(())
        }
        Command::Network {
            action:
                NetworkAction::Switch {
                    chain_id,
                    rpc_url,
                    name,
                    explorer_url,
                },
        } => {
            let custom = rpc_url.map(|url| NetworkManager::custom(chain_id, name.as_deref(), &url, explorer_url.as_deref()));
            switch(&config, chain_id, custom).await
        }
        Command::Simulate { amount } => simulate(&config, &amount),
        command => run(command, &config, cli.gasless).await,
    }
}

async fn run(command: Command, config: &Config, gasless: bool) -> Result<()> {
    let mut web3 = connect(config).await?;

    if let Command::Status = command {
        return status(&mut web3, config).await;
    }

    let service = build_service(&web3, config, gasless).await?;
    let network = service.contracts().network().clone();

    match command {
        Command::Create {
            client,
            amount,
            description,
            due_in_days,
        } => {
            let request = NewInvoice {
                client: Address::from_str(&client).with_context(|| format!("invalid client address {client}"))?,
                token: network.usdc()?,
                amount: parse_usdc(&amount)?,
                description,
                due_date: Utc::now() + Duration::days(due_in_days),
            };
            let (id, receipt) = service.create(request).await?;
            println!("Created invoice #{id}");
            print_receipt(&web3, network.chain_id, &receipt);
        }
        Command::Pay { id } => {
            let receipt = service.pay(id).await?;
            println!("Paid invoice #{id}");
            print_receipt(&web3, network.chain_id, &receipt);
        }
        Command::Cancel { id } => {
            let receipt = service.cancel(id).await?;
            println!("Cancelled invoice #{id}");
            print_receipt(&web3, network.chain_id, &receipt);
        }
        Command::Show { id } => {
            let invoice = service.show(id).await?;
            let fee_bps = service.contracts().platform_fee_bps().await.unwrap_or(config.platform_fee_bps);
            print_invoice(&invoice, fee_bps);
        }
        Command::List { role } => {
            let invoices = service.list(role.into()).await?;
            if invoices.is_empty() {
                println!("No invoices");
            }
            for invoice in &invoices {
                print_invoice_line(invoice);
            }
        }
        Command::Summary { role } => {
            print_summary(&service.summary(role.into()).await?);
        }
        Command::Balance => {
            let (address, balance) = service.balance().await?;
            println!("{address:?}: {} USDC", format_usdc(balance));
        }
        Command::Approve { amount } => {
            let receipt = service.approve(parse_usdc(&amount)?).await?;
            println!("Approved {amount} USDC for the invoice factory");
            print_receipt(&web3, network.chain_id, &receipt);
        }
        Command::Faucet { amount } => {
            let receipt = service.faucet(parse_usdc(&amount)?).await?;
            println!("Minted {amount} test USDC");
            print_receipt(&web3, network.chain_id, &receipt);
        }
        Command::Sync => {
            let synced = service.sync().await?;
            println!("Synced {synced} invoices");
        }
        Command::History { limit } => {
            let db = service.database().ok_or_else(|| anyhow!("DATABASE_URL is not set"))?;
            let sender = service.acting_address().await?;
            for record in db.recent_user_operations(network.chain_id, sender, limit).await? {
                println!(
                    "{}  {:<8} {:<9} invoice={} sponsored={} {}",
                    record.submitted_at.format("%Y-%m-%d %H:%M"),
                    record.action,
                    record.status,
                    record.invoice_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
                    record.sponsored,
                    record.error.unwrap_or_default(),
                );
            }
        }
        Command::Export { id } => {
            let invoice = service.show(id).await?;
            let fee_bps = service.contracts().platform_fee_bps().await.unwrap_or(config.platform_fee_bps);
            let generator = InvoiceGenerator::new(&config.invoice_output_dir)?;
            let (md_path, pdf_path) = generator.generate_invoice(&invoice, fee_bps, &network)?;
            println!("Wrote {md_path} and {pdf_path}");
        }
        Command::Network { .. } | Command::Status | Command::Simulate { .. } => {
            unreachable!("handled before the service is built")
        }
    }

    Ok(())
}

fn wallet(config: &Config) -> Result<LocalWallet> {
    let key = config
        .private_key
        .as_deref()
        .ok_or_else(|| anyhow!("PRIVATE_KEY is not set"))?;
    LocalWallet::from_str(key.trim().trim_start_matches("0x")).context("PRIVATE_KEY is not a valid secp256k1 key")
}

async fn connect(config: &Config) -> Result<Web3Service> {
    let networks = NetworkManager::from_config(config)?;
    let mut web3 = Web3Service::new(networks, Box::new(HttpConnector::new(config.rpc_timeout())))
        .with_polling(config.poll_interval(), config.receipt_timeout());

    let state = web3.connect(wallet(config)?, config.chain_id).await?.clone();
    match state {
        ConnectionState::Connected { account, chain_id } => {
            info!(?account, chain_id, "Connected");
            Ok(web3)
        }
        ConnectionState::WrongNetwork { chain_id, .. } => {
            bail!("RPC node is on chain {chain_id}, expected {}", config.chain_id)
        }
        state => bail!("unexpected connection state {state:?}"),
    }
}

fn paymaster_mode(config: &Config) -> Result<PaymasterMode> {
    if let Some(data) = &config.paymaster_and_data {
        let data = Bytes::from_str(data.trim()).context("PAYMASTER_AND_DATA is not hex")?;
        return Ok(PaymasterMode::Static(data));
    }

    Ok(PaymasterMode::Sponsored {
        url: config.paymaster_url.clone(),
        policy_id: config.paymaster_policy_id.clone(),
    })
}

async fn build_service(web3: &Web3Service, config: &Config, gasless: bool) -> Result<InvoiceService> {
    let mut service = InvoiceService::new(web3.contracts()?);

    if gasless {
        let aa = web3.account_abstraction(paymaster_mode(config)?, U256::from(config.account_salt), config.rpc_timeout())?;
        info!(account = ?aa.account_address().await?, "Gasless mode through smart account");
        service = service.with_gasless(aa);
    }

    match config.database_url() {
        Some(url) => service = service.with_database(db::init(url).await?),
        None => warn!("DATABASE_URL is not set, invoices will not be mirrored"),
    }

    Ok(service)
}

async fn switch(config: &Config, chain_id: u64, custom: Option<Network>) -> Result<()> {
    let mut web3 = connect(config).await?;
    let state = match custom {
        Some(network) => web3.switch_or_add_network(network).await?.clone(),
        None => match web3.switch_network(chain_id).await {
            Ok(state) => state.clone(),
            Err(Error::UnsupportedNetwork(id)) => bail!("chain {id} is not registered, pass --rpc-url to add it"),
            Err(e) => return Err(e.into()),
        },
    };

    match state {
        ConnectionState::Connected { account, chain_id } => {
            let network = web3.networks().get(chain_id)?;
            println!("Switched {account:?} to {} ({chain_id})", network.name);
            Ok(())
        }
        ConnectionState::WrongNetwork { chain_id: reported, .. } => {
            bail!("node for chain {chain_id} reports chain {reported}")
        }
        state => bail!("unexpected connection state {state:?}"),
    }
}

async fn status(web3: &mut Web3Service, config: &Config) -> Result<()> {
    // The node may have been restarted on another chain since connecting
    web3.refresh_chain().await?;
    let (account, network) = web3.require_connected()?;
    println!("Network:  {} ({})", network.name, network.chain_id);
    println!("Account:  {account:?}");
    println!("Balance:  {} wei", web3.native_balance().await?);

    let contracts = web3.contracts()?;
    let symbol = match contracts.usdc_info().await {
        Ok(token) => {
            println!("Token:    {} at {:?}, {} decimals", token.symbol, token.address, token.decimals);
            token.symbol
        }
        Err(e) => {
            println!("Token:    unavailable ({e})");
            "USDC".to_string()
        }
    };
    match contracts.balance_of(account).await {
        Ok(balance) => println!("Holding:  {} {symbol}", format_usdc(balance)),
        Err(e) => println!("Holding:  unavailable ({e})"),
    }
    if let Ok(fee_bps) = contracts.platform_fee_bps().await {
        match contracts.fee_collector().await {
            Ok(collector) => println!("Fee:      {fee_bps} bps to {collector:?}"),
            Err(_) => println!("Fee:      {fee_bps} bps"),
        }
    }

    if network.bundler_url.is_some() {
        let aa = web3.account_abstraction(paymaster_mode(config)?, U256::from(config.account_salt), config.rpc_timeout())?;
        println!("Smart account: {:?}", aa.account_address().await?);
    }
    Ok(())
}

fn simulate(config: &Config, amount: &str) -> Result<()> {
    let token = Address::repeat_byte(0x55);
    let book_address = Address::repeat_byte(0xf0);
    let fee_collector = Address::repeat_byte(0xfe);
    let freelancer = Address::repeat_byte(0x11);
    let client = Address::repeat_byte(0x22);
    let amount = parse_usdc(amount)?;
    let now = Utc::now();

    let mut tokens = MockUsdc::with_token(token);
    tokens.mint(token, client, amount)?;
    tokens.approve(token, client, book_address, amount)?;

    let mut book = InvoiceBook::new(tokens, book_address, fee_collector, config.platform_fee_bps)?;
    let request = NewInvoice {
        client,
        token,
        amount,
        description: "Simulated engagement".into(),
        due_date: now + Duration::days(14),
    };
    let id = book.create_invoice(freelancer, request, now.timestamp() as u64)?;
    let split = book.pay_invoice(client, id, now.timestamp() as u64)?;

    println!("Ledger {:?}, fees to {:?}", book.address(), book.fee_collector());
    for event in book.drain_events() {
        println!("{event:?}");
    }
    print_invoice(book.invoice(id)?, book.fee_bps());
    println!("Freelancer received {} USDC, fee {} USDC", format_usdc(split.payout), format_usdc(split.fee));
    Ok(())
}

fn print_networks(networks: &NetworkManager) {
    for network in networks.networks() {
        let factory = network
            .invoice_factory
            .map(|a| format!("{a:?}"))
            .unwrap_or_else(|| "-".into());
        println!("{:>9}  {:<14} {}  factory={factory}", network.chain_id, network.name, network.rpc_url);
    }
}

fn print_receipt(web3: &Web3Service, chain_id: u64, receipt: &WriteReceipt) {
    match web3.networks().explorer_tx_url(chain_id, receipt.tx_hash) {
        Some(url) => println!("Transaction: {url}"),
        None => println!("Transaction: {:?}", receipt.tx_hash),
    }
    if let Some(hash) = receipt.user_op_hash {
        println!("User operation: {hash:?} (sponsored: {})", receipt.sponsored);
    }
}

fn print_invoice_line(invoice: &Invoice) {
    let overdue = if invoice.is_overdue(Utc::now()) { " overdue" } else { "" };
    println!(
        "#{:<5} {:>12} USDC  {:<9}{overdue}  due {}  {}",
        invoice.id,
        format_usdc(invoice.amount),
        invoice.status.as_str(),
        invoice.due_date.format("%Y-%m-%d"),
        invoice.description,
    );
}

fn print_invoice(invoice: &Invoice, fee_bps: u64) {
    let split = invoice.fee_split(fee_bps);
    println!("Invoice #{}", invoice.id);
    println!("  Freelancer: {:?}", invoice.freelancer);
    println!("  Client:     {:?}", invoice.client);
    println!("  Amount:     {} USDC", format_usdc(invoice.amount));
    println!("  Fee:        {} USDC ({fee_bps} bps)", format_usdc(split.fee));
    println!("  Payout:     {} USDC", format_usdc(split.payout));
    println!("  Status:     {}", invoice.status);
    println!("  Due:        {}", invoice.due_date.format("%Y-%m-%d"));
    if let Some(paid_at) = invoice.paid_at {
        println!("  Paid:       {}", paid_at.format("%Y-%m-%d %H:%M"));
    }
    println!("  {}", invoice.description);
}

fn print_summary(summary: &InvoiceSummary) {
    println!("Invoices:    {}", summary.total());
    println!("Pending:     {} ({} overdue)", summary.pending, summary.overdue);
    println!("Paid:        {}", summary.paid);
    println!("Cancelled:   {}", summary.cancelled);
    println!("Outstanding: {} USDC", format_usdc(summary.outstanding));
    println!("Collected:   {} USDC", format_usdc(summary.collected));
}
