use anyhow::Result;
use chrono::Utc;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use std::process::Command;
use tracing::{info, warn};

use crate::models::{format_usdc, Invoice};
use crate::web3::network::Network;

/// Service for generating invoice files in Markdown and PDF format
pub struct InvoiceGenerator {
    output_dir: String,
}

impl InvoiceGenerator {
    pub fn new(output_dir: &str) -> Result<Self> {
        let path = Path::new(output_dir);
        if !path.exists() {
            fs::create_dir_all(path)?;
        }

        Ok(Self {
            output_dir: output_dir.to_string(),
        })
    }

    /// Generate a Markdown invoice file and convert it to PDF using pandoc if available
    pub fn generate_invoice(&self, invoice: &Invoice, fee_bps: u64, network: &Network) -> Result<(String, String)> {
        let markdown = self.generate_markdown(invoice, fee_bps, network);

        let md_path = format!("{}/invoice_{}.md", self.output_dir, invoice.id);
        let pdf_path = format!("{}/invoice_{}.pdf", self.output_dir, invoice.id);

        let mut file = File::create(&md_path)?;
        file.write_all(markdown.as_bytes())?;

        match Command::new("pandoc").arg(&md_path).arg("-o").arg(&pdf_path).output() {
            Ok(output) if output.status.success() => {
                info!(path = %pdf_path, "Rendered invoice PDF");
            }
            Ok(output) => {
                warn!(error = %String::from_utf8_lossy(&output.stderr), "Failed to generate PDF");
                self.create_markdown_copy(&md_path, &pdf_path)?;
            }
            Err(e) => {
                warn!(error = %e, "Could not run pandoc");
                self.create_markdown_copy(&md_path, &pdf_path)?;
            }
        }

        Ok((md_path, pdf_path))
    }

    /// Copy the markdown to the .pdf path so a file is always there to share
    fn create_markdown_copy(&self, md_path: &str, pdf_path: &str) -> Result<()> {
        fs::copy(md_path, pdf_path)?;
        info!(path = %pdf_path, "Created markdown copy as PDF substitute");
        Ok(())
    }

    fn generate_markdown(&self, invoice: &Invoice, fee_bps: u64, network: &Network) -> String {
        let split = invoice.fee_split(fee_bps);
        let mut content = String::new();

        content.push_str(&format!("# Invoice #{}\n", invoice.id));
        match invoice.created_at {
            Some(created) => content.push_str(&format!(
                "Created {} on {}\n\n",
                created.format("%m/%d/%Y"),
                network.name
            )),
            None => content.push_str(&format!("Issued on {}\n\n", network.name)),
        }

        content.push_str("| | |\n|---|---|\n");
        content.push_str(&format!("| **From (freelancer)** | `{:?}` |\n", invoice.freelancer));
        content.push_str(&format!("| **Bill to (client)** | `{:?}` |\n", invoice.client));
        content.push_str(&format!("| **Token** | `{:?}` |\n", invoice.token));
        content.push_str(&format!("| **Due** | {} |\n", invoice.due_date.format("%m/%d/%Y")));

        let status = if invoice.is_overdue(Utc::now()) {
            format!("{} (overdue)", invoice.status)
        } else {
            invoice.status.to_string()
        };
        content.push_str(&format!("| **Status** | {status} |\n"));
        if let Some(paid_at) = invoice.paid_at {
            content.push_str(&format!("| **Paid** | {} |\n", paid_at.format("%m/%d/%Y %H:%M UTC")));
        }
        content.push('\n');

        content.push_str("## Description\n\n");
        content.push_str(&invoice.description);
        content.push_str("\n\n");

        content.push_str("## Amount\n\n");
        content.push_str("| Item | USDC |\n|---|---:|\n");
        content.push_str(&format!("| Invoice total | {} |\n", format_usdc(invoice.amount)));
        content.push_str(&format!(
            "| Platform fee ({:.2}%) | {} |\n",
            fee_bps as f64 / 100.0,
            format_usdc(split.fee)
        ));
        content.push_str(&format!("| Freelancer receives | **{}** |\n\n", format_usdc(split.payout)));

        content.push_str(&format!(
            "Pay on-chain by calling `payInvoice({})` on the invoice contract at `{}`.\n",
            invoice.id,
            network
                .invoice_factory
                .map(|a| format!("{a:?}"))
                .unwrap_or_else(|| "(not deployed)".to_string())
        ));

        content
    }
}
