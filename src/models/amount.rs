use ethers_core::types::U256;
use ethers_core::utils::{format_units, parse_units};

use crate::error::{Error, Result};

/// USDC and the mock token both use six decimals
pub const USDC_DECIMALS: u32 = 6;

/// Parse a human amount such as `"125.50"` into token base units
pub fn parse_usdc(amount: &str) -> Result<U256> {
    let trimmed = amount.trim();
    if trimmed.is_empty() || trimmed.starts_with('-') {
        return Err(Error::InvalidAmount(amount.to_string()));
    }
    // parse_units would silently drop the extra digits
    if let Some((_, fraction)) = trimmed.split_once('.') {
        if fraction.len() > USDC_DECIMALS as usize {
            return Err(Error::InvalidAmount(format!(
                "{amount}: USDC has only {USDC_DECIMALS} decimals"
            )));
        }
    }

    let units = parse_units(trimmed, USDC_DECIMALS)
        .map_err(|e| Error::InvalidAmount(format!("{amount}: {e}")))?;

    Ok(units.into())
}

/// Format base units as a decimal string with at least two fraction digits
pub fn format_usdc(amount: U256) -> String {
    let formatted = match format_units(amount, USDC_DECIMALS) {
        Ok(s) => s,
        Err(_) => return amount.to_string(),
    };

    match formatted.split_once('.') {
        Some((whole, frac)) => {
            let mut frac = frac.trim_end_matches('0').to_string();
            while frac.len() < 2 {
                frac.push('0');
            }
            format!("{whole}.{frac}")
        }
        None => format!("{formatted}.00"),
    }
}
