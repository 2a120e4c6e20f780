//! Integer base-unit ("rao") amounts and their decimal display form.
//!
//! The chain denominates balances in 10^-9 of the native token. All
//! arithmetic stays in integers; floats never touch amounts.

use eyre::Context as _;

pub const TOKEN_DECIMALS: u32 = 9;

pub fn parse_amount_base(s: &str) -> eyre::Result<u128> {
    let s = s.trim();
    if s.is_empty() {
        eyre::bail!("empty amount");
    }
    let v: u128 = s.parse().context("parse base amount")?;
    Ok(v)
}

/// Parse a user-facing decimal amount ("1.5") into base units.
pub fn parse_amount_ui(s: &str) -> eyre::Result<u128> {
    let s = s.trim();
    if s.is_empty() {
        eyre::bail!("empty amount");
    }

    let (whole, frac) = match s.split_once('.') {
        Some((a, b)) => (a, b),
        None => (s, ""),
    };
    if whole.starts_with('-') {
        eyre::bail!("amount must be non-negative");
    }
    if frac.len() > TOKEN_DECIMALS as usize {
        eyre::bail!("too many decimal places (max {TOKEN_DECIMALS})");
    }

    let whole_v: u128 = if whole.is_empty() {
        0
    } else {
        whole.parse().context("parse whole part")?
    };
    let mut frac_s = frac.to_owned();
    while frac_s.len() < TOKEN_DECIMALS as usize {
        frac_s.push('0');
    }
    let frac_v: u128 = if frac_s.is_empty() {
        0
    } else {
        frac_s.parse().context("parse fractional part")?
    };

    let scale = 10_u128.pow(TOKEN_DECIMALS);
    whole_v
        .checked_mul(scale)
        .and_then(|x| x.checked_add(frac_v))
        .ok_or_else(|| eyre::eyre!("amount overflow"))
}

/// Format base units as a decimal string without trailing zeros.
pub fn format_amount(base: u128) -> String {
    let scale = 10_u128.pow(TOKEN_DECIMALS);
    let whole = base / scale;
    let frac = base % scale;
    if frac == 0 {
        return whole.to_string();
    }
    let mut frac_s = format!("{frac:0width$}", width = TOKEN_DECIMALS as usize);
    while frac_s.ends_with('0') {
        frac_s.pop();
    }
    format!("{whole}.{frac_s}")
}
