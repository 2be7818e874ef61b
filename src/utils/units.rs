use primitive_types::U256;
use thiserror::Error;

/// Number of decimal places between ether and wei.
pub const ETHER_DECIMALS: u32 = 18;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitsError {
	#[error("invalid amount format: {0:?}")]
	InvalidFormat(String),
	#[error("negative amounts are not allowed: {0:?}")]
	Negative(String),
	#[error("amount {amount:?} has more than {decimals} fractional digits")]
	TooPrecise { amount: String, decimals: u32 },
	#[error("amount {0:?} does not fit in 256 bits")]
	Overflow(String),
}

/// Parse a decimal string into base units, exactly.
///
/// `"1.5"` with 18 decimals becomes `1500000000000000000`. No floating point is
/// involved, so every representable amount round-trips without loss.
pub fn parse_units(amount: &str, decimals: u32) -> Result<U256, UnitsError> {
	let trimmed = amount.trim();
	if trimmed.starts_with('-') {
		return Err(UnitsError::Negative(amount.to_string()));
	}
	let trimmed = trimmed.strip_prefix('+').unwrap_or(trimmed);

	let (whole, fraction) = match trimmed.split_once('.') {
		Some((whole, fraction)) => (whole, fraction),
		None => (trimmed, ""),
	};

	if whole.is_empty() && fraction.is_empty() {
		return Err(UnitsError::InvalidFormat(amount.to_string()));
	}
	if !whole.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
		return Err(UnitsError::InvalidFormat(amount.to_string()));
	}
	if fraction.len() > decimals as usize {
		return Err(UnitsError::TooPrecise {
			amount: amount.to_string(),
			decimals,
		});
	}

	let mut digits = String::with_capacity(whole.len() + decimals as usize);
	digits.push_str(whole);
	digits.push_str(fraction);
	digits.extend(std::iter::repeat_n('0', decimals as usize - fraction.len()));

	let digits = digits.trim_start_matches('0');
	if digits.is_empty() {
		return Ok(U256::zero());
	}

	U256::from_dec_str(digits).map_err(|_| UnitsError::Overflow(amount.to_string()))
}

/// Parse an ether amount into wei.
pub fn parse_ether(amount: &str) -> Result<U256, UnitsError> {
	parse_units(amount, ETHER_DECIMALS)
}
