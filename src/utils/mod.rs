//!
//! Utility module for the ledger bridge.
//!
//! Re-exports the ether/wei conversion used to validate deposit commands, and the
//! retry policy used wherever a network call is retried.
/// Exponential backoff settings
pub mod retry;
/// Decimal unit conversion between ether-style amounts and base units
pub mod units;

pub use retry::RetryPolicy;
pub use units::{UnitsError, parse_ether};
