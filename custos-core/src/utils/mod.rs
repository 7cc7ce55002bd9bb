pub mod backoff;
pub mod units;
