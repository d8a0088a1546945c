pub mod client;
pub mod error;
pub mod precision;
pub mod rate_limit;
