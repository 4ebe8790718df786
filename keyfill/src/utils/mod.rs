//! Utility modules for keyfill

pub mod retry;

pub use retry::RetryPolicy;
