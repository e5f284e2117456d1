//! Common utilities and types shared across the failover components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
