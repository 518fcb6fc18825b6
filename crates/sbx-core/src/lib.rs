// sbx-core: Error taxonomy, config, IDs, retry, observability.
// No internal sbx dependencies — this is the foundation crate.

pub mod config;
pub mod error;
pub mod naming;
pub mod observability;
pub mod retry;
pub mod time;

pub use config::Config;
pub use error::{Error, QuotaKind, Result};
