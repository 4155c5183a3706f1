pub mod config;
pub mod error;
pub mod output;
pub mod scanner;
pub mod state;
pub mod target;

pub use error::ScanError;
pub use output::AssetResult;
pub use scanner::fingerprint_db::RuleStore;
pub use scanner::resolver::DnsServerPool;
pub use scanner::{ProbeSettings, Prober};
