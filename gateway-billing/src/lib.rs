pub mod config; // billing config file and environment
pub mod error; // error handling
pub mod health; // backend health monitoring and failover routing
pub mod kv; // counter store interface and implementations
pub mod mask; // API key masking for logs and admin output
pub mod observability; // log setup
pub mod rate_limit; // per-key request throttling
pub mod service; // wiring of the billing components
pub mod tariff; // per-key token and request limits
pub mod usage; // per-key token accounting

mod testing;

pub use config::BillingConfig;
pub use error::{Error, ErrorDetails};
pub use service::BillingService;
