//! HTTP middleware and extractors for merchant-billing-service.

pub mod http_metrics;
pub mod merchant;

pub use http_metrics::http_metrics_middleware;
pub use merchant::{MerchantContext, MerchantRole};
