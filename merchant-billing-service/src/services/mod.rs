//! Services module for merchant-billing-service.

pub mod auto_switch;
pub mod database;
pub mod discount_client;
pub mod history;
pub mod metrics;
pub mod redemption;
pub mod visibility;

pub use auto_switch::{AutoSwitchEngine, AutoSwitchResult, SwitchAction};
pub use database::Database;
pub use discount_client::{DiscountCalculator, HttpDiscountClient};
pub use metrics::{
    get_metrics, init_metrics, record_auto_switch, record_error, record_http_request,
    record_redemption, record_store_visibility,
};
pub use redemption::{RedemptionResult, VoucherRedemptionService};
