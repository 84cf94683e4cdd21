//! Merchant billing: voucher redemption, balance ledger and the subscription
//! auto-switch engine, served over HTTP.

pub mod config;
pub mod dtos;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;

pub use startup::AppState;
