//! HTTP handlers for merchant-billing-service.

pub mod balance;
pub mod subscription;
pub mod vouchers;
