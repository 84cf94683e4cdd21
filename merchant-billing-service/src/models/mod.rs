//! Domain models for merchant-billing-service.

mod balance;
mod merchant;
mod subscription;
mod voucher;

pub use balance::{BalanceTransaction, BalanceTransactionType, MerchantBalance};
pub use merchant::{MerchantAccount, PlanTerms};
pub use subscription::{
    add_days, HistoryEventType, MerchantSubscription, NewHistoryEntry, SubscriptionHistory,
    SubscriptionStatus, SubscriptionType,
};
pub use voucher::{NewRedemption, Voucher, VoucherRedemption, VoucherType};
