//! Store visibility toggles driven by billing transitions.
//!
//! Both operations are idempotent and never fail: a store that is already in the
//! requested state is left untouched, and storage errors are logged and reported
//! as "no change".

use crate::services::database::Database;
use crate::services::metrics::{record_error, record_store_visibility};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct StoreVisibility {
    db: Arc<Database>,
}

impl StoreVisibility {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Open the store if it is closed. Returns whether it was opened.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn reopen(&self, merchant_id: Uuid) -> bool {
        match self.db.reopen_store(merchant_id).await {
            Ok(true) => {
                record_store_visibility("opened");
                info!("Store reopened by billing transition");
                true
            }
            Ok(false) => false,
            Err(e) => {
                record_error("store_visibility", "reopen");
                warn!(error = %e, "Failed to reopen store");
                false
            }
        }
    }

    /// Close the store if it is open. Returns whether it was closed.
    #[instrument(skip(self), fields(merchant_id = %merchant_id))]
    pub async fn close(&self, merchant_id: Uuid) -> bool {
        match self.db.close_store(merchant_id).await {
            Ok(true) => {
                record_store_visibility("closed");
                info!("Store closed by billing transition");
                true
            }
            Ok(false) => false,
            Err(e) => {
                record_error("store_visibility", "close");
                warn!(error = %e, "Failed to close store");
                false
            }
        }
    }
}
