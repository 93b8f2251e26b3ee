//! Retention of closed connections

use tracing::{debug, info, instrument};

use crate::store::{Store, StoreError};

/// Keeps the number of closed connections in the database bounded.
#[derive(Clone, Debug)]
pub struct HistoryPruner {
    /// The connection table
    store: Store,
    /// How many closed connections to keep
    limit: u32,
}

impl HistoryPruner {
    pub fn new(store: Store, limit: u32) -> Self {
        HistoryPruner { store, limit }
    }

    /// Delete all but the most recently closed connections. Active connections are never touched.
    ///
    /// Returns the number of deleted rows.
    #[instrument(name = "history.prune", skip(self), fields(limit = self.limit))]
    pub async fn prune(&self) -> Result<usize, StoreError> {
        let limit = self.limit;
        let deleted = self.store.write(move |w| w.prune_closed(limit)).await?;
        if deleted > 0 {
            info!(count = deleted, "Pruned connection history");
        } else {
            debug!("Nothing to prune");
        }
        Ok(deleted)
    }
}
