//! The background task that keeps the connection table up to date
//!
//! Every cycle fetches the ka9q-web status page, reconciles it against the connection table and
//! prunes old history. A failed cycle is logged and the next one starts on schedule, so nothing
//! that happens upstream or in the database can stop the poller.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use lol_html::errors::RewritingError;
use reqwest::{Client, StatusCode, Url};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    config::UpstreamTable,
    history::HistoryPruner,
    reconcile::{Changes, Reconciler},
    status::StatusTable,
    store::StoreError,
};

/// Why no snapshot could be taken this cycle
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("status page returned {0}")]
    Status(StatusCode),
    #[error("status page could not be parsed: {0}")]
    Malformed(#[from] RewritingError),
}

/// Everything a successful cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub changes: Changes,
    /// Closed connections deleted by the pruner
    pub pruned: usize,
}

/// How a poll cycle ended.
#[derive(Debug)]
pub enum CycleOutcome {
    /// The snapshot was applied and history pruned
    Completed(CycleSummary),
    /// The snapshot was applied but pruning failed
    Partial {
        summary: CycleSummary,
        error: StoreError,
    },
    /// No usable snapshot; the database wasn't touched
    Skipped(FetchError),
    /// The snapshot couldn't be applied; nothing was committed
    Failed(StoreError),
}

impl CycleOutcome {
    /// Log the outcome at a level matching its severity.
    fn report(&self) {
        match self {
            CycleOutcome::Completed(summary) if summary.changes.is_quiet() && summary.pruned == 0 => {
                debug!(sessions = summary.changes.seen, "Poll cycle complete");
            }
            CycleOutcome::Completed(summary) => info!(
                sessions = summary.changes.seen,
                created = summary.changes.created,
                closed = summary.changes.closed,
                pruned = summary.pruned,
                "Poll cycle complete"
            ),
            CycleOutcome::Partial { summary, error } => warn!(
                sessions = summary.changes.seen,
                created = summary.changes.created,
                closed = summary.changes.closed,
                "Poll cycle applied but history was not pruned: {error}"
            ),
            CycleOutcome::Skipped(err) => warn!("Skipping poll cycle: {err}"),
            CycleOutcome::Failed(err) => error!("Poll cycle failed: {err}"),
        }
    }
}

/// Polls the status page forever.
#[derive(Debug)]
pub struct Poller {
    /// HTTP client for the status page
    client: Client,
    /// Where the status page lives
    status_url: Url,
    /// Upper bound on fetching the status page
    timeout: Duration,
    /// Pause between the end of one cycle and the start of the next
    interval: Duration,
    reconciler: Reconciler,
    pruner: HistoryPruner,
}

impl Poller {
    pub fn new(upstream: &UpstreamTable, reconciler: Reconciler, pruner: HistoryPruner) -> Self {
        Poller {
            client: Client::new(),
            status_url: upstream.status_url.clone(),
            timeout: upstream.timeout,
            interval: upstream.poll_interval,
            reconciler,
            pruner,
        }
    }

    /// Run cycles until the process exits.
    ///
    /// Each cycle runs in its own task, so even a panic only costs that one cycle.
    pub async fn run(self) {
        let poller = Arc::new(self);
        info!(
            url = %poller.status_url,
            interval = ?poller.interval,
            "Polling ka9q-web status"
        );
        loop {
            let cycle = Arc::clone(&poller);
            match tokio::spawn(async move { cycle.run_cycle().await }).await {
                Ok(outcome) => outcome.report(),
                Err(err) => error!("Poll cycle aborted: {err}"),
            }
            tokio::time::sleep(poller.interval).await;
        }
    }

    /// Fetch, reconcile and prune once.
    pub async fn run_cycle(&self) -> CycleOutcome {
        self.run_cycle_impl(Utc::now()).await
    }

    /// Implementation of [`Poller::run_cycle`].
    ///
    /// Split apart to allow injecting the current time for testing purposes.
    #[instrument(name = "poller.cycle", skip_all)]
    async fn run_cycle_impl(&self, now: DateTime<Utc>) -> CycleOutcome {
        let table = match self.fetch().await {
            Ok(table) => table,
            Err(err) => return CycleOutcome::Skipped(err),
        };
        debug!(rows = table.row_count(), "Fetched status page");

        let changes = match self.reconciler.reconcile(table.sessions(), now).await {
            Ok(changes) => changes,
            Err(err) => return CycleOutcome::Failed(err),
        };

        let mut summary = CycleSummary {
            changes,
            pruned: 0,
        };
        match self.pruner.prune().await {
            Ok(pruned) => {
                summary.pruned = pruned;
                CycleOutcome::Completed(summary)
            }
            Err(error) => CycleOutcome::Partial { summary, error },
        }
    }

    /// Download and parse the status page.
    async fn fetch(&self) -> Result<StatusTable, FetchError> {
        let response = self
            .client
            .get(self.status_url.clone())
            .timeout(self.timeout)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(FetchError::Status(response.status()));
        }
        let html = response.text().await?;
        Ok(StatusTable::parse(&html)?)
    }
}
