//! Queue-driven outbound reminder controller.
//!
//! One batch: load dispatchable jobs from the store, pre-flight the PBX,
//! then drive each job through the dialer sequentially, pausing between
//! jobs so the trunk is never saturated.

pub mod dialer;
pub mod stats;
pub mod store;

pub use self::{
    dialer::{CallStatus, Dialer},
    stats::{BatchStats, FailureReason, JobRecord},
    store::{Candidate, OutboundJob, StoreError, SubscriberStore},
};

use crate::{
    ari::{AriClient, AriError},
    config::OutboundConfig,
};
use chrono::{Datelike, Local};
use std::{error::Error as StdError, fmt};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Errors that abort a whole batch (job-level failures never do).
#[derive(Debug)]
#[non_exhaustive]
pub enum OutboundError {
    /// The ARI control surface is unreachable; no calls can be placed.
    AriUnavailable(AriError),
    Store(StoreError),
}

impl From<StoreError> for OutboundError {
    fn from(e: StoreError) -> Self {
        OutboundError::Store(e)
    }
}

impl fmt::Display for OutboundError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutboundError::AriUnavailable(e) => write!(f, "ARI unavailable: {e}"),
            OutboundError::Store(e) => e.fmt(f),
        }
    }
}

impl StdError for OutboundError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            OutboundError::AriUnavailable(e) => Some(e),
            OutboundError::Store(e) => Some(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, OutboundError>;

/// Runs reminder batches against one PBX and one subscriber store.
pub struct OutboundController {
    ari: AriClient,
    store: SubscriberStore,
    config: OutboundConfig,
}

impl OutboundController {
    pub fn new(ari: AriClient, store: SubscriberStore, config: OutboundConfig) -> Self {
        Self { ari, store, config }
    }

    /// Loads and dispatches one batch, returning its statistics.
    #[instrument(skip(self))]
    pub async fn run_batch(&self) -> Result<BatchStats> {
        self.preflight().await?;

        let today = Local::now().day();
        let (jobs, skipped) = self.store.load_pending(today).await?;

        let mut stats = BatchStats::new();
        for _ in 0..skipped {
            stats.record_skip();
        }

        if jobs.is_empty() {
            info!("No dispatchable jobs today.");
            stats.log_summary();
            return Ok(stats);
        }

        info!("Dispatching {} jobs.", jobs.len());

        let subscription = self.ari.events(&self.config.app);
        let events = subscription.events();

        let total = jobs.len();
        for (index, job) in jobs.into_iter().enumerate() {
            info!("Job {}/{}: subscriber {}.", index + 1, total, job.id);

            let dialer = Dialer::new(&self.ari, &self.store, &self.config, events.clone(), job);
            let (record, forced) = dialer.run().await;

            info!("{record}");
            for _ in 0..forced {
                stats.record_forced_audio();
            }
            stats.record(record);

            if index + 1 < total {
                sleep(self.config.inter_job_delay).await;
            }
        }

        subscription.stop();
        stats.log_summary();

        Ok(stats)
    }

    /// Health-checks ARI and clears stale channels left by earlier runs.
    ///
    /// Channels sitting in `Down`/`Reserved`, or still parked in our
    /// Stasis application, eat into Asterisk's channel quota and cause
    /// `Allocation failed` on origination.
    async fn preflight(&self) -> Result<()> {
        let channels = self
            .ari
            .list_channels()
            .await
            .map_err(OutboundError::AriUnavailable)?;

        debug!("Pre-flight: {} channels live on the PBX.", channels.len());

        for channel in channels {
            let stale_state = matches!(channel.state.as_str(), "Down" | "Reserved");
            let ours = channel
                .dialplan
                .as_ref()
                .is_some_and(|d| d.app_name == self.config.app);

            if stale_state || ours {
                warn!(
                    "Pre-flight hangup of stale channel {} (state {}, app-owned: {ours}).",
                    channel.id, channel.state,
                );
                if let Err(e) = self.ari.hangup(&channel.id).await {
                    debug!("Stale hangup failed: {e}.");
                }
            }
        }

        Ok(())
    }
}
