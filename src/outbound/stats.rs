//! Per-batch accounting for the outbound controller.

use super::dialer::CallStatus;
use std::{fmt, time::Duration};
use tracing::info;

/// Why a job ultimately failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum FailureReason {
    /// The callee never answered within the ring timeout.
    NoAnswer,
    /// Answered, but playback never started.
    AudioFailed,
    /// The channel died before playback completed.
    Destroyed,
    /// Origination itself was rejected by Asterisk.
    Origination,
    /// The per-job deadline expired.
    JobTimeout,
}

/// Final record for one job.
#[derive(Clone, Debug)]
pub struct JobRecord {
    pub job_id: u64,
    pub phone: String,
    pub status: CallStatus,
    pub attempts: u32,
    pub duration: Duration,
    pub audio_played: bool,
    pub failure: Option<FailureReason>,
}

impl JobRecord {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

impl fmt::Display for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} -> {}: {:?}, attempts={}, duration={:.0}s, audio={}",
            self.job_id,
            self.phone,
            self.status,
            self.attempts,
            self.duration.as_secs_f32(),
            if self.audio_played { "yes" } else { "no" },
        )?;
        if let Some(reason) = self.failure {
            write!(f, ", failure={reason:?}")?;
        }
        Ok(())
    }
}

/// Counters for one controller batch.
#[derive(Debug, Default)]
pub struct BatchStats {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Jobs skipped pre-dispatch by phone or cut-day policy.
    pub skipped: usize,
    /// Times the silent-call fallback forced `audio_started`; a nonzero
    /// count means playback events were registered but never observed.
    pub forced_audio: usize,
    records: Vec<JobRecord>,
}

impl BatchStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, record: JobRecord) {
        self.total += 1;
        if record.succeeded() {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
        self.records.push(record);
    }

    pub fn record_skip(&mut self) {
        self.skipped += 1;
    }

    pub fn record_forced_audio(&mut self) {
        self.forced_audio += 1;
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// Emits the end-of-batch summary.
    pub fn log_summary(&self) {
        info!(
            "Batch complete: {} dispatched, {} successful, {} failed, {} skipped pre-dispatch.",
            self.total, self.successful, self.failed, self.skipped,
        );

        if self.forced_audio > 0 {
            info!(
                "Silent-call fallback forced audio_started {} time(s); check playback events.",
                self.forced_audio,
            );
        }

        for record in &self.records {
            info!("{record}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: u64, failure: Option<FailureReason>) -> JobRecord {
        JobRecord {
            job_id: id,
            phone: "573001234567".into(),
            status: if failure.is_none() {
                CallStatus::Completed
            } else {
                CallStatus::Failed
            },
            attempts: 1,
            duration: Duration::from_secs(30),
            audio_played: failure.is_none(),
            failure,
        }
    }

    #[test]
    fn counters_track_outcomes() {
        let mut stats = BatchStats::new();

        stats.record(record(1, None));
        stats.record(record(2, Some(FailureReason::NoAnswer)));
        stats.record(record(3, Some(FailureReason::AudioFailed)));
        stats.record_skip();
        stats.record_forced_audio();

        assert_eq!(stats.total, 3);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.forced_audio, 1);
        assert_eq!(stats.records().len(), 3);
    }

    #[test]
    fn display_includes_failure_reason() {
        let text = record(9, Some(FailureReason::Destroyed)).to_string();
        assert!(text.contains("job 9"));
        assert!(text.contains("Destroyed"));
    }
}
