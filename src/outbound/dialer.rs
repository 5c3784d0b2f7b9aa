//! Per-job call driver: originates, walks the attempt state machine
//! across ARI events and timers, and persists the outcome.
//!
//! The state machine itself ([`AttemptState`]) is synchronous and free
//! of I/O; the surrounding [`Dialer`] loop executes the actions it emits
//! against ARI and the store. Events and timers arrive through one
//! select loop, so every field has a single writer.

use crate::{
    ari::{AriClient, AriError, AriEvent, Playback},
    config::OutboundConfig,
    constants::ALLOCATION_FAILURE_PAUSE,
    outbound::{
        stats::{FailureReason, JobRecord},
        store::{OutboundJob, SubscriberStore},
    },
};
use chrono::Local;
use flume::Receiver;
use serde_json::json;
use std::collections::HashMap;
use tokio::{
    select,
    time::{sleep, sleep_until, Instant},
};
use tracing::{debug, error, info, instrument, warn};

/// Lifecycle of one call attempt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CallStatus {
    Initiated,
    Ringing,
    Answered,
    AudioPlaying,
    Completed,
    Failed,
    Timeout,
    AudioFailed,
}

/// Timers the attempt loop arms.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Timer {
    /// No answer within the call timeout.
    Ring,
    /// Playback requested but never started.
    AudioStart,
    /// Answered call with no audio activity at all.
    Silent,
    /// Playback started long ago; poll in case its finish event was lost.
    PlaybackCheck,
    /// The whole job overran its cooperative deadline.
    Job,
}

/// Side effects requested by the state machine.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Action {
    /// Ask Asterisk to play the reminder on this channel.
    RequestPlayback(String),
    /// Persist the success row (first playback start only).
    MarkSent,
    /// Hang the channel up immediately.
    Hangup(String),
    /// Hang up after the post-playback grace, then finish.
    GracefulHangup(String),
    /// The attempt is over.
    Finish(CallStatus),
}

/// Pure per-attempt state. All transitions happen here; the dialer loop
/// only executes the returned actions.
#[derive(Debug)]
struct AttemptState {
    status: CallStatus,
    call_id: String,
    active_channel: Option<String>,
    playback_map: HashMap<String, String>,
    audio_started: bool,
    forced_audio: bool,
}

impl AttemptState {
    fn new(call_id: String) -> Self {
        Self {
            status: CallStatus::Initiated,
            call_id,
            active_channel: None,
            playback_map: HashMap::new(),
            audio_started: false,
            forced_audio: false,
        }
    }

    /// Records a playback requested by the loop.
    fn register_playback(&mut self, playback_id: String, channel_id: String) {
        self.playback_map.insert(playback_id, channel_id);
    }

    /// Playbacks awaiting their finished event.
    fn pending_playbacks(&self) -> Vec<String> {
        self.playback_map.keys().cloned().collect()
    }

    /// Consumes the forced-audio marker, if the silent-call fallback fired.
    fn take_forced_audio(&mut self) -> bool {
        std::mem::take(&mut self.forced_audio)
    }

    fn on_event(&mut self, event: &AriEvent) -> Vec<Action> {
        match event {
            AriEvent::Dial(info) if info.dialstatus == "RINGING" => {
                if self.status == CallStatus::Initiated {
                    info!("Call is ringing.");
                    self.status = CallStatus::Ringing;
                }
                Vec::new()
            },

            AriEvent::StasisStart { channel } if channel.id == self.call_id => {
                info!("Call answered on channel {}.", channel.id);
                self.active_channel = Some(channel.id.clone());
                self.status = CallStatus::Answered;
                vec![Action::RequestPlayback(channel.id.clone())]
            },

            AriEvent::PlaybackStarted { playback }
                if self.playback_map.contains_key(&playback.id) =>
            {
                info!("Reminder playback {} started.", playback.id);
                let first = !self.audio_started;
                self.audio_started = true;
                self.status = CallStatus::AudioPlaying;

                if first {
                    vec![Action::MarkSent]
                } else {
                    Vec::new()
                }
            },

            AriEvent::PlaybackFinished { playback }
                if self.playback_map.remove(&playback.id).is_some() =>
            {
                info!("Reminder playback {} finished.", playback.id);
                self.status = CallStatus::Completed;

                match self.active_channel.take() {
                    Some(channel) => vec![
                        Action::GracefulHangup(channel),
                        Action::Finish(CallStatus::Completed),
                    ],
                    None => vec![Action::Finish(CallStatus::Completed)],
                }
            },

            AriEvent::StasisEnd { channel }
                if Some(&channel.id) == self.active_channel.as_ref() =>
            {
                info!("Callee left the application.");
                self.active_channel = None;
                Vec::new()
            },

            AriEvent::ChannelStateChange { channel } if channel.id == self.call_id => {
                debug!("Channel state now {}.", channel.state);
                Vec::new()
            },

            AriEvent::ChannelDestroyed { channel, .. } if channel.id == self.call_id => {
                self.active_channel = None;
                self.on_destroyed()
            },

            _ => Vec::new(),
        }
    }

    fn on_destroyed(&mut self) -> Vec<Action> {
        match self.status {
            CallStatus::Completed => vec![Action::Finish(CallStatus::Completed)],
            CallStatus::Answered if !self.audio_started => {
                warn!("Call answered but destroyed before any audio.");
                self.status = CallStatus::AudioFailed;
                vec![Action::Finish(CallStatus::AudioFailed)]
            },
            // Destruction before playback completed counts as a failure,
            // even if audio had begun.
            _ => {
                self.status = CallStatus::Failed;
                vec![Action::Finish(CallStatus::Failed)]
            },
        }
    }

    fn on_timer(&mut self, timer: Timer) -> Vec<Action> {
        match timer {
            Timer::Ring => {
                if matches!(self.status, CallStatus::Initiated | CallStatus::Ringing) {
                    warn!("No answer within the call timeout.");
                    self.status = CallStatus::Timeout;
                    vec![
                        Action::Hangup(self.call_id.clone()),
                        Action::Finish(CallStatus::Timeout),
                    ]
                } else {
                    Vec::new()
                }
            },

            Timer::AudioStart => {
                if self.status == CallStatus::Answered && !self.audio_started {
                    warn!(
                        "Playback never started ({} registered).",
                        self.playback_map.len(),
                    );
                    self.status = CallStatus::AudioFailed;

                    match self.active_channel.take() {
                        Some(channel) => vec![
                            Action::Hangup(channel),
                            Action::Finish(CallStatus::AudioFailed),
                        ],
                        None => vec![Action::Finish(CallStatus::AudioFailed)],
                    }
                } else {
                    Vec::new()
                }
            },

            Timer::Silent => {
                if self.status == CallStatus::Answered && !self.audio_started {
                    if self.playback_map.is_empty() {
                        warn!("Silent call with no playback registered; giving up.");
                        self.status = CallStatus::AudioFailed;

                        match self.active_channel.take() {
                            Some(channel) => vec![
                                Action::Hangup(channel),
                                Action::Finish(CallStatus::AudioFailed),
                            ],
                            None => vec![Action::Finish(CallStatus::AudioFailed)],
                        }
                    } else {
                        // A playback exists but its start event never
                        // arrived. Assume audio is flowing rather than
                        // hang up on a caller mid-message; the batch
                        // summary surfaces how often this fires.
                        warn!("Playbacks registered but unconfirmed; forcing audio_started.");
                        self.audio_started = true;
                        self.forced_audio = true;
                        Vec::new()
                    }
                } else {
                    Vec::new()
                }
            },

            // Resolved by the loop against live playback state.
            Timer::PlaybackCheck => Vec::new(),

            Timer::Job => {
                warn!("Per-job deadline reached.");
                let mut actions = Vec::new();
                if let Some(channel) = self.active_channel.take() {
                    actions.push(Action::Hangup(channel));
                } else if !matches!(self.status, CallStatus::Completed) {
                    actions.push(Action::Hangup(self.call_id.clone()));
                }
                actions.push(Action::Finish(CallStatus::Timeout));
                actions
            },
        }
    }
}

/// Armed deadlines for the attempt loop.
#[derive(Debug)]
struct Deadlines {
    ring: Option<Instant>,
    audio_start: Option<Instant>,
    silent: Option<Instant>,
    playback_check: Option<Instant>,
    job: Instant,
}

impl Deadlines {
    /// The soonest armed deadline.
    fn next(&self) -> (Instant, Timer) {
        let mut next = (self.job, Timer::Job);

        for (deadline, timer) in [
            (self.ring, Timer::Ring),
            (self.audio_start, Timer::AudioStart),
            (self.silent, Timer::Silent),
            (self.playback_check, Timer::PlaybackCheck),
        ] {
            if let Some(deadline) = deadline {
                if deadline < next.0 {
                    next = (deadline, timer);
                }
            }
        }

        next
    }

    fn disarm(&mut self, timer: Timer) {
        match timer {
            Timer::Ring => self.ring = None,
            Timer::AudioStart => self.audio_start = None,
            Timer::Silent => self.silent = None,
            Timer::PlaybackCheck => self.playback_check = None,
            Timer::Job => {},
        }
    }
}

enum AttemptOutcome {
    Success,
    Failure(CallStatus, FailureReason),
    JobTimeout(CallStatus),
}

/// Drives one job to completion, attempts and retries included.
pub struct Dialer<'a> {
    ari: &'a AriClient,
    store: &'a SubscriberStore,
    config: &'a OutboundConfig,
    events: Receiver<AriEvent>,
    job: OutboundJob,
    db_updated: bool,
    audio_played: bool,
    forced_audio: u32,
}

impl<'a> Dialer<'a> {
    pub fn new(
        ari: &'a AriClient,
        store: &'a SubscriberStore,
        config: &'a OutboundConfig,
        events: Receiver<AriEvent>,
        job: OutboundJob,
    ) -> Self {
        Self {
            ari,
            store,
            config,
            events,
            job,
            db_updated: false,
            audio_played: false,
            forced_audio: 0,
        }
    }

    /// Runs every attempt for this job and returns its final record,
    /// along with how often the silent-call fallback fired.
    #[instrument(skip(self), fields(job = self.job.id, phone = %self.job.phone))]
    pub async fn run(mut self) -> (JobRecord, u32) {
        let started = Instant::now();
        let job_deadline = started + self.config.job_timeout;

        let mut attempts = 0;
        let mut final_status = CallStatus::Failed;
        let mut failure = Some(FailureReason::Origination);

        loop {
            attempts += 1;

            // Stale events from a previous attempt mean nothing now.
            let drained = self.events.drain().count();
            if drained > 0 {
                debug!("Discarded {drained} stale events before attempt {attempts}.");
            }

            match self.attempt(attempts, job_deadline).await {
                AttemptOutcome::Success => {
                    final_status = CallStatus::Completed;
                    failure = None;
                    break;
                },
                AttemptOutcome::JobTimeout(status) => {
                    final_status = status;
                    failure = Some(FailureReason::JobTimeout);
                    break;
                },
                AttemptOutcome::Failure(status, reason) => {
                    final_status = status;
                    failure = Some(reason);

                    if attempts >= self.config.max_attempts {
                        warn!(
                            "Giving up on job {} after {attempts} attempts.",
                            self.job.id,
                        );
                        break;
                    }

                    if Instant::now() + self.config.retry_delay >= job_deadline {
                        warn!("No time left in the job budget for another attempt.");
                        failure = Some(FailureReason::JobTimeout);
                        break;
                    }

                    info!(
                        "Scheduling attempt {} in {:?} after {status:?}.",
                        attempts + 1,
                        self.config.retry_delay,
                    );
                    sleep(self.config.retry_delay).await;
                },
            }
        }

        // A delivered reminder was already persisted at PlaybackStarted;
        // exhausted retries persist the attempt count alone. Counts only
        // ever grow: prior runs' attempts are carried forward.
        if failure.is_some() && !self.db_updated {
            let total = self.job.prior_attempts + attempts;
            if let Err(e) = self.store.record_attempts(self.job.id, total).await {
                error!("Failed to persist attempts for job {}: {e}.", self.job.id);
            }
        }

        let record = JobRecord {
            job_id: self.job.id,
            phone: self.job.phone.clone(),
            status: final_status,
            attempts,
            duration: started.elapsed(),
            audio_played: self.audio_played,
            failure,
        };

        (record, self.forced_audio)
    }

    async fn attempt(&mut self, attempt_no: u32, job_deadline: Instant) -> AttemptOutcome {
        let endpoint = format!("SIP/{}/{}", self.config.trunk, self.job.phone);
        let variables = json!({ "CHANNEL(language)": "es" });

        info!("Initiating call (attempt {attempt_no}).");

        let call_id = match self
            .ari
            .originate(&endpoint, &self.config.app, &self.config.caller_id, &variables)
            .await
        {
            Ok(id) => id,
            Err(AriError::AllocationFailed) => {
                // The PBX is out of channels; give it room before the
                // failure is counted.
                warn!("Channel allocation failed; pausing before retry.");
                sleep(ALLOCATION_FAILURE_PAUSE).await;
                return AttemptOutcome::Failure(CallStatus::Failed, FailureReason::Origination);
            },
            Err(e) => {
                error!("Origination failed: {e}.");
                return AttemptOutcome::Failure(CallStatus::Failed, FailureReason::Origination);
            },
        };

        let mut state = AttemptState::new(call_id);
        let mut deadlines = Deadlines {
            ring: Some(Instant::now() + self.config.call_timeout),
            audio_start: None,
            silent: None,
            playback_check: None,
            job: job_deadline,
        };

        loop {
            let (next_deadline, timer) = deadlines.next();

            let actions = select! {
                event = self.events.recv_async() => match event {
                    Ok(event) => state.on_event(&event),
                    Err(_) => {
                        error!("Event subscription ended mid-attempt.");
                        return AttemptOutcome::Failure(
                            CallStatus::Failed,
                            FailureReason::Destroyed,
                        );
                    },
                },
                () = sleep_until(next_deadline) => {
                    deadlines.disarm(timer);
                    match timer {
                        Timer::Job => {
                            let actions = state.on_timer(Timer::Job);
                            self.perform(actions, attempt_no, &mut state, &mut deadlines).await;
                            return AttemptOutcome::JobTimeout(state.status);
                        },
                        Timer::PlaybackCheck => self.check_playback_completion(&mut state).await,
                        timer => state.on_timer(timer),
                    }
                },
            };

            if state.take_forced_audio() {
                self.forced_audio += 1;
                deadlines.audio_start = None;
                deadlines.silent = None;
            }

            if let Some(outcome) = self
                .perform(actions, attempt_no, &mut state, &mut deadlines)
                .await
            {
                return outcome;
            }
        }
    }

    /// Safety net for lost `PlaybackFinished` events: polls any playback
    /// still pending long after it started and synthesizes its finish.
    async fn check_playback_completion(&mut self, state: &mut AttemptState) -> Vec<Action> {
        if state.status != CallStatus::AudioPlaying {
            return Vec::new();
        }

        let mut actions = Vec::new();

        for playback_id in state.pending_playbacks() {
            let finished = match self.ari.get_playback(&playback_id).await {
                Ok(None) => true,
                Ok(Some(playback)) => matches!(playback.state.as_str(), "done" | "cancelled"),
                Err(e) => {
                    warn!("Playback {playback_id} poll failed: {e}; assuming finished.");
                    true
                },
            };

            if finished {
                warn!("Playback {playback_id} ended without a finished event; completing.");
                actions.extend(state.on_event(&AriEvent::PlaybackFinished {
                    playback: Playback {
                        id: playback_id,
                        ..Default::default()
                    },
                }));
            }
        }

        actions
    }

    /// Executes the state machine's requested side effects.
    async fn perform(
        &mut self,
        actions: Vec<Action>,
        attempt_no: u32,
        state: &mut AttemptState,
        deadlines: &mut Deadlines,
    ) -> Option<AttemptOutcome> {
        for action in actions {
            match action {
                Action::RequestPlayback(channel) => {
                    // Let the channel settle before playing into it.
                    sleep(self.config.answer_grace).await;

                    deadlines.ring = None;

                    let media = format!("sound:{}", self.config.media);
                    match self.ari.play(&channel, &media).await {
                        Ok(playback_id) => {
                            info!("Playback {playback_id} requested on {channel}.");
                            state.register_playback(playback_id, channel);
                            deadlines.audio_start =
                                Some(Instant::now() + self.config.audio_start_timeout);
                            deadlines.silent = Some(Instant::now() + self.config.max_silent);
                        },
                        Err(e) => {
                            error!("Playback request failed: {e}.");
                            state.status = CallStatus::AudioFailed;
                            drop(self.ari.hangup(&channel).await);
                            return Some(AttemptOutcome::Failure(
                                CallStatus::AudioFailed,
                                FailureReason::AudioFailed,
                            ));
                        },
                    }
                },

                Action::MarkSent => {
                    self.audio_played = true;
                    deadlines.audio_start = None;
                    deadlines.silent = None;
                    deadlines.playback_check =
                        Some(Instant::now() + self.config.playback_check_delay);

                    if !self.db_updated {
                        let today = Local::now().date_naive();
                        let total = self.job.prior_attempts + attempt_no;

                        match self.store.mark_sent(self.job.id, total, today).await {
                            Ok(()) => self.db_updated = true,
                            Err(e) => {
                                // The call proceeds; a missed write here
                                // means one extra reminder next batch at
                                // worst.
                                error!("Failed to mark job {} sent: {e}.", self.job.id);
                            },
                        }
                    }
                },

                Action::Hangup(channel) => {
                    if let Err(e) = self.ari.hangup(&channel).await {
                        debug!("Hangup of {channel} failed: {e}.");
                    }
                },

                Action::GracefulHangup(channel) => {
                    sleep(self.config.hangup_grace).await;
                    if let Err(e) = self.ari.hangup(&channel).await {
                        debug!("Hangup of {channel} failed: {e}.");
                    }
                },

                Action::Finish(status) => {
                    return Some(match status {
                        CallStatus::Completed => AttemptOutcome::Success,
                        CallStatus::Timeout => {
                            AttemptOutcome::Failure(status, FailureReason::NoAnswer)
                        },
                        CallStatus::AudioFailed => {
                            AttemptOutcome::Failure(status, FailureReason::AudioFailed)
                        },
                        _ => AttemptOutcome::Failure(status, FailureReason::Destroyed),
                    });
                },
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ari::{Channel, DialInfo, Playback};

    fn channel(id: &str) -> Channel {
        Channel {
            id: id.into(),
            ..Default::default()
        }
    }

    fn playback(id: &str) -> Playback {
        Playback {
            id: id.into(),
            target_uri: "channel:abc".into(),
            ..Default::default()
        }
    }

    #[test]
    fn successful_run_walks_the_happy_path() {
        let mut state = AttemptState::new("abc".into());

        let actions = state.on_event(&AriEvent::Dial(DialInfo {
            dialstatus: "RINGING".into(),
            peer: None,
        }));
        assert!(actions.is_empty());
        assert_eq!(state.status, CallStatus::Ringing);

        let actions = state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });
        assert_eq!(actions, vec![Action::RequestPlayback("abc".into())]);
        assert_eq!(state.status, CallStatus::Answered);

        state.register_playback("p1".into(), "abc".into());

        let actions = state.on_event(&AriEvent::PlaybackStarted {
            playback: playback("p1"),
        });
        assert_eq!(actions, vec![Action::MarkSent]);
        assert_eq!(state.status, CallStatus::AudioPlaying);
        assert!(state.audio_started);

        let actions = state.on_event(&AriEvent::PlaybackFinished {
            playback: playback("p1"),
        });
        assert_eq!(
            actions,
            vec![
                Action::GracefulHangup("abc".into()),
                Action::Finish(CallStatus::Completed),
            ]
        );
        assert_eq!(state.status, CallStatus::Completed);
    }

    #[test]
    fn playback_for_unknown_id_is_ignored() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });

        let actions = state.on_event(&AriEvent::PlaybackStarted {
            playback: playback("stranger"),
        });
        assert!(actions.is_empty());
        assert!(!state.audio_started);
    }

    #[test]
    fn audio_start_timeout_fails_the_attempt() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });
        state.register_playback("p1".into(), "abc".into());

        let actions = state.on_timer(Timer::AudioStart);
        assert_eq!(
            actions,
            vec![
                Action::Hangup("abc".into()),
                Action::Finish(CallStatus::AudioFailed),
            ]
        );
        assert_eq!(state.status, CallStatus::AudioFailed);
    }

    #[test]
    fn audio_start_timer_is_noop_once_audio_plays() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });
        state.register_playback("p1".into(), "abc".into());
        state.on_event(&AriEvent::PlaybackStarted {
            playback: playback("p1"),
        });

        assert!(state.on_timer(Timer::AudioStart).is_empty());
        assert!(state.on_timer(Timer::Silent).is_empty());
    }

    #[test]
    fn silent_timer_forces_audio_when_playback_registered() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });
        state.register_playback("p1".into(), "abc".into());

        let actions = state.on_timer(Timer::Silent);
        assert!(actions.is_empty());
        assert!(state.audio_started);
        assert!(state.take_forced_audio());
        // Marker is consumed.
        assert!(!state.take_forced_audio());
    }

    #[test]
    fn silent_timer_without_playback_gives_up() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });

        let actions = state.on_timer(Timer::Silent);
        assert_eq!(
            actions,
            vec![
                Action::Hangup("abc".into()),
                Action::Finish(CallStatus::AudioFailed),
            ]
        );
    }

    #[test]
    fn ring_timeout_hangs_up_unanswered_call() {
        let mut state = AttemptState::new("abc".into());

        let actions = state.on_timer(Timer::Ring);
        assert_eq!(
            actions,
            vec![
                Action::Hangup("abc".into()),
                Action::Finish(CallStatus::Timeout),
            ]
        );
        assert_eq!(state.status, CallStatus::Timeout);
    }

    #[test]
    fn ring_timer_is_noop_after_answer() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });

        assert!(state.on_timer(Timer::Ring).is_empty());
    }

    #[test]
    fn destroyed_before_answer_is_failed() {
        let mut state = AttemptState::new("abc".into());

        let actions = state.on_event(&AriEvent::ChannelDestroyed {
            channel: channel("abc"),
            cause: Some(16),
            cause_txt: None,
        });
        assert_eq!(actions, vec![Action::Finish(CallStatus::Failed)]);
    }

    #[test]
    fn destroyed_while_answered_without_audio_is_audio_failed() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });

        let actions = state.on_event(&AriEvent::ChannelDestroyed {
            channel: channel("abc"),
            cause: None,
            cause_txt: None,
        });
        assert_eq!(actions, vec![Action::Finish(CallStatus::AudioFailed)]);
    }

    #[test]
    fn destroyed_after_completion_finishes_cleanly() {
        let mut state = AttemptState::new("abc".into());
        state.on_event(&AriEvent::StasisStart {
            channel: channel("abc"),
        });
        state.register_playback("p1".into(), "abc".into());
        state.on_event(&AriEvent::PlaybackStarted {
            playback: playback("p1"),
        });
        state.on_event(&AriEvent::PlaybackFinished {
            playback: playback("p1"),
        });

        let actions = state.on_event(&AriEvent::ChannelDestroyed {
            channel: channel("abc"),
            cause: None,
            cause_txt: None,
        });
        assert_eq!(actions, vec![Action::Finish(CallStatus::Completed)]);
    }

    #[test]
    fn events_for_other_channels_are_ignored() {
        let mut state = AttemptState::new("abc".into());

        assert!(state
            .on_event(&AriEvent::StasisStart {
                channel: channel("xyz"),
            })
            .is_empty());
        assert_eq!(state.status, CallStatus::Initiated);
    }
}
