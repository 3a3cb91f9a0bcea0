//! Voting phase resolution.
//!
//! An event's phase is a pure function of its three on-chain timestamps and
//! the current time:
//!
//! ```text
//!   now < start                       NotStarted
//!   start <= now <= commit_end        CommitPhase
//!   commit_end < now <= deadline      RevealPhase
//!   now > deadline                    Ended
//! ```
//!
//! Nothing pushes a notification when time passes, so [`PhaseWatcher`]
//! re-resolves on a fixed interval for display purposes. Writes never trust
//! the watcher; they resolve the phase again at submission time.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    NotStarted,
    CommitPhase,
    RevealPhase,
    Ended,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::CommitPhase => "commit_phase",
            Self::RevealPhase => "reveal_phase",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three ordered instants of an event, in unix seconds.
///
/// Only constructible when `start_time < commit_end < reveal_deadline`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    start_time: u64,
    commit_end: u64,
    reveal_deadline: u64,
}

impl Schedule {
    pub fn new(start_time: u64, commit_end: u64, reveal_deadline: u64) -> Option<Self> {
        (start_time < commit_end && commit_end < reveal_deadline).then_some(Self {
            start_time,
            commit_end,
            reveal_deadline,
        })
    }

    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn commit_end(&self) -> u64 {
        self.commit_end
    }

    pub fn reveal_deadline(&self) -> u64 {
        self.reveal_deadline
    }
}

pub fn resolve_phase(schedule: &Schedule, now: u64) -> Phase {
    if now < schedule.start_time {
        Phase::NotStarted
    } else if now <= schedule.commit_end {
        Phase::CommitPhase
    } else if now <= schedule.reveal_deadline {
        Phase::RevealPhase
    } else {
        Phase::Ended
    }
}

/// Background task republishing the phase of one event on a fixed interval.
///
/// Dropping the watcher stops the task.
pub struct PhaseWatcher {
    rx: watch::Receiver<Phase>,
    cancel: CancellationToken,
}

impl PhaseWatcher {
    pub fn spawn(schedule: Schedule, clock: Arc<dyn Clock>, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(resolve_phase(&schedule, clock.now()));
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let phase = resolve_phase(&schedule, clock.now());
                        tx.send_if_modified(|current| {
                            if *current == phase {
                                return false;
                            }
                            *current = phase;
                            true
                        });
                        // Ended is terminal.
                        if phase == Phase::Ended {
                            break;
                        }
                    }
                }
            }
        });

        Self { rx, cancel }
    }

    pub fn current(&self) -> Phase {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.rx.clone()
    }
}

impl Drop for PhaseWatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
