//! Per-file transfer state and start gating.
//!
//! ```text
//! Idle -> Downloading -> Finalizing -> Waiting -> Completed -> Idle
//!             |              |
//!             +--> Failed <--+
//! ```
//!
//! `Waiting` and `Completed` are display windows: they lapse on their own
//! after [`DisplayWindows::completion_delay`] and
//! [`DisplayWindows::message_expiry`]. Starting is refused until they have.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::{EngineConfig, DEFAULT_COMPLETION_DELAY, DEFAULT_MESSAGE_EXPIRY};

#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadStatus {
    Idle,
    Downloading {
        progress_pct: f64,
        eta_seconds: Option<f64>,
    },
    Finalizing,
    Waiting,
    Completed,
    Failed {
        message: String,
    },
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Idle => write!(f, "idle"),
            DownloadStatus::Downloading { progress_pct, .. } => {
                write!(f, "downloading ({:.2}%)", progress_pct)
            }
            DownloadStatus::Finalizing => write!(f, "finalizing"),
            DownloadStatus::Waiting => write!(f, "waiting"),
            DownloadStatus::Completed => write!(f, "completed"),
            DownloadStatus::Failed { message } => write!(f, "failed: {}", message),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LifecycleError {
    #[error("cannot start while {0}")]
    Busy(DownloadStatus),

    #[error("cannot move from {from} to {to}")]
    InvalidTransition {
        from: DownloadStatus,
        to: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayWindows {
    pub completion_delay: Duration,
    pub message_expiry: Duration,
}

impl Default for DisplayWindows {
    fn default() -> Self {
        Self {
            completion_delay: DEFAULT_COMPLETION_DELAY,
            message_expiry: DEFAULT_MESSAGE_EXPIRY,
        }
    }
}

impl From<&EngineConfig> for DisplayWindows {
    fn from(config: &EngineConfig) -> Self {
        Self {
            completion_delay: config.completion_delay,
            message_expiry: config.message_expiry,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Lifecycle {
    status: DownloadStatus,
    entered_at: Instant,
    windows: DisplayWindows,
}

impl Lifecycle {
    pub fn new(windows: DisplayWindows, now: Instant) -> Self {
        Self {
            status: DownloadStatus::Idle,
            entered_at: now,
            windows,
        }
    }

    pub fn status(&self) -> &DownloadStatus {
        &self.status
    }

    /// Lets elapsed display windows lapse. Returns the status if it changed.
    pub fn advance(&mut self, now: Instant) -> Option<DownloadStatus> {
        let before = self.status.clone();
        loop {
            match self.status {
                DownloadStatus::Waiting
                    if now >= self.entered_at + self.windows.completion_delay =>
                {
                    self.entered_at += self.windows.completion_delay;
                    self.status = DownloadStatus::Completed;
                }
                DownloadStatus::Completed
                    if now >= self.entered_at + self.windows.message_expiry =>
                {
                    self.entered_at += self.windows.message_expiry;
                    self.status = DownloadStatus::Idle;
                }
                _ => break,
            }
        }
        (self.status != before).then(|| self.status.clone())
    }

    pub fn can_start(&mut self, now: Instant) -> bool {
        self.advance(now);
        matches!(
            self.status,
            DownloadStatus::Idle | DownloadStatus::Failed { .. }
        )
    }

    pub fn begin(&mut self, now: Instant) -> Result<(), LifecycleError> {
        if !self.can_start(now) {
            return Err(LifecycleError::Busy(self.status.clone()));
        }
        self.enter(
            DownloadStatus::Downloading {
                progress_pct: 0.0,
                eta_seconds: None,
            },
            now,
        );
        Ok(())
    }

    pub fn report_progress(&mut self, percent: f64, eta: Option<f64>) {
        if let DownloadStatus::Downloading {
            progress_pct,
            eta_seconds,
        } = &mut self.status
        {
            *progress_pct = percent;
            *eta_seconds = eta;
        }
    }

    pub fn finalizing(&mut self, now: Instant) -> Result<(), LifecycleError> {
        match self.status {
            DownloadStatus::Downloading { .. } => {
                self.enter(DownloadStatus::Finalizing, now);
                Ok(())
            }
            _ => Err(self.invalid("finalizing")),
        }
    }

    /// The artifact has been handed off; the waiting window starts now.
    pub fn delivered(&mut self, now: Instant) -> Result<(), LifecycleError> {
        match self.status {
            DownloadStatus::Finalizing => {
                self.enter(DownloadStatus::Waiting, now);
                Ok(())
            }
            _ => Err(self.invalid("waiting")),
        }
    }

    pub fn fail(&mut self, message: impl Into<String>, now: Instant) -> Result<(), LifecycleError> {
        match self.status {
            DownloadStatus::Downloading { .. } | DownloadStatus::Finalizing => {
                self.enter(
                    DownloadStatus::Failed {
                        message: message.into(),
                    },
                    now,
                );
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }

    fn enter(&mut self, status: DownloadStatus, now: Instant) {
        self.status = status;
        self.entered_at = now;
    }

    fn invalid(&self, to: &'static str) -> LifecycleError {
        LifecycleError::InvalidTransition {
            from: self.status.clone(),
            to,
        }
    }
}
