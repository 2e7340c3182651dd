//! Sequencer states and the events observers receive.
use std::fmt;

use crate::model::CalibrationDataset;

/// Where the sequencer is in the per-step protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    Adjusting,
    Settling,
    Reading,
    Sampling,
    Dwelling,
    /// Paused after an interlock trip until the operator resumes.
    WaitingOnInterlock,
    Done,
}

impl RunState {
    pub fn label(self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Adjusting => "ADJUSTING",
            RunState::Settling => "SETTLING",
            RunState::Reading => "READING",
            RunState::Sampling => "SAMPLING",
            RunState::Dwelling => "DWELLING",
            RunState::WaitingOnInterlock => "WAITING_ON_INTERLOCK",
            RunState::Done => "DONE",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    /// State transition. `sample` is 1-based while sampling.
    Status {
        state: RunState,
        step: u64,
        sample: Option<u64>,
    },
    /// Emitted after each completed step; non-decreasing, 100 after the last.
    Progress { percent: u8 },
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Complete(CalibrationDataset),
    /// Cancelled after some measurements were taken.
    Partial(CalibrationDataset),
    /// Cancelled before anything usable was recorded.
    NoData,
}

impl RunOutcome {
    pub fn dataset(&self) -> Option<&CalibrationDataset> {
        match self {
            RunOutcome::Complete(d) | RunOutcome::Partial(d) => Some(d),
            RunOutcome::NoData => None,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, RunOutcome::Partial(_))
    }

    /// The dataset, or `CalibrateError::Cancelled` when there is none.
    pub fn into_dataset(self) -> Result<CalibrationDataset, crate::error::CalibrateError> {
        match self {
            RunOutcome::Complete(d) | RunOutcome::Partial(d) => Ok(d),
            RunOutcome::NoData => Err(crate::error::CalibrateError::Cancelled),
        }
    }
}
