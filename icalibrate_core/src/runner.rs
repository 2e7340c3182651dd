//! Background execution of a calibration run.
//!
//! [`start`] validates the parameters, then spawns one thread that owns the
//! gateway and the [`Sequencer`]. The caller keeps a [`RunHandle`] for
//! cancel/resume, the event stream and the final result. Dropping the handle
//! cancels the run and joins the thread, so no run outlives its handle.
use std::sync::Arc;

use crossbeam_channel as xch;
use icalibrate_traits::Gateway;

use crate::control::RunControl;
use crate::error::{CalibrateError, Report, Result};
use crate::params::RunParameters;
use crate::sequencer::{Sequencer, SequencerCfg};
use crate::status::{RunEvent, RunOutcome};

pub type RunResult = std::result::Result<RunOutcome, CalibrateError>;

/// Cloneable cancel/resume handle, usable from other threads (signal
/// handlers, UI callbacks, gateway hooks).
#[derive(Debug, Clone)]
pub struct RunControlHandle {
    control: Arc<RunControl>,
}

impl RunControlHandle {
    /// Request cancellation. Idempotent; a no-op once the run has finished.
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Acknowledge an interlock trip so the interrupted step is retried.
    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }
}

pub struct RunHandle {
    control: RunControlHandle,
    events: xch::Receiver<RunEvent>,
    result_rx: xch::Receiver<RunResult>,
    result: Option<RunResult>,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl core::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RunHandle")
            .field("cancelled", &self.control.is_cancelled())
            .field("finished", &self.result.is_some())
            .finish_non_exhaustive()
    }
}

/// Validate `params` and start the run on a background thread.
///
/// Invalid parameters fail here with `CalibrateError::Validation` and no
/// thread is started.
pub fn start<G>(params: RunParameters, gateway: G, cfg: SequencerCfg) -> Result<RunHandle>
where
    G: Gateway + 'static,
{
    params.validate().map_err(Report::new)?;

    let control = Arc::new(RunControl::new());
    let (ev_tx, ev_rx) = xch::unbounded();
    let (res_tx, res_rx) = xch::bounded(1);
    let sequencer = Sequencer::new(gateway, params, cfg, Arc::clone(&control), ev_tx);

    let join_handle = std::thread::Builder::new()
        .name("calibration-run".into())
        .spawn(move || {
            let result = sequencer.run();
            if res_tx.send(result).is_err() {
                tracing::debug!("run handle gone before the result was collected");
            }
            tracing::trace!("calibration thread exiting cleanly");
        })
        .map_err(|e| Report::new(CalibrateError::Io(format!("spawn run thread: {e}"))))?;

    Ok(RunHandle {
        control: RunControlHandle { control },
        events: ev_rx,
        result_rx: res_rx,
        result: None,
        join_handle: Some(join_handle),
    })
}

impl RunHandle {
    /// Status and progress events in emission order. The stream ends
    /// (disconnects) once the run thread has finished.
    pub fn events(&self) -> &xch::Receiver<RunEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn control_handle(&self) -> RunControlHandle {
        self.control.clone()
    }

    /// Block until the run finishes. Repeated calls return the same result.
    pub fn await_result(&mut self) -> RunResult {
        if let Some(r) = &self.result {
            return r.clone();
        }
        let r = self.result_rx.recv().unwrap_or_else(|_| {
            Err(CalibrateError::State(
                "run thread ended without a result".into(),
            ))
        });
        self.join();
        self.result = Some(r.clone());
        r
    }

    /// The result if the run has already finished.
    pub fn try_result(&mut self) -> Option<RunResult> {
        if self.result.is_none() {
            let r = self.result_rx.try_recv().ok()?;
            self.join();
            self.result = Some(r);
        }
        self.result.clone()
    }

    fn join(&mut self) {
        if let Some(handle) = self.join_handle.take()
            && let Err(e) = handle.join()
        {
            tracing::warn!(?e, "calibration thread panicked");
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.join_handle.is_some() {
            self.control.cancel();
            self.join();
        }
    }
}
