//! Calibration run sequencer.
//!
//! Steps the attenuator from min to max, settles, reads the beam current,
//! samples every detector, and averages the samples into one measurement per
//! detector per step. An interlock trip pauses the run until the operator
//! resumes; the interrupted step then starts over. Cancellation stops the
//! loop and salvages whatever was measured. Either way the attenuator and
//! mode are restored afterwards when writes are enabled.
//!
//! The sequencer runs on one thread and is the only writer of its state. The
//! gateway's notification thread touches only the interlock flags.
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as xch;
use icalibrate_traits::{Clock, Gateway, PvValue, SystemClock};

use crate::control::{Cancelled, RunControl};
use crate::error::{CalibrateError, GatewayErrorKind, GatewayOp};
use crate::gateway_error::map_gateway_error;
use crate::interlock::{self, InterlockFlags};
use crate::model::{CalibrationDataset, DetectorDataset, Measurement};
use crate::params::RunParameters;
use crate::status::{RunEvent, RunOutcome, RunState};
use crate::util::{mean, progress_percent};

/// Mode value restored at cleanup (beam-sync).
pub const MODE_BASELINE: i64 = 0;

/// Endpoints a run drives for one hall/laser pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HallPvSet {
    pub attenuator: String,
    pub mode: String,
    pub current: String,
    pub master_fsd: String,
}

#[derive(Clone)]
pub struct SequencerCfg {
    pub pvs: HallPvSet,
    /// Per get/put.
    pub timeout: Duration,
    /// For the interlock monitor to report connected.
    pub connect_timeout: Duration,
    /// False is read-only mode: attenuator and mode are never written.
    pub write_allowed: bool,
    /// Length of one "settle second". Tests shrink it.
    pub settle_unit: Duration,
    /// Pause between samples within a step.
    pub dwell: Duration,
    pub operator: String,
    pub clock: Arc<dyn Clock + Send + Sync>,
}

impl core::fmt::Debug for SequencerCfg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SequencerCfg")
            .field("pvs", &self.pvs)
            .field("timeout", &self.timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("write_allowed", &self.write_allowed)
            .field("settle_unit", &self.settle_unit)
            .field("dwell", &self.dwell)
            .field("operator", &self.operator)
            .finish_non_exhaustive()
    }
}

impl SequencerCfg {
    /// Production timing: 2 s gateway timeout, 5 s connect timeout, 1 s settle
    /// unit and dwell, read-only, system clock.
    pub fn new(pvs: HallPvSet) -> Self {
        Self {
            pvs,
            timeout: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(5000),
            write_allowed: false,
            settle_unit: Duration::from_secs(1),
            dwell: Duration::from_secs(1),
            operator: String::new(),
            clock: Arc::new(SystemClock::new()),
        }
    }
}

/// Why a step attempt or the step loop stopped early.
enum Interrupt {
    Interlock(&'static str),
    Cancelled,
    Fatal(CalibrateError),
}

impl From<Cancelled> for Interrupt {
    fn from(_: Cancelled) -> Self {
        Interrupt::Cancelled
    }
}

impl From<CalibrateError> for Interrupt {
    fn from(e: CalibrateError) -> Self {
        Interrupt::Fatal(e)
    }
}

pub struct Sequencer<G: Gateway> {
    gateway: G,
    params: RunParameters,
    cfg: SequencerCfg,
    control: Arc<RunControl>,
    flags: Arc<InterlockFlags>,
    events: xch::Sender<RunEvent>,
    /// One growing sequence per detector, in roster order.
    measurements: Vec<Vec<Measurement>>,
}

impl<G: Gateway> Sequencer<G> {
    pub fn new(
        gateway: G,
        params: RunParameters,
        cfg: SequencerCfg,
        control: Arc<RunControl>,
        events: xch::Sender<RunEvent>,
    ) -> Self {
        let measurements = vec![Vec::new(); params.detectors.len()];
        Self {
            gateway,
            params,
            cfg,
            control,
            flags: Arc::new(InterlockFlags::new()),
            events,
            measurements,
        }
    }

    fn status(&self, state: RunState, step: u64, sample: Option<u64>) {
        tracing::debug!(state = %state, step, sample, "run state");
        let _ = self.events.send(RunEvent::Status {
            state,
            step,
            sample,
        });
    }

    fn get(&self, pv: &str) -> Result<PvValue, CalibrateError> {
        self.gateway
            .get(pv, self.cfg.timeout)
            .map_err(|e| map_gateway_error(pv, GatewayOp::Get, &*e))
    }

    fn put(&self, pv: &str, value: PvValue) -> Result<(), CalibrateError> {
        self.gateway
            .put(pv, value, self.cfg.timeout)
            .map_err(|e| map_gateway_error(pv, GatewayOp::Put, &*e))
    }

    /// Numeric read; anything else is logged and counted as zero.
    fn read_number(&self, pv: &str) -> Result<f64, CalibrateError> {
        let v = self.get(pv)?;
        Ok(v.as_f64().unwrap_or_else(|| {
            tracing::warn!(pv, value = %v, "non-numeric reading; using 0.0");
            0.0
        }))
    }

    /// Run to completion, cancellation or failure.
    pub fn run(mut self) -> Result<RunOutcome, CalibrateError> {
        let p = &self.params;
        tracing::info!(
            hall = %p.hall,
            laser = %p.laser,
            min = p.min_attenuator,
            max = p.max_attenuator,
            steps = p.steps,
            settle = p.settle_seconds,
            samples = p.samples_per_step,
            detectors = p.detectors.len(),
            write_allowed = self.cfg.write_allowed,
            "calibration run start"
        );
        self.status(RunState::Idle, 0, None);

        let fsd = self.cfg.pvs.master_fsd.clone();
        let listener = interlock::listener(Arc::clone(&self.flags), Arc::clone(&self.control));
        let sub = self
            .gateway
            .subscribe(&fsd, listener)
            .map_err(|e| map_gateway_error(&fsd, GatewayOp::Subscribe, &*e))?;

        let result = self.run_subscribed();
        self.gateway.unsubscribe(sub);

        match &result {
            Ok(outcome) => {
                let label = match outcome {
                    RunOutcome::Complete(_) => "complete",
                    RunOutcome::Partial(_) => "partial",
                    RunOutcome::NoData => "no data",
                };
                let measurements: usize = self.measurements.iter().map(Vec::len).sum();
                tracing::info!(outcome = label, measurements, "calibration run finished");
            }
            Err(e) => tracing::error!(error = %e, "calibration run failed"),
        }
        self.status(RunState::Done, self.last_step(), None);
        result
    }

    fn last_step(&self) -> u64 {
        u64::try_from(self.params.steps).unwrap_or(0)
    }

    fn run_subscribed(&mut self) -> Result<RunOutcome, CalibrateError> {
        let fsd = self.cfg.pvs.master_fsd.clone();
        match self.control.wait_connected(self.cfg.connect_timeout) {
            Ok(true) => {}
            Ok(false) => {
                return Err(CalibrateError::Gateway {
                    pv: fsd,
                    op: GatewayOp::Subscribe,
                    kind: GatewayErrorKind::Timeout,
                    message: format!(
                        "interlock monitor delivered no value within {} ms",
                        self.cfg.connect_timeout.as_millis()
                    ),
                });
            }
            Err(Cancelled) => return Ok(RunOutcome::NoData),
        }

        let atten_pv = self.cfg.pvs.attenuator.clone();
        let original = self.get(&atten_pv)?;
        let Some(original) = original.as_f64() else {
            return Err(CalibrateError::Gateway {
                pv: atten_pv,
                op: GatewayOp::Get,
                kind: GatewayErrorKind::Protocol,
                message: format!("attenuator value {original} is not numeric"),
            });
        };
        tracing::debug!(original, "attenuator position before run");

        let primary = self.step_loop();
        let cleanup = self.cleanup(original);
        let outcome = match primary {
            Ok(()) => Ok(RunOutcome::Complete(self.dataset())),
            Err(Interrupt::Cancelled) => {
                let ds = self.dataset();
                if ds.has_data() {
                    Ok(RunOutcome::Partial(ds))
                } else {
                    Ok(RunOutcome::NoData)
                }
            }
            Err(Interrupt::Fatal(e)) => Err(e),
            Err(Interrupt::Interlock(m)) => Err(CalibrateError::Interlock(m.to_string())),
        };

        match (outcome, cleanup) {
            (r, Ok(())) => r,
            (Ok(o), Err(ce)) => Err(CalibrateError::Cleanup {
                source: Box::new(ce),
                salvaged: o.dataset().cloned().map(Box::new),
            }),
            (Err(e), Err(ce)) => {
                tracing::error!(error = %ce, "cleanup failed after run error");
                Err(e)
            }
        }
    }

    fn step_loop(&mut self) -> Result<(), Interrupt> {
        let steps = self.last_step();
        for step in 0..=steps {
            loop {
                match self.do_step(step) {
                    Ok(row) => {
                        for (seq, m) in self.measurements.iter_mut().zip(row) {
                            seq.push(m);
                        }
                        break;
                    }
                    Err(Interrupt::Interlock(why)) => {
                        tracing::warn!(step, reason = why, "interlock fault; waiting for operator");
                        let seen = self.control.resume_generation();
                        self.status(RunState::WaitingOnInterlock, step, None);
                        self.control.wait_for_resume(seen)?;
                        tracing::info!(step, "resumed; retrying step");
                    }
                    Err(other) => return Err(other),
                }
            }
            let percent = progress_percent(step, steps);
            let _ = self.events.send(RunEvent::Progress { percent });
        }
        Ok(())
    }

    /// One attempt at `step`. Returns one measurement per detector.
    fn do_step(&self, step: u64) -> Result<Vec<Measurement>, Interrupt> {
        self.flags.begin_attempt();
        if self.flags.is_tripped_now() {
            return Err(Interrupt::Interlock("interlock tripped before step"));
        }
        if self.control.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }

        let attenuator = self
            .params
            .attenuator_for_step(i64::try_from(step).unwrap_or(i64::MAX));
        self.status(RunState::Adjusting, step, None);
        if self.cfg.write_allowed {
            #[allow(clippy::cast_precision_loss)]
            let value = PvValue::Double(attenuator as f64);
            self.put(&self.cfg.pvs.attenuator, value)?;
        } else {
            tracing::warn!(step, attenuator, "read-only mode; attenuator not moved");
        }

        self.status(RunState::Settling, step, None);
        let settle = self
            .cfg
            .settle_unit
            .saturating_mul(u32::try_from(self.params.settle_seconds).unwrap_or(u32::MAX));
        self.control.sleep(settle)?;

        self.status(RunState::Reading, step, None);
        let current = self.read_number(&self.cfg.pvs.current)?;
        tracing::debug!(step, attenuator, current, "beam current");

        let samples = u64::try_from(self.params.samples_per_step).unwrap_or(1);
        let mut taken: Vec<Vec<f64>> = self
            .params
            .detectors
            .iter()
            .map(|_| Vec::with_capacity(usize::try_from(samples).unwrap_or(0)))
            .collect();
        for i in 0..samples {
            self.status(RunState::Sampling, step, Some(i + 1));
            for (d, det) in self.params.detectors.iter().enumerate() {
                let v = self.read_number(&det.dose_read_pv)?;
                tracing::trace!(step, sample = i + 1, pv = %det.dose_read_pv, value = v, "sample");
                taken[d].push(v);
            }
            if self.control.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            if self.flags.tripped_during_step() {
                return Err(Interrupt::Interlock("interlock tripped during step"));
            }
            if i + 1 < samples {
                self.status(RunState::Dwelling, step, Some(i + 1));
                self.control.sleep(self.cfg.dwell)?;
            }
        }

        Ok(taken
            .iter()
            .map(|s| Measurement::new(current, mean(s)))
            .collect())
    }

    /// Restore the attenuator and mode. Both writes are attempted; the first
    /// failure is returned.
    fn cleanup(&self, original: f64) -> Result<(), CalibrateError> {
        if !self.cfg.write_allowed {
            tracing::warn!("read-only mode; attenuator and mode left as they are");
            return Ok(());
        }
        tracing::info!(attenuator = original, "restoring attenuator and mode");
        let restored = self.put(&self.cfg.pvs.attenuator, PvValue::Double(original));
        let mode = self.put(&self.cfg.pvs.mode, PvValue::Int(MODE_BASELINE));
        restored.and(mode)
    }

    fn dataset(&self) -> CalibrationDataset {
        let p = &self.params;
        CalibrationDataset {
            hall: p.hall,
            target: p.target.clone(),
            pass: p.pass.clone(),
            note: p.note.clone(),
            calibrated_at: self.cfg.clock.minute(),
            calibrated_by: self.cfg.operator.clone(),
            datasets: p
                .detectors
                .iter()
                .zip(&self.measurements)
                .map(|(d, m)| DetectorDataset::new(d.clone(), m.clone()))
                .collect(),
        }
    }
}
