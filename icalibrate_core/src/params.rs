//! Run parameters, their derived quantities, and a type-state builder.
//!
//! The builder enforces at compile time that hall and laser are chosen before
//! `build()` is available. `try_build()` is always available for dynamic checks.
use std::marker::PhantomData;

use crate::error::{BuildError, CalibrateError, Result};
use crate::model::{Detector, Hall, Laser};

/// An operator's choice of run configuration. Validate before starting a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub hall: Hall,
    pub laser: Laser,
    pub target: String,
    pub pass: String,
    pub note: String,
    pub min_attenuator: i64,
    pub max_attenuator: i64,
    pub steps: i64,
    pub settle_seconds: i64,
    pub samples_per_step: i64,
    pub detectors: Vec<Detector>,
}

impl RunParameters {
    pub fn builder() -> RunParametersBuilder<Missing, Missing> {
        RunParametersBuilder::default()
    }

    /// Check every precondition, reporting the first rule broken.
    pub fn validate(&self) -> std::result::Result<(), CalibrateError> {
        let fail = |m: &str| Err(CalibrateError::Validation(m.to_string()));
        if self.min_attenuator < 0 {
            return fail("Min Attenuator can not be negative");
        }
        if self.min_attenuator > self.max_attenuator {
            return fail("Min Attenuator can not be greater than Max Attenuator");
        }
        if self.steps < 1 {
            return fail("# of Attenuator Steps must be more than 0");
        }
        if self.compute_attenuator_range() < self.steps {
            return fail("Number of Attenuator steps is greater than attenuator range");
        }
        if self.settle_seconds < 1 {
            return fail("Step Settle Time (Seconds) must be more than 0");
        }
        if self.samples_per_step < 1 {
            return fail("# of Samples Per Step must be more than 0");
        }
        Ok(())
    }

    pub fn compute_attenuator_range(&self) -> i64 {
        self.max_attenuator.saturating_sub(self.min_attenuator)
    }

    /// `round(range / steps)`; every step but the last advances by this much.
    pub fn compute_step_size(&self) -> i64 {
        if self.steps < 1 {
            return 0;
        }
        (self.compute_attenuator_range() as f64 / self.steps as f64).round() as i64
    }

    /// Operator-facing estimate: `steps * settle + steps * samples` seconds.
    pub fn compute_duration_seconds(&self) -> i64 {
        self.steps
            .saturating_mul(self.settle_seconds)
            .saturating_add(self.steps.saturating_mul(self.samples_per_step))
    }

    /// Attenuator value for `step` in `0..=steps`. The last step is `max` exactly;
    /// intermediate steps never exceed it.
    pub fn attenuator_for_step(&self, step: i64) -> i64 {
        if step >= self.steps {
            return self.max_attenuator;
        }
        let v = self
            .min_attenuator
            .saturating_add(step.saturating_mul(self.compute_step_size()));
        v.min(self.max_attenuator)
    }

    /// Number of measurement points a full run records per detector.
    pub fn point_count(&self) -> i64 {
        self.steps.saturating_add(1)
    }
}

// ── Type-state markers ───────────────────────────────────────────────────────

pub struct Missing;
pub struct Set;

pub struct RunParametersBuilder<H, L> {
    hall: Option<Hall>,
    laser: Option<Laser>,
    target: String,
    pass: String,
    note: String,
    min_attenuator: i64,
    max_attenuator: i64,
    steps: i64,
    settle_seconds: i64,
    samples_per_step: i64,
    detectors: Vec<Detector>,
    _h: PhantomData<H>,
    _l: PhantomData<L>,
}

impl Default for RunParametersBuilder<Missing, Missing> {
    fn default() -> Self {
        Self {
            hall: None,
            laser: None,
            target: String::new(),
            pass: String::new(),
            note: String::new(),
            min_attenuator: 0,
            max_attenuator: 100,
            steps: 10,
            settle_seconds: 5,
            samples_per_step: 3,
            detectors: Vec::new(),
            _h: PhantomData,
            _l: PhantomData,
        }
    }
}

impl<H, L> RunParametersBuilder<H, L> {
    fn retype<H2, L2>(self) -> RunParametersBuilder<H2, L2> {
        RunParametersBuilder {
            hall: self.hall,
            laser: self.laser,
            target: self.target,
            pass: self.pass,
            note: self.note,
            min_attenuator: self.min_attenuator,
            max_attenuator: self.max_attenuator,
            steps: self.steps,
            settle_seconds: self.settle_seconds,
            samples_per_step: self.samples_per_step,
            detectors: self.detectors,
            _h: PhantomData,
            _l: PhantomData,
        }
    }

    pub fn hall(mut self, hall: Hall) -> RunParametersBuilder<Set, L> {
        self.hall = Some(hall);
        self.retype()
    }

    pub fn laser(mut self, laser: Laser) -> RunParametersBuilder<H, Set> {
        self.laser = Some(laser);
        self.retype()
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn pass(mut self, pass: impl Into<String>) -> Self {
        self.pass = pass.into();
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn attenuator_range(mut self, min: i64, max: i64) -> Self {
        self.min_attenuator = min;
        self.max_attenuator = max;
        self
    }

    pub fn steps(mut self, steps: i64) -> Self {
        self.steps = steps;
        self
    }

    pub fn settle_seconds(mut self, secs: i64) -> Self {
        self.settle_seconds = secs;
        self
    }

    pub fn samples_per_step(mut self, n: i64) -> Self {
        self.samples_per_step = n;
        self
    }

    pub fn detectors(mut self, detectors: Vec<Detector>) -> Self {
        self.detectors = detectors;
        self
    }

    /// Fallible build available in any type-state; validates the result.
    pub fn try_build(self) -> Result<RunParameters> {
        let hall = self
            .hall
            .ok_or_else(|| eyre::Report::new(BuildError::MissingHall))?;
        let laser = self
            .laser
            .ok_or_else(|| eyre::Report::new(BuildError::MissingLaser))?;
        let params = RunParameters {
            hall,
            laser,
            target: self.target,
            pass: self.pass,
            note: self.note,
            min_attenuator: self.min_attenuator,
            max_attenuator: self.max_attenuator,
            steps: self.steps,
            settle_seconds: self.settle_seconds,
            samples_per_step: self.samples_per_step,
            detectors: self.detectors,
        };
        params.validate().map_err(eyre::Report::new)?;
        Ok(params)
    }
}

impl RunParametersBuilder<Set, Set> {
    pub fn build(self) -> Result<RunParameters> {
        self.try_build()
    }
}
