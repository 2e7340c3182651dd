#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Ion-chamber dose-rate calibration (control-system agnostic).
//!
//! All control-system access goes through `icalibrate_traits::Gateway`, and
//! timestamps through `icalibrate_traits::Clock`.
//!
//! ## Architecture
//!
//! - **Model**: halls, lasers, detectors, measurements and datasets (`model`)
//! - **Parameters**: run parameters, validation and derived schedule (`params`)
//! - **Fitting**: linear and log-linear least squares, trip setpoints (`fit`)
//! - **Sequencer**: the attenuator sweep with interlock pause/resume (`sequencer`)
//! - **Run control**: background thread, events, cancel/resume, result (`runner`)
//! - **Files and export**: HCD datasets (`files`), setpoints and SNAP files (`export`)
//!
//! ## Threads
//!
//! A run owns exactly one thread. The gateway's notification thread only
//! updates the interlock flags; everything else about the run is touched by
//! the run thread alone until its result is published.

pub mod control;
pub mod conversions;
pub mod error;
pub mod export;
pub mod files;
pub mod fit;
pub mod gateway_error;
pub mod interlock;
pub mod model;
pub mod params;
pub mod runner;
pub mod sequencer;
pub mod status;
pub mod util;

pub use conversions::ConfigExt;
pub use error::{BuildError, CalibrateError, GatewayErrorKind, GatewayOp, Report, Result};
pub use fit::{DetectorFit, Fit, FitKind, SetpointParams};
pub use model::{
    CalibrationDataset, Detector, DetectorDataset, Hall, HallSettings, Laser, Measurement,
    TripSetpoint,
};
pub use params::RunParameters;
pub use runner::{RunControlHandle, RunHandle, RunResult, start};
pub use sequencer::{HallPvSet, SequencerCfg};
pub use status::{RunEvent, RunOutcome, RunState};
