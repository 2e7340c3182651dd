#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schema and on-disk formats for the calibration tool.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - [`hcd`] reads and renders hall calibration dataset files.
//! - [`snap`] renders setpoint snapshot files.
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use eyre::WrapErr;
use serde::Deserialize;

pub mod hcd;
pub mod snap;

/// Halls that own a detector roster and a beam-current readback.
pub const HALLS: [&str; 3] = ["A", "C", "D"];
/// Lasers whose attenuator can be driven.
pub const LASERS: [&str; 4] = ["A", "B", "C", "D"];

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GatewayCfg {
    /// Per get/put timeout.
    pub timeout_ms: u64,
    /// How long to wait for the interlock monitor to connect before a run.
    pub connect_timeout_ms: u64,
    /// Read-only safety mode when false: attenuator, mode and setpoint writes are skipped.
    pub write_allowed: bool,
}

impl Default for GatewayCfg {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            connect_timeout_ms: 5000,
            write_allowed: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LaserPvs {
    pub attenuator: String,
    pub mode: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PvsCfg {
    pub master_fsd_pv: String,
    /// Beam-current readback keyed by hall.
    #[serde(default)]
    pub current: BTreeMap<String, String>,
    #[serde(default)]
    pub laser: BTreeMap<String, LaserPvs>,
}

/// Operator defaults offered for a new run.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RunDefaults {
    pub min_attenuator: i64,
    pub max_attenuator: i64,
    pub steps: i64,
    pub settle_seconds: i64,
    pub samples_per_step: i64,
    /// Pause between samples within one step.
    pub dwell_ms: u64,
}

impl Default for RunDefaults {
    fn default() -> Self {
        Self {
            min_attenuator: 0,
            max_attenuator: 100,
            steps: 10,
            settle_seconds: 5,
            samples_per_step: 3,
            dwell_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct DetectorEntry {
    pub epics_name: String,
    #[serde(default)]
    pub friendly_name: Option<String>,
    #[serde(default)]
    pub ced_name: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HallCfg {
    pub dose_read_suffix: String,
    pub setpoint_read_suffix: String,
    pub setpoint_write_suffix: String,
    pub current_units: String,
    pub max_current: f64,
    pub max_margin: f64,
    /// Targets whose setpoint margin defaults to negative.
    pub negative_margin_targets: Vec<String>,
    pub detectors: Vec<DetectorEntry>,
}

impl Default for HallCfg {
    fn default() -> Self {
        Self {
            dose_read_suffix: ":DOSE".into(),
            setpoint_read_suffix: ":SETPOINT".into(),
            setpoint_write_suffix: ":SETPOINT_SET".into(),
            current_units: "uA".into(),
            max_current: 100.0,
            max_margin: 100.0,
            negative_margin_targets: Vec::new(),
            detectors: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

/// Beam model for the simulated gateway.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimulationCfg {
    pub current_per_attenuator: f64,
    pub dose_per_current: f64,
    pub noise: f64,
    /// Attenuator position before a run starts.
    pub initial_attenuator: f64,
    /// Values the simulated setpoint-read PVs report, keyed by PV name.
    /// Unlisted PVs have no value.
    pub setpoints: BTreeMap<String, f64>,
}

impl Default for SimulationCfg {
    fn default() -> Self {
        Self {
            current_per_attenuator: 1.0,
            dose_per_current: 10.0,
            noise: 0.0,
            initial_attenuator: 0.0,
            setpoints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayCfg,
    pub pvs: PvsCfg,
    #[serde(default)]
    pub run: RunDefaults,
    #[serde(default)]
    pub hall: BTreeMap<String, HallCfg>,
    #[serde(default)]
    pub logging: Logging,
    #[serde(default)]
    pub simulation: SimulationCfg,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

/// Read, parse and validate a config file.
pub fn load_file(path: &Path) -> eyre::Result<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let cfg = load_toml(&text).wrap_err_with(|| format!("parse config {}", path.display()))?;
    cfg.validate()
        .wrap_err_with(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn require_pv(name: &str, what: &str) -> eyre::Result<()> {
    if name.trim().is_empty() {
        eyre::bail!("{what} must not be empty");
    }
    Ok(())
}

impl HallCfg {
    /// Whether the margin for `target` defaults to negative.
    pub fn negative_margin_for(&self, target: &str) -> bool {
        let t = target.trim();
        self.negative_margin_targets
            .iter()
            .any(|n| n.trim().eq_ignore_ascii_case(t))
    }
}

impl Config {
    pub fn hall(&self, hall: &str) -> Option<&HallCfg> {
        self.hall.get(hall)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        // Gateway
        if self.gateway.timeout_ms == 0 {
            eyre::bail!("gateway.timeout_ms must be >= 1");
        }
        if self.gateway.connect_timeout_ms == 0 {
            eyre::bail!("gateway.connect_timeout_ms must be >= 1");
        }

        // PVs
        require_pv(&self.pvs.master_fsd_pv, "pvs.master_fsd_pv")?;
        for (hall, pv) in &self.pvs.current {
            if !HALLS.contains(&hall.as_str()) {
                eyre::bail!("pvs.current.{hall}: unknown hall (expected one of A, C, D)");
            }
            require_pv(pv, &format!("pvs.current.{hall}"))?;
        }
        for (laser, pvs) in &self.pvs.laser {
            if !LASERS.contains(&laser.as_str()) {
                eyre::bail!("pvs.laser.{laser}: unknown laser (expected one of A, B, C, D)");
            }
            require_pv(&pvs.attenuator, &format!("pvs.laser.{laser}.attenuator"))?;
            require_pv(&pvs.mode, &format!("pvs.laser.{laser}.mode"))?;
        }

        // Run defaults mirror the run parameter rules.
        let r = &self.run;
        if r.min_attenuator < 0 {
            eyre::bail!("run.min_attenuator must be >= 0");
        }
        if r.min_attenuator > r.max_attenuator {
            eyre::bail!("run.min_attenuator must be <= run.max_attenuator");
        }
        if r.steps < 1 {
            eyre::bail!("run.steps must be >= 1");
        }
        if r.max_attenuator - r.min_attenuator < r.steps {
            eyre::bail!("run.steps must not exceed the attenuator range");
        }
        if r.settle_seconds < 1 {
            eyre::bail!("run.settle_seconds must be >= 1");
        }
        if r.samples_per_step < 1 {
            eyre::bail!("run.samples_per_step must be >= 1");
        }

        // Halls
        for (name, hall) in &self.hall {
            if !HALLS.contains(&name.as_str()) {
                eyre::bail!("hall.{name}: unknown hall (expected one of A, C, D)");
            }
            require_pv(&hall.dose_read_suffix, &format!("hall.{name}.dose_read_suffix"))?;
            require_pv(
                &hall.setpoint_read_suffix,
                &format!("hall.{name}.setpoint_read_suffix"),
            )?;
            require_pv(
                &hall.setpoint_write_suffix,
                &format!("hall.{name}.setpoint_write_suffix"),
            )?;
            if !(hall.max_current.is_finite() && hall.max_current > 0.0) {
                eyre::bail!("hall.{name}.max_current must be > 0");
            }
            if !(hall.max_margin.is_finite() && hall.max_margin >= 0.0) {
                eyre::bail!("hall.{name}.max_margin must be >= 0");
            }
            let mut seen = BTreeSet::new();
            for d in &hall.detectors {
                require_pv(&d.epics_name, &format!("hall.{name}.detectors.epics_name"))?;
                if !seen.insert(d.epics_name.as_str()) {
                    eyre::bail!("hall.{name}: duplicate detector {}", d.epics_name);
                }
            }
        }

        // Logging
        if let Some(rot) = self.logging.rotation.as_deref()
            && !matches!(rot, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never, daily, hourly (got {rot})");
        }

        // Simulation
        let s = &self.simulation;
        if !(s.noise.is_finite() && (0.0..1.0).contains(&s.noise)) {
            eyre::bail!("simulation.noise must be in [0.0, 1.0)");
        }

        Ok(())
    }
}
