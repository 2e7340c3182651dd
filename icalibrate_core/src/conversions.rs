//! Bridges from `icalibrate_config` types to core types.
//!
//! Configuration and file formats live in `icalibrate_config` and know nothing
//! about the domain model; everything that resolves them into detectors, PV sets
//! and datasets is here.
use std::time::Duration;

use eyre::WrapErr;
use icalibrate_config::hcd::{BodyFormat, ChamberRecord, HcdFile};
use icalibrate_config::{Config, HallCfg, RunDefaults};

use crate::error::{BuildError, Report, Result};
use crate::model::{CalibrationDataset, Detector, DetectorDataset, Hall, HallSettings, Laser, Measurement};
use crate::params::RunParametersBuilder;
use crate::sequencer::{HallPvSet, SequencerCfg};

// ── Config ───────────────────────────────────────────────────────────────────

/// Domain lookups over a loaded [`Config`].
pub trait ConfigExt {
    /// Detector roster for `hall`, endpoints built from the hall's suffixes.
    /// Empty when the hall has no section.
    fn detectors(&self, hall: Hall) -> Vec<Detector>;

    /// Attenuator/mode of `laser`, current readback of `hall`, and the master FSD.
    fn pv_set(&self, hall: Hall, laser: Laser) -> Result<HallPvSet>;

    fn hall_settings(&self, hall: Hall) -> HallSettings;

    /// Sequencer timing and write policy for one run.
    fn sequencer_cfg(&self, hall: Hall, laser: Laser, operator: &str) -> Result<SequencerCfg>;
}

impl ConfigExt for Config {
    fn detectors(&self, hall: Hall) -> Vec<Detector> {
        self.hall(hall.as_str())
            .map(roster)
            .unwrap_or_default()
    }

    fn pv_set(&self, hall: Hall, laser: Laser) -> Result<HallPvSet> {
        let current = self
            .pvs
            .current
            .get(hall.as_str())
            .ok_or_else(|| {
                Report::new(BuildError::MissingPv {
                    what: "beam current PV",
                    key: format!("hall {hall}"),
                })
            })?;
        let laser_pvs = self.pvs.laser.get(laser.as_str()).ok_or_else(|| {
            Report::new(BuildError::MissingPv {
                what: "attenuator/mode PVs",
                key: format!("laser {laser}"),
            })
        })?;
        Ok(HallPvSet {
            attenuator: laser_pvs.attenuator.clone(),
            mode: laser_pvs.mode.clone(),
            current: current.clone(),
            master_fsd: self.pvs.master_fsd_pv.clone(),
        })
    }

    fn hall_settings(&self, hall: Hall) -> HallSettings {
        let cfg = self.hall(hall.as_str()).cloned().unwrap_or_default();
        HallSettings::from(&cfg)
    }

    fn sequencer_cfg(&self, hall: Hall, laser: Laser, operator: &str) -> Result<SequencerCfg> {
        let pvs = self
            .pv_set(hall, laser)
            .wrap_err_with(|| format!("resolving PVs for hall {hall}, laser {laser}"))?;
        let mut cfg = SequencerCfg::new(pvs);
        cfg.timeout = Duration::from_millis(self.gateway.timeout_ms);
        cfg.connect_timeout = Duration::from_millis(self.gateway.connect_timeout_ms);
        cfg.write_allowed = self.gateway.write_allowed;
        cfg.dwell = Duration::from_millis(self.run.dwell_ms);
        cfg.operator = operator.to_string();
        Ok(cfg)
    }
}

fn roster(cfg: &HallCfg) -> Vec<Detector> {
    cfg.detectors
        .iter()
        .map(|d| {
            Detector::with_suffixes(
                &d.epics_name,
                d.friendly_name.clone(),
                d.ced_name.clone(),
                &cfg.dose_read_suffix,
                &cfg.setpoint_read_suffix,
                &cfg.setpoint_write_suffix,
            )
        })
        .collect()
}

impl From<&HallCfg> for HallSettings {
    fn from(c: &HallCfg) -> Self {
        Self {
            current_units: c.current_units.clone(),
            max_current: c.max_current,
            max_margin: c.max_margin,
            negative_margin_targets: c.negative_margin_targets.clone(),
        }
    }
}

// ── Run defaults ─────────────────────────────────────────────────────────────

impl<H, L> RunParametersBuilder<H, L> {
    /// Seed numeric parameters from the `[run]` section.
    pub fn with_defaults(self, d: &RunDefaults) -> Self {
        self.attenuator_range(d.min_attenuator, d.max_attenuator)
            .steps(d.steps)
            .settle_seconds(d.settle_seconds)
            .samples_per_step(d.samples_per_step)
    }
}

// ── HCD files ────────────────────────────────────────────────────────────────

/// Dataset from a parsed HCD file. Chambers found in `hall_cfg`'s roster keep
/// their configured names; others get endpoints from the hall's suffixes.
pub fn dataset_from_hcd(file: &HcdFile, hall_cfg: &HallCfg) -> Result<CalibrationDataset> {
    let hall: Hall = file
        .hall
        .parse()
        .wrap_err("HCD file names an unknown hall")?;
    let known = roster(hall_cfg);
    let datasets = file
        .chambers
        .iter()
        .map(|c| {
            let detector = known
                .iter()
                .find(|d| d.epics_name == c.epics_name)
                .cloned()
                .unwrap_or_else(|| {
                    Detector::with_suffixes(
                        &c.epics_name,
                        c.friendly_name.clone(),
                        None,
                        &hall_cfg.dose_read_suffix,
                        &hall_cfg.setpoint_read_suffix,
                        &hall_cfg.setpoint_write_suffix,
                    )
                });
            let measurements = c
                .samples
                .iter()
                .map(|&(current, dose)| Measurement::new(current, dose))
                .collect();
            DetectorDataset::new(detector, measurements)
        })
        .collect();
    Ok(CalibrationDataset {
        hall,
        target: file.target.clone(),
        pass: file.pass.clone(),
        note: file.note.clone(),
        calibrated_at: file.calibrated_at,
        calibrated_by: file.calibrated_by.clone(),
        datasets,
    })
}

impl TryFrom<&HcdFile> for CalibrationDataset {
    type Error = Report;
    fn try_from(file: &HcdFile) -> Result<Self> {
        dataset_from_hcd(file, &HallCfg::default())
    }
}

impl From<&CalibrationDataset> for HcdFile {
    fn from(d: &CalibrationDataset) -> Self {
        Self {
            hall: d.hall.to_string(),
            target: d.target.clone(),
            pass: d.pass.clone(),
            note: d.note.clone(),
            calibrated_at: d.calibrated_at,
            calibrated_by: d.calibrated_by.clone(),
            format: BodyFormat::IndependentIcs,
            chambers: d
                .datasets
                .iter()
                .map(|ds| ChamberRecord {
                    epics_name: ds.detector.epics_name.clone(),
                    friendly_name: ds.detector.friendly_name.clone(),
                    samples: ds
                        .measurements()
                        .iter()
                        .map(|m| (m.current, m.dose_rate))
                        .collect(),
                })
                .collect(),
        }
    }
}
