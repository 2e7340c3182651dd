//! Domain values: halls, lasers, detectors, measurements and datasets.
//!
//! Everything here is a plain value. A dataset's measurements are replaced
//! wholesale, never edited in place, so fits computed from them stay coherent.
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;

use crate::error::BuildError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Hall {
    A,
    C,
    D,
}

impl Hall {
    pub const ALL: [Hall; 3] = [Hall::A, Hall::C, Hall::D];

    pub fn as_str(self) -> &'static str {
        match self {
            Hall::A => "A",
            Hall::C => "C",
            Hall::D => "D",
        }
    }
}

impl fmt::Display for Hall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Hall {
    type Err = BuildError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Hall::A),
            "C" => Ok(Hall::C),
            "D" => Ok(Hall::D),
            _ => Err(BuildError::UnknownHall(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Laser {
    A,
    B,
    C,
    D,
}

impl Laser {
    pub const ALL: [Laser; 4] = [Laser::A, Laser::B, Laser::C, Laser::D];

    pub fn as_str(self) -> &'static str {
        match self {
            Laser::A => "A",
            Laser::B => "B",
            Laser::C => "C",
            Laser::D => "D",
        }
    }
}

impl fmt::Display for Laser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Laser {
    type Err = BuildError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Laser::A),
            "B" => Ok(Laser::B),
            "C" => Ok(Laser::C),
            "D" => Ok(Laser::D),
            _ => Err(BuildError::UnknownLaser(s.to_string())),
        }
    }
}

/// One ion chamber and the endpoints used to read dose rate and read/write its trip setpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Detector {
    pub epics_name: String,
    pub friendly_name: Option<String>,
    pub ced_name: Option<String>,
    pub dose_read_pv: String,
    pub setpoint_read_pv: String,
    pub setpoint_write_pv: String,
}

impl Detector {
    /// Build a detector whose endpoints are `epics_name` plus the hall's suffixes.
    pub fn with_suffixes(
        epics_name: &str,
        friendly_name: Option<String>,
        ced_name: Option<String>,
        dose_read_suffix: &str,
        setpoint_read_suffix: &str,
        setpoint_write_suffix: &str,
    ) -> Self {
        Self {
            epics_name: epics_name.to_string(),
            friendly_name,
            ced_name,
            dose_read_pv: format!("{epics_name}{dose_read_suffix}"),
            setpoint_read_pv: format!("{epics_name}{setpoint_read_suffix}"),
            setpoint_write_pv: format!("{epics_name}{setpoint_write_suffix}"),
        }
    }

    /// Friendly name if set, else the network name.
    pub fn display_name(&self) -> &str {
        self.friendly_name.as_deref().unwrap_or(&self.epics_name)
    }

    /// `friendly (epics) {ced}` with absent parts left out.
    pub fn full_name(&self) -> String {
        let mut s = match &self.friendly_name {
            Some(f) => format!("{f} ({})", self.epics_name),
            None => self.epics_name.clone(),
        };
        if let Some(ced) = &self.ced_name {
            s.push_str(&format!(" {{{ced}}}"));
        }
        s
    }
}

/// Averaged dose rate at one beam current.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub current: f64,
    pub dose_rate: f64,
}

impl Measurement {
    pub fn new(current: f64, dose_rate: f64) -> Self {
        Self { current, dose_rate }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectorDataset {
    pub detector: Detector,
    measurements: Vec<Measurement>,
}

impl DetectorDataset {
    pub fn new(detector: Detector, measurements: Vec<Measurement>) -> Self {
        Self {
            detector,
            measurements,
        }
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    /// Same detector, new measurement sequence.
    #[must_use]
    pub fn with_measurements(&self, measurements: Vec<Measurement>) -> Self {
        Self {
            detector: self.detector.clone(),
            measurements,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.measurements.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationDataset {
    pub hall: Hall,
    pub target: String,
    pub pass: String,
    pub note: String,
    pub calibrated_at: NaiveDateTime,
    pub calibrated_by: String,
    pub datasets: Vec<DetectorDataset>,
}

impl CalibrationDataset {
    /// True when at least one detector recorded a measurement.
    pub fn has_data(&self) -> bool {
        self.datasets.iter().any(|d| !d.is_empty())
    }

    pub fn measurement_count(&self) -> usize {
        self.datasets.iter().map(|d| d.measurements().len()).sum()
    }

    /// `<Hall>-<yyyy-MM-dd_HHmm>_<target>_Pass-<pass>.hcd`
    pub fn file_name(&self) -> String {
        let target = crate::util::sanitize_target(&self.target);
        let pass = crate::util::sanitize_pass(&self.pass);
        format!(
            "{}-{}_{target}_Pass-{pass}.hcd",
            self.hall,
            self.calibrated_at.format("%Y-%m-%d_%H%M")
        )
    }
}

/// A computed dose-rate trip threshold for one detector.
#[derive(Debug, Clone, PartialEq)]
pub struct TripSetpoint {
    pub detector: Detector,
    pub dose_rate: f64,
}

/// Per-hall presentation limits and margin policy.
#[derive(Debug, Clone, PartialEq)]
pub struct HallSettings {
    pub current_units: String,
    pub max_current: f64,
    pub max_margin: f64,
    pub negative_margin_targets: Vec<String>,
}

impl HallSettings {
    /// -1.0 for targets whose margin defaults negative, else 1.0.
    pub fn default_margin_sign(&self, target: &str) -> f64 {
        let t = target.trim();
        if self
            .negative_margin_targets
            .iter()
            .any(|n| n.trim().eq_ignore_ascii_case(t))
        {
            -1.0
        } else {
            1.0
        }
    }

    /// Clamp an operator-entered margin magnitude to `max_margin`, keeping its sign.
    pub fn clamp_margin(&self, margin: f64) -> f64 {
        margin.clamp(-self.max_margin, self.max_margin)
    }
}
