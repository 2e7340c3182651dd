//! Writing computed trip setpoints to the detectors and to SNAP files.
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDateTime;
use eyre::WrapErr;
use icalibrate_config::snap::{self, SnapEntry};
use icalibrate_traits::{Gateway, PvValue};

use crate::error::{CalibrateError, GatewayOp, Result};
use crate::gateway_error::map_gateway_error;
use crate::model::{Detector, TripSetpoint};
use crate::util::write_atomic;

/// Put every setpoint to its detector's setpoint-write PV, in order.
///
/// In read-only mode nothing is written and `Ok(0)` is returned. Otherwise
/// stops at the first failure; returns the number written.
pub fn write_setpoints<G: Gateway + ?Sized>(
    gateway: &G,
    setpoints: &[TripSetpoint],
    timeout: Duration,
    write_allowed: bool,
) -> std::result::Result<usize, CalibrateError> {
    if !write_allowed {
        tracing::warn!(count = setpoints.len(), "read-only mode; setpoints not written");
        return Ok(0);
    }
    for sp in setpoints {
        let pv = &sp.detector.setpoint_write_pv;
        tracing::info!(pv = %pv, dose_rate = sp.dose_rate, "writing trip setpoint");
        gateway
            .put(pv, PvValue::Double(sp.dose_rate), timeout)
            .map_err(|e| map_gateway_error(pv, GatewayOp::Put, &*e))?;
    }
    Ok(setpoints.len())
}

/// Current setpoint of each detector, `None` where the read failed or was not numeric.
pub fn read_existing_setpoints<G: Gateway + ?Sized>(
    gateway: &G,
    detectors: &[Detector],
    timeout: Duration,
) -> Vec<Option<f64>> {
    detectors
        .iter()
        .map(|d| match gateway.get(&d.setpoint_read_pv, timeout) {
            Ok(v) => v.as_f64(),
            Err(e) => {
                tracing::warn!(pv = %d.setpoint_read_pv, error = %e, "existing setpoint unavailable");
                None
            }
        })
        .collect()
}

pub fn snap_entries(setpoints: &[TripSetpoint]) -> Vec<SnapEntry> {
    setpoints
        .iter()
        .map(|sp| SnapEntry {
            pv: sp.detector.setpoint_write_pv.clone(),
            value: sp.dose_rate,
        })
        .collect()
}

/// Write a SNAP file for `setpoints` atomically.
pub fn save_snap(
    path: &Path,
    setpoints: &[TripSetpoint],
    time: NaiveDateTime,
    login: &str,
) -> Result<()> {
    let text = snap::render(time, login, &snap_entries(setpoints));
    write_atomic(path, text.as_bytes())
        .wrap_err_with(|| format!("write SNAP file {}", path.display()))
}
