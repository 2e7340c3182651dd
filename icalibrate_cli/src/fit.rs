//! `fit`, `export` and `self-check`: offline work on saved datasets and config.

use std::time::Duration;

use eyre::WrapErr;
use icalibrate_config::{Config, hcd};
use icalibrate_core::export::{read_existing_setpoints, save_snap, write_setpoints};
use icalibrate_core::conversions::dataset_from_hcd;
use icalibrate_core::{
    CalibrationDataset, ConfigExt, DetectorFit, FitKind, Hall, Laser, SetpointParams,
};
use icalibrate_gateway::SimulatedGateway;
use icalibrate_traits::PvValue;
use serde_json::json;

use crate::cli::FitArgs;
use crate::run::operator;

fn load(cfg: &Config, args: &FitArgs) -> eyre::Result<(CalibrationDataset, Vec<DetectorFit>)> {
    let file = hcd::read(&args.file)
        .wrap_err_with(|| format!("load hcd file {}", args.file.display()))?;
    let hall_cfg = cfg.hall(&file.hall).cloned().unwrap_or_default();
    let ds = dataset_from_hcd(&file, &hall_cfg)?;
    let settings = cfg.hall_settings(ds.hall);

    let current = args.current.unwrap_or(settings.max_current);
    let sign = if args.negative {
        -1.0
    } else {
        settings.default_margin_sign(&ds.target)
    };
    let margin = settings.clamp_margin(sign * args.margin.abs());
    let kind = if args.log {
        FitKind::LogLinear
    } else {
        FitKind::Linear
    };

    let fits = ds
        .datasets
        .iter()
        .filter(|d| !d.is_empty())
        .map(|d| {
            let mut fit = DetectorFit::new(d.clone());
            let (lo, hi) = fit.fit_range();
            let (min, max) = (args.min_index.unwrap_or(lo), args.max_index.unwrap_or(hi));
            if (min, max) != (lo, hi) && !fit.update_fit_range(min, max) {
                tracing::warn!(
                    detector = %d.detector.epics_name,
                    min,
                    max,
                    "fit range needs at least two points; fitting all measurements"
                );
            }
            fit.select(kind);
            fit.set_setpoint_params(SetpointParams {
                current,
                margin_percent: margin,
            });
            fit
        })
        .collect();
    Ok((ds, fits))
}

fn print_fits(fits: &[DetectorFit], existing: Option<&[Option<f64>]>, json: bool) {
    for (i, fit) in fits.iter().enumerate() {
        let det = &fit.dataset().detector;
        let old = existing.and_then(|e| e.get(i).copied().flatten());
        if json {
            println!(
                "{}",
                json!({
                    "detector": det.epics_name,
                    "name": det.display_name(),
                    "equation": fit.equation_label(),
                    "r_squared": fit.fit().r_squared,
                    "setpoint": fit.setpoint(),
                    "existing": old,
                })
            );
        } else {
            let old = old.map_or_else(String::new, |v| format!(" (was {v:.0})"));
            println!(
                "{:<12} {:<24} {:<22} R²={:>6}  setpoint={:.0}{old}",
                det.epics_name,
                det.display_name(),
                fit.equation_label(),
                fit.r_squared_label(),
                fit.setpoint(),
            );
        }
    }
}

fn snap(args: &FitArgs, fits: &[DetectorFit]) -> eyre::Result<()> {
    if let Some(path) = &args.snap {
        let sps: Vec<_> = fits.iter().map(DetectorFit::trip_setpoint).collect();
        let now = chrono::Local::now().naive_local();
        save_snap(path, &sps, now, &operator(None))?;
        tracing::info!(path = %path.display(), count = sps.len(), "wrote SNAP file");
    }
    Ok(())
}

pub fn fit(cfg: &Config, args: &FitArgs, json: bool) -> eyre::Result<()> {
    let (_, fits) = load(cfg, args)?;
    if fits.is_empty() {
        eyre::bail!("hcd file {} has no measurements", args.file.display());
    }
    print_fits(&fits, None, json);
    snap(args, &fits)
}

/// Simulated gateway holding the `[simulation.setpoints]` readbacks.
fn setpoint_gateway(cfg: &Config) -> SimulatedGateway {
    let gw = SimulatedGateway::new();
    for (pv, v) in &cfg.simulation.setpoints {
        gw.set(pv, PvValue::Double(*v));
    }
    gw
}

pub fn export(cfg: &Config, args: &FitArgs, json: bool) -> eyre::Result<()> {
    let (ds, fits) = load(cfg, args)?;
    if fits.is_empty() {
        eyre::bail!("hcd file {} has no measurements", args.file.display());
    }
    let timeout = Duration::from_millis(cfg.gateway.timeout_ms);
    let gw = setpoint_gateway(cfg);
    let detectors: Vec<_> = fits.iter().map(|f| f.dataset().detector.clone()).collect();

    let existing = read_existing_setpoints(&gw, &detectors, timeout);
    print_fits(&fits, Some(existing.as_slice()), json);

    let sps: Vec<_> = fits.iter().map(DetectorFit::trip_setpoint).collect();
    let written = write_setpoints(&gw, &sps, timeout, cfg.gateway.write_allowed)?;
    if json {
        println!(
            "{}",
            json!({ "hall": ds.hall.as_str(), "written": written, "simulated": true })
        );
    } else if cfg.gateway.write_allowed {
        println!(
            "Simulated gateway: {written} setpoints for hall {} were written to the simulation only and not kept.",
            ds.hall
        );
    } else {
        println!("Read-only mode: setpoints were not written (set gateway.write_allowed = true).");
    }
    snap(args, &fits)
}

/// Resolve every hall/laser combination the config supports and report the gaps.
pub fn self_check(cfg: &Config, json: bool) -> eyre::Result<()> {
    let mut usable = 0usize;
    for hall in Hall::ALL {
        let detectors = cfg.detectors(hall);
        for laser in Laser::ALL {
            match cfg.pv_set(hall, laser) {
                Ok(pvs) => {
                    usable += usize::from(!detectors.is_empty());
                    if json {
                        println!(
                            "{}",
                            json!({
                                "hall": hall.as_str(),
                                "laser": laser.as_str(),
                                "attenuator": pvs.attenuator,
                                "mode": pvs.mode,
                                "current": pvs.current,
                                "master_fsd": pvs.master_fsd,
                                "detectors": detectors.len(),
                            })
                        );
                    } else {
                        println!(
                            "hall {hall} laser {laser}: attenuator={} mode={} current={} fsd={} detectors={}",
                            pvs.attenuator,
                            pvs.mode,
                            pvs.current,
                            pvs.master_fsd,
                            detectors.len()
                        );
                    }
                }
                Err(e) => tracing::debug!(%hall, %laser, error = %e, "combination not configured"),
            }
        }
    }
    if usable == 0 {
        eyre::bail!("invalid config: no hall/laser combination has PVs and detectors");
    }
    if !json {
        println!(
            "Config OK ({usable} usable combinations, writes {}).",
            if cfg.gateway.write_allowed {
                "enabled"
            } else {
                "disabled"
            }
        );
    }
    Ok(())
}
