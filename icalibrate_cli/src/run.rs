//! The `run` command: a calibration sweep against the simulated gateway.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel as xch;
use eyre::WrapErr;
use icalibrate_config::Config;
use icalibrate_core::files::save_dataset;
use icalibrate_core::{
    CalibrateError, CalibrationDataset, ConfigExt, Hall, HallPvSet, Laser, Report, RunEvent,
    RunHandle, RunOutcome, RunParameters, RunState, start,
};
use icalibrate_gateway::{BeamModel, SimulatedGateway};
use serde_json::json;

use crate::cli::RunArgs;

pub fn operator(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

fn params(cfg: &Config, args: &RunArgs, hall: Hall, laser: Laser) -> eyre::Result<RunParameters> {
    let detectors = cfg.detectors(hall);
    if detectors.is_empty() {
        eyre::bail!("hall {hall} has no detectors configured under [hall.{hall}]");
    }
    let d = &cfg.run;
    RunParameters::builder()
        .hall(hall)
        .laser(laser)
        .target(args.target.as_str())
        .pass(args.pass.as_str())
        .note(args.note.as_str())
        .attenuator_range(
            args.min.unwrap_or(d.min_attenuator),
            args.max.unwrap_or(d.max_attenuator),
        )
        .steps(args.steps.unwrap_or(d.steps))
        .settle_seconds(args.settle.unwrap_or(d.settle_seconds))
        .samples_per_step(args.samples.unwrap_or(d.samples_per_step))
        .detectors(detectors)
        .build()
}

fn simulated_gateway(cfg: &Config, pvs: &HallPvSet, params: &RunParameters) -> SimulatedGateway {
    let sim = &cfg.simulation;
    let model = BeamModel {
        attenuator_pv: pvs.attenuator.clone(),
        current_pv: pvs.current.clone(),
        dose_pvs: params.detectors.iter().map(|d| d.dose_read_pv.clone()).collect(),
        current_per_attenuator: sim.current_per_attenuator,
        dose_per_current: sim.dose_per_current,
        noise: sim.noise,
    };
    let gw = SimulatedGateway::with_beam(model, sim.initial_attenuator);
    gw.set(&pvs.master_fsd, 0i64);
    gw.set(&pvs.mode, 0i64);
    gw
}

/// Lines typed on stdin. Disconnects at EOF.
fn enter_presses() -> xch::Receiver<()> {
    let (tx, rx) = xch::unbounded();
    let spawned = std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                if line.is_err() || tx.send(()).is_err() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "stdin reader unavailable; interlock resume needs a new run");
    }
    rx
}

fn render(ev: &RunEvent, json: bool, steps: i64) {
    if json {
        let line = match ev {
            RunEvent::Status {
                state,
                step,
                sample,
            } => json!({ "event": "status", "state": state.label(), "step": step, "sample": sample }),
            RunEvent::Progress { percent } => json!({ "event": "progress", "percent": percent }),
        };
        println!("{line}");
        return;
    }
    match ev {
        RunEvent::Status {
            state: RunState::Adjusting,
            step,
            ..
        } => println!("step {step}/{steps}: adjusting attenuator"),
        RunEvent::Status {
            state: RunState::WaitingOnInterlock,
            step,
            ..
        } => println!(
            "Interlock tripped during step {step}. Clear the interlock, then press Enter to resume (Ctrl-C to stop)."
        ),
        RunEvent::Progress { percent } => println!("progress {percent}%"),
        RunEvent::Status { .. } => {}
    }
}

/// Pump events until the run thread finishes, resuming on Enter while paused.
fn follow(handle: &RunHandle, gw: &SimulatedGateway, fsd: &str, json: bool, steps: i64) {
    let enter = enter_presses();
    let closed = xch::never();
    let mut stdin_open = true;
    let mut waiting = false;
    loop {
        let keys = if stdin_open { &enter } else { &closed };
        xch::select! {
            recv(handle.events()) -> ev => match ev {
                Ok(ev) => {
                    if let RunEvent::Status { state, .. } = &ev {
                        waiting = *state == RunState::WaitingOnInterlock;
                    }
                    render(&ev, json, steps);
                }
                Err(_) => break,
            },
            recv(keys) -> key => match key {
                Ok(()) if waiting => {
                    // The operator has cleared the interlock.
                    gw.set(fsd, 0i64);
                    gw.flush();
                    handle.resume();
                    waiting = false;
                }
                Ok(()) => {}
                Err(_) => stdin_open = false,
            },
        }
    }
}

fn save(out: &Path, ds: &CalibrationDataset) -> eyre::Result<std::path::PathBuf> {
    std::fs::create_dir_all(out)
        .wrap_err_with(|| format!("create output directory {}", out.display()))?;
    save_dataset(out, ds)
}

fn report(json: bool, outcome: &str, path: &Path, ds: &CalibrationDataset) {
    if json {
        println!(
            "{}",
            json!({
                "outcome": outcome,
                "file": path.display().to_string(),
                "detectors": ds.datasets.len(),
                "measurements": ds.measurement_count(),
            })
        );
    } else if outcome == "complete" {
        println!("Calibration complete: {}", path.display());
    } else {
        println!(
            "Calibration stopped early; partial data saved: {}",
            path.display()
        );
    }
}

pub fn run_calibration(cfg: &Config, args: &RunArgs, json: bool) -> eyre::Result<()> {
    let hall: Hall = args.hall.parse()?;
    let laser: Laser = args.laser.parse()?;
    let params = params(cfg, args, hall, laser)?;
    let operator = operator(args.operator.as_deref());
    let mut seq = cfg.sequencer_cfg(hall, laser, &operator)?;
    seq.settle_unit = Duration::from_millis(args.settle_unit_ms);

    let gw = simulated_gateway(cfg, &seq.pvs, &params);
    for pv in &args.sim_unreachable {
        gw.make_unreachable(pv);
    }
    let fsd = seq.pvs.master_fsd.clone();
    for (pv, n) in &args.sim_trip_on_read {
        let (pv, n, fsd) = (pv.clone(), *n, fsd.clone());
        gw.on_read(Arc::new(move |g: &SimulatedGateway, read: &str, count: u64| {
            if read == pv && count == n {
                g.set(&fsd, 1i64);
                g.flush();
            }
        }));
    }
    let steps = params.steps;
    tracing::info!(
        %hall,
        %laser,
        duration_s = params.compute_duration_seconds(),
        "starting calibration"
    );

    let mut handle = start(params, gw.clone(), seq)?;
    let control = handle.control_handle();
    ctrlc::set_handler(move || control.cancel()).wrap_err("install Ctrl-C handler")?;

    follow(&handle, &gw, &fsd, json, steps);

    match handle.await_result() {
        Ok(RunOutcome::Complete(ds)) => {
            let path = save(&args.out, &ds)?;
            report(json, "complete", &path, &ds);
            Ok(())
        }
        Ok(RunOutcome::Partial(ds)) => {
            let path = save(&args.out, &ds)?;
            report(json, "partial", &path, &ds);
            Ok(())
        }
        Ok(RunOutcome::NoData) => Err(Report::new(CalibrateError::Cancelled)),
        Err(e) => {
            if let CalibrateError::Cleanup {
                salvaged: Some(ds), ..
            } = &e
            {
                let path = save(&args.out, ds)?;
                report(json, "salvaged", &path, ds);
            }
            Err(Report::new(e))
        }
    }
}
