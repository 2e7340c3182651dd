//! Dataset file round trip feeding the fit engine and setpoint export.

use chrono::NaiveDate;
use icalibrate_config::{HallCfg, load_toml};
use icalibrate_core::export::{save_snap, write_setpoints};
use icalibrate_core::files::{load_dataset, save_dataset};
use icalibrate_core::{
    CalibrationDataset, ConfigExt, DetectorDataset, DetectorFit, FitKind, Hall, Measurement,
    SetpointParams,
};
use icalibrate_gateway::SimulatedGateway;
use icalibrate_traits::PvValue;

const CFG: &str = r#"
[pvs]
master_fsd_pv = "FSD:MASTER"

[hall.C]
negative_margin_targets = ["Lead"]
[[hall.C.detectors]]
epics_name = "IC3H01"
friendly_name = "Upstream"
"#;

fn dataset(hall_cfg: &HallCfg) -> CalibrationDataset {
    let cfg = load_toml(CFG).unwrap();
    let det = cfg.detectors(Hall::C).remove(0);
    assert_eq!(det.dose_read_pv, format!("IC3H01{}", hall_cfg.dose_read_suffix));
    CalibrationDataset {
        hall: Hall::C,
        target: "Lead".into(),
        pass: "1".into(),
        note: "spring".into(),
        calibrated_at: NaiveDate::from_ymd_opt(2024, 4, 2)
            .unwrap()
            .and_hms_opt(8, 15, 0)
            .unwrap(),
        calibrated_by: "ops".into(),
        datasets: vec![DetectorDataset::new(
            det,
            (0..5)
                .map(|i| {
                    let c = f64::from(i) * 10.0;
                    Measurement::new(c, 3.0 * c + 7.0)
                })
                .collect(),
        )],
    }
}

#[test]
fn saved_run_fits_and_exports() {
    let cfg = load_toml(CFG).unwrap();
    let hall_cfg = cfg.hall("C").unwrap();
    let dir = tempfile::tempdir().unwrap();

    let path = save_dataset(dir.path(), &dataset(hall_cfg)).unwrap();
    let loaded = load_dataset(&path, hall_cfg).unwrap();
    assert_eq!(loaded.datasets[0].detector.display_name(), "Upstream");

    let settings = cfg.hall_settings(Hall::C);
    let sign = settings.default_margin_sign(&loaded.target);
    assert_eq!(sign, -1.0);

    let mut fit = DetectorFit::new(loaded.datasets[0].clone());
    fit.select(FitKind::Linear);
    fit.set_setpoint_params(SetpointParams {
        current: 20.0,
        margin_percent: settings.clamp_margin(sign * 10.0),
    });
    assert_eq!(fit.equation_label(), "y = 3.00x + 7.00");
    assert_eq!(fit.r_squared_label(), "100.0%");
    // (3 * 20 + 7) * 0.9
    assert!((fit.setpoint() - 60.3).abs() < 1e-9);

    let gw = SimulatedGateway::new();
    let sps = [fit.trip_setpoint()];
    let n = write_setpoints(&gw, &sps, std::time::Duration::from_millis(50), true).unwrap();
    assert_eq!(n, 1);
    let written = gw.puts_to("IC3H01:SETPOINT_SET");
    assert_eq!(written.len(), 1);
    assert!((written[0].as_f64().unwrap() - 60.3).abs() < 1e-9);

    let snap = dir.path().join("ic.snap");
    save_snap(&snap, &sps, loaded.calibrated_at, "ops").unwrap();
    let text = std::fs::read_to_string(&snap).unwrap();
    assert!(text.starts_with("--- Start BURT header\n"));
    assert!(text.ends_with("IC3H01:SETPOINT_SET 1 60\n"));
    assert!(!matches!(written[0], PvValue::Text(_)));
}
