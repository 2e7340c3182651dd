//! End-to-end runs of the sequencer against the simulated gateway.
//!
//! The beam model gives current = 0.5 * attenuator and dose = 10 * current,
//! so every expected measurement is exact. The attenuator starts at 7.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use icalibrate_core::{
    CalibrateError, Detector, GatewayErrorKind, GatewayOp, Hall, HallPvSet, Laser, Measurement,
    RunControlHandle, RunEvent, RunHandle, RunOutcome, RunParameters, RunState, SequencerCfg,
};
use icalibrate_gateway::error::{GatewayError, Op};
use icalibrate_gateway::{BeamModel, SimulatedGateway};
use icalibrate_traits::{
    BoxError, FixedClock, Gateway, Listener, MonitorEvent, PvValue, SubscriptionId,
};

const ATT: &str = "psub_ab_pos";
const MODE: &str = "psub_ab_mode";
const CUR: &str = "IBC1H04CRCUR2";
const FSD: &str = "FSD:MASTER";
const IC1: &str = "IC1L01:DOSE";
const IC2: &str = "IC1R02:DOSE";

fn detectors() -> Vec<Detector> {
    ["IC1L01", "IC1R02"]
        .iter()
        .map(|n| Detector::with_suffixes(n, None, None, ":DOSE", ":SETPOINT", ":SETPOINT_SET"))
        .collect()
}

fn gateway() -> SimulatedGateway {
    let model = BeamModel {
        attenuator_pv: ATT.into(),
        current_pv: CUR.into(),
        dose_pvs: vec![IC1.into(), IC2.into()],
        current_per_attenuator: 0.5,
        dose_per_current: 10.0,
        noise: 0.0,
    };
    let gw = SimulatedGateway::with_beam(model, 7.0);
    gw.set(FSD, 0i64);
    gw.set(MODE, 2i64);
    gw
}

fn params(min: i64, max: i64, steps: i64) -> RunParameters {
    RunParameters::builder()
        .hall(Hall::A)
        .laser(Laser::B)
        .target("LH2")
        .pass("1")
        .attenuator_range(min, max)
        .steps(steps)
        .settle_seconds(1)
        .samples_per_step(3)
        .detectors(detectors())
        .build()
        .unwrap()
}

fn stamp() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .unwrap()
        .and_hms_opt(9, 30, 0)
        .unwrap()
}

fn cfg(write_allowed: bool) -> SequencerCfg {
    let mut c = SequencerCfg::new(HallPvSet {
        attenuator: ATT.into(),
        mode: MODE.into(),
        current: CUR.into(),
        master_fsd: FSD.into(),
    });
    c.timeout = Duration::from_millis(200);
    c.connect_timeout = Duration::from_millis(2000);
    c.write_allowed = write_allowed;
    c.settle_unit = Duration::from_millis(2);
    c.dwell = Duration::from_millis(1);
    c.operator = "tester".into();
    c.clock = Arc::new(FixedClock::new(stamp()));
    c
}

fn start(gw: &SimulatedGateway, p: RunParameters, c: SequencerCfg) -> RunHandle {
    icalibrate_core::start(p, gw.clone(), c).unwrap()
}

fn wait_for(handle: &RunHandle, want: impl Fn(&RunEvent) -> bool) -> RunEvent {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match handle.events().recv_timeout(left) {
            Ok(ev) if want(&ev) => return ev,
            Ok(_) => {}
            Err(e) => panic!("event never arrived: {e}"),
        }
    }
}

fn waiting_on_interlock(step: u64) -> impl Fn(&RunEvent) -> bool {
    move |ev| {
        matches!(ev, RunEvent::Status { state: RunState::WaitingOnInterlock, step: s, .. } if *s == step)
    }
}

/// Trip the interlock while `pv` is read for the `n`th time.
fn trip_on_read(gw: &SimulatedGateway, pv: &'static str, n: u64) {
    gw.on_read(Arc::new(move |g: &SimulatedGateway, read: &str, count: u64| {
        if read == pv && count == n {
            g.set(FSD, 1i64);
            g.flush();
        }
    }));
}

/// Cancel through `slot` while `pv` is read for the `n`th time.
fn cancel_on_read(gw: &SimulatedGateway, pv: &'static str, n: u64) -> Arc<OnceLock<RunControlHandle>> {
    let slot: Arc<OnceLock<RunControlHandle>> = Arc::new(OnceLock::new());
    let s = Arc::clone(&slot);
    gw.on_read(Arc::new(move |_: &SimulatedGateway, read: &str, count: u64| {
        if read == pv && count == n {
            loop {
                if let Some(h) = s.get() {
                    h.cancel();
                    break;
                }
                std::thread::yield_now();
            }
        }
    }));
    slot
}

fn sweep(points: &[f64]) -> Vec<Measurement> {
    points
        .iter()
        .map(|a| Measurement::new(a * 0.5, a * 5.0))
        .collect()
}

fn doubles(values: &[f64]) -> Vec<PvValue> {
    values.iter().map(|v| PvValue::Double(*v)).collect()
}

#[test]
fn complete_run_sweeps_min_to_max_and_restores() {
    let gw = gateway();
    let mut h = start(&gw, params(0, 40, 4), cfg(true));
    let outcome = h.await_result().unwrap();

    let RunOutcome::Complete(ds) = outcome else {
        panic!("expected a complete run, got {outcome:?}");
    };
    assert_eq!(ds.datasets.len(), 2);
    for d in &ds.datasets {
        assert_eq!(d.measurements(), sweep(&[0.0, 10.0, 20.0, 30.0, 40.0]).as_slice());
    }
    assert_eq!(ds.hall, Hall::A);
    assert_eq!(ds.target, "LH2");
    assert_eq!(ds.calibrated_at, stamp());
    assert_eq!(ds.calibrated_by, "tester");

    assert_eq!(gw.puts_to(ATT), doubles(&[0.0, 10.0, 20.0, 30.0, 40.0, 7.0]));
    assert_eq!(gw.puts_to(MODE), vec![PvValue::Int(0)]);
    assert!(gw.subscription_counts().is_empty());
    assert_eq!(gw.read_count(IC1), 15);
}

#[test]
fn uneven_range_clamps_last_step_to_max() {
    let gw = gateway();
    let mut h = start(&gw, params(0, 10, 3), cfg(true));
    let ds = h.await_result().unwrap().into_dataset().unwrap();
    // step size round(10 / 3) = 3
    assert_eq!(
        ds.datasets[0].measurements(),
        sweep(&[0.0, 3.0, 6.0, 9.0, 10.0]).as_slice()
    );
}

#[test]
fn events_follow_step_protocol_and_progress_reaches_100() {
    let gw = gateway();
    let mut h = start(&gw, params(0, 40, 4), cfg(true));
    h.await_result().unwrap();
    let events: Vec<RunEvent> = h.events().try_iter().collect();

    assert!(matches!(
        events.first(),
        Some(RunEvent::Status { state: RunState::Idle, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(RunEvent::Status { state: RunState::Done, step: 4, .. })
    ));

    let step0: Vec<(RunState, Option<u64>)> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Status { state, step: 0, sample } if *state != RunState::Idle => {
                Some((*state, *sample))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        step0,
        vec![
            (RunState::Adjusting, None),
            (RunState::Settling, None),
            (RunState::Reading, None),
            (RunState::Sampling, Some(1)),
            (RunState::Dwelling, Some(1)),
            (RunState::Sampling, Some(2)),
            (RunState::Dwelling, Some(2)),
            (RunState::Sampling, Some(3)),
        ]
    );

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            RunEvent::Progress { percent } => Some(*percent),
            RunEvent::Status { .. } => None,
        })
        .collect();
    assert_eq!(progress, vec![0, 25, 50, 75, 100]);
}

#[test]
fn measurement_is_mean_of_samples() {
    let gw = gateway();
    for v in [30.0, 60.0, 90.0] {
        gw.script_get(IC1, Ok(PvValue::Double(v)));
    }
    let mut h = start(&gw, params(10, 50, 4), cfg(true));
    let ds = h.await_result().unwrap().into_dataset().unwrap();
    assert_eq!(ds.datasets[0].measurements()[0], Measurement::new(5.0, 60.0));
    assert_eq!(ds.datasets[1].measurements()[0], Measurement::new(5.0, 50.0));
}

#[test]
fn non_numeric_readings_count_as_zero() {
    let gw = gateway();
    gw.script_get(CUR, Ok(PvValue::Text("n/a".into())));
    gw.script_get(IC2, Ok(PvValue::Text("UDF".into())));
    let mut h = start(&gw, params(10, 50, 4), cfg(true));
    let ds = h.await_result().unwrap().into_dataset().unwrap();
    assert_eq!(ds.datasets[0].measurements()[0], Measurement::new(0.0, 50.0));
    // one of three samples read as zero
    let dose = ds.datasets[1].measurements()[0].dose_rate;
    assert!((dose - 100.0 / 3.0).abs() < 1e-9);
}

#[test]
fn interlock_trip_pauses_then_retries_step() {
    let gw = gateway();
    // first sample of step 2
    trip_on_read(&gw, IC1, 7);
    let mut h = start(&gw, params(0, 40, 4), cfg(true));

    wait_for(&h, waiting_on_interlock(2));
    gw.set(FSD, 0i64);
    gw.flush();
    h.resume();

    let ds = h.await_result().unwrap().into_dataset().unwrap();
    assert_eq!(
        ds.datasets[0].measurements(),
        sweep(&[0.0, 10.0, 20.0, 30.0, 40.0]).as_slice()
    );
    assert_eq!(
        gw.puts_to(ATT),
        doubles(&[0.0, 10.0, 20.0, 20.0, 30.0, 40.0, 7.0])
    );
}

#[test]
fn tripped_interlock_blocks_first_step_until_resume() {
    let gw = gateway();
    gw.set(FSD, 1i64);
    let mut h = start(&gw, params(0, 40, 4), cfg(true));

    wait_for(&h, waiting_on_interlock(0));
    gw.set(FSD, 0i64);
    gw.flush();
    h.resume();

    let outcome = h.await_result().unwrap();
    assert!(!outcome.is_partial());
    assert_eq!(outcome.dataset().unwrap().measurement_count(), 10);
}

#[test]
fn cancel_while_waiting_on_interlock_salvages_finished_steps() {
    let gw = gateway();
    trip_on_read(&gw, IC1, 7);
    let mut h = start(&gw, params(0, 40, 4), cfg(true));

    wait_for(&h, waiting_on_interlock(2));
    h.cancel();

    let outcome = h.await_result().unwrap();
    let RunOutcome::Partial(ds) = outcome else {
        panic!("expected partial data, got {outcome:?}");
    };
    for d in &ds.datasets {
        assert_eq!(d.measurements(), sweep(&[0.0, 10.0]).as_slice());
    }
    assert_eq!(gw.puts_to(ATT).last(), Some(&PvValue::Double(7.0)));
    assert_eq!(gw.puts_to(MODE), vec![PvValue::Int(0)]);
}

#[test]
fn cancel_mid_step_discards_that_step() {
    let gw = gateway();
    // current read of step 3
    let slot = cancel_on_read(&gw, CUR, 4);
    let mut h = start(&gw, params(0, 40, 4), cfg(true));
    let _ = slot.set(h.control_handle());

    let outcome = h.await_result().unwrap();
    assert!(outcome.is_partial());
    let ds = outcome.into_dataset().unwrap();
    assert_eq!(
        ds.datasets[1].measurements(),
        sweep(&[0.0, 10.0, 20.0]).as_slice()
    );
    assert_eq!(
        gw.puts_to(ATT),
        doubles(&[0.0, 10.0, 20.0, 30.0, 7.0])
    );
}

#[test]
fn cancel_before_first_measurement_is_no_data() {
    let gw = gateway();
    let slot = cancel_on_read(&gw, CUR, 1);
    let mut h = start(&gw, params(0, 40, 4), cfg(true));
    let _ = slot.set(h.control_handle());

    let outcome = h.await_result().unwrap();
    assert_eq!(outcome, RunOutcome::NoData);
    assert_eq!(outcome.into_dataset(), Err(CalibrateError::Cancelled));
    // cleanup still ran
    assert_eq!(gw.puts_to(ATT), doubles(&[0.0, 7.0]));
}

#[test]
fn gateway_failure_is_fatal_and_names_pv() {
    let gw = gateway();
    gw.fail_get(
        IC2,
        GatewayError::Timeout {
            pv: IC2.into(),
            op: Op::Get,
            timeout: Duration::from_millis(200),
        },
    );
    let mut h = start(&gw, params(0, 40, 4), cfg(true));

    match h.await_result() {
        Err(CalibrateError::Gateway { pv, op, kind, .. }) => {
            assert_eq!(pv, IC2);
            assert_eq!(op, GatewayOp::Get);
            assert_eq!(kind, GatewayErrorKind::Timeout);
        }
        other => panic!("expected a gateway error, got {other:?}"),
    }
    assert_eq!(gw.puts_to(ATT), doubles(&[0.0, 7.0]));
    assert_eq!(gw.puts_to(MODE), vec![PvValue::Int(0)]);
    assert!(gw.subscription_counts().is_empty());
}

#[test]
fn cleanup_failure_keeps_salvaged_dataset() {
    let gw = gateway();
    gw.fail_put(
        MODE,
        GatewayError::Connection {
            pv: MODE.into(),
            op: Op::Put,
            reason: "write access denied".into(),
        },
    );
    let mut h = start(&gw, params(0, 40, 4), cfg(true));

    match h.await_result() {
        Err(CalibrateError::Cleanup { source, salvaged }) => {
            assert_eq!(source.pv(), Some(MODE));
            assert_eq!(salvaged.unwrap().measurement_count(), 10);
        }
        other => panic!("expected a cleanup error, got {other:?}"),
    }
    // the attenuator was still restored
    assert_eq!(gw.puts_to(ATT).last(), Some(&PvValue::Double(7.0)));
}

#[test]
fn read_only_mode_never_writes() {
    let gw = gateway();
    let mut h = start(&gw, params(0, 40, 4), cfg(false));
    let ds = h.await_result().unwrap().into_dataset().unwrap();
    assert!(gw.puts().is_empty());
    for m in ds.datasets[0].measurements() {
        assert_eq!(*m, Measurement::new(3.5, 35.0));
    }
}

#[test]
fn unreachable_interlock_times_out_before_any_write() {
    let gw = gateway();
    gw.make_unreachable(FSD);
    let mut c = cfg(true);
    c.connect_timeout = Duration::from_millis(30);
    let mut h = start(&gw, params(0, 40, 4), c);

    match h.await_result() {
        Err(CalibrateError::Gateway { pv, op, kind, .. }) => {
            assert_eq!(pv, FSD);
            assert_eq!(op, GatewayOp::Subscribe);
            assert_eq!(kind, GatewayErrorKind::Timeout);
        }
        other => panic!("expected a connect timeout, got {other:?}"),
    }
    assert!(gw.puts().is_empty());
    assert!(gw.subscription_counts().is_empty());
}

#[test]
fn non_numeric_attenuator_aborts_without_cleanup() {
    let gw = gateway();
    gw.set(ATT, PvValue::Text("moving".into()));
    let mut h = start(&gw, params(0, 40, 4), cfg(true));
    match h.await_result() {
        Err(CalibrateError::Gateway { pv, kind, .. }) => {
            assert_eq!(pv, ATT);
            assert_eq!(kind, GatewayErrorKind::Protocol);
        }
        other => panic!("expected a protocol error, got {other:?}"),
    }
    assert!(gw.puts().is_empty());
}

/// Delivers each subscription's first value `delay` after its connection,
/// the way a slow IOC answers a fresh monitor.
struct LateFirstValue {
    inner: SimulatedGateway,
    delay: Duration,
}

impl Gateway for LateFirstValue {
    fn get(&self, pv: &str, timeout: Duration) -> Result<PvValue, BoxError> {
        self.inner.get(pv, timeout)
    }

    fn put(&self, pv: &str, value: PvValue, timeout: Duration) -> Result<(), BoxError> {
        self.inner.put(pv, value, timeout)
    }

    fn subscribe(&self, pv: &str, listener: Listener) -> Result<SubscriptionId, BoxError> {
        let held = Arc::new(AtomicBool::new(true));
        let delay = self.delay;
        let deferred: Listener = Arc::new(move |ev: &MonitorEvent| {
            if matches!(ev, MonitorEvent::Update { .. }) && held.swap(false, Ordering::SeqCst) {
                let l = Arc::clone(&listener);
                let ev = ev.clone();
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    l(&ev);
                });
                return;
            }
            listener(ev);
        });
        self.inner.subscribe(pv, deferred)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.unsubscribe(id);
    }
}

#[test]
fn tripped_interlock_seen_before_first_write_even_when_value_lags_connection() {
    let gw = gateway();
    gw.set(FSD, 1i64);
    let slow = LateFirstValue {
        inner: gw.clone(),
        delay: Duration::from_millis(100),
    };
    let mut h = icalibrate_core::start(params(0, 40, 4), slow, cfg(true)).unwrap();

    wait_for(&h, waiting_on_interlock(0));
    assert!(
        gw.puts_to(ATT).is_empty(),
        "attenuator moved while the interlock was tripped: {:?}",
        gw.puts_to(ATT)
    );

    gw.set(FSD, 0i64);
    gw.flush();
    h.resume();
    let outcome = h.await_result().unwrap();
    assert_eq!(outcome.dataset().unwrap().measurement_count(), 10);
    assert_eq!(gw.puts_to(ATT).first(), Some(&PvValue::Double(0.0)));
}

#[test]
fn cleanup_failure_does_not_mask_fatal_gateway_error() {
    let gw = gateway();
    gw.fail_get(
        IC2,
        GatewayError::Timeout {
            pv: IC2.into(),
            op: Op::Get,
            timeout: Duration::from_millis(200),
        },
    );
    gw.fail_put(
        MODE,
        GatewayError::Connection {
            pv: MODE.into(),
            op: Op::Put,
            reason: "write access denied".into(),
        },
    );
    let mut h = start(&gw, params(0, 40, 4), cfg(true));

    match h.await_result() {
        Err(CalibrateError::Gateway { pv, kind, .. }) => {
            assert_eq!(pv, IC2);
            assert_eq!(kind, GatewayErrorKind::Timeout);
        }
        other => panic!("expected the sampling error, got {other:?}"),
    }
    // attenuator restore was still attempted
    assert_eq!(gw.puts_to(ATT), doubles(&[0.0, 7.0]));
}
