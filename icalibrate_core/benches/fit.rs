use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use icalibrate_core::fit::{fit_linear, fit_log_linear};
use icalibrate_core::{Detector, DetectorDataset, DetectorFit, Measurement, SetpointParams};

// Synthetic sweep: dose = 12 * current + 30 with small deterministic ripple
fn synth_sweep(n: usize, ripple: f64, seed: u32) -> Vec<Measurement> {
    let mut state = seed.max(1);
    let mut next = || {
        let mut x = state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        state = x;
        f64::from(x) / (f64::from(u32::MAX) + 1.0)
    };
    (0..n)
        .map(|i| {
            let current = i as f64 * 0.25;
            let noise = (next() * 2.0 - 1.0) * ripple;
            Measurement::new(current, 12.0 * current + 30.0 + noise)
        })
        .collect()
}

pub fn bench_fits(c: &mut Criterion) {
    let mut g = c.benchmark_group("fit");
    // Quick tweaking without CLI flags:
    //   BENCH_SAMPLE_SIZE=10 BENCH_MEAS_MS=50 cargo bench -p icalibrate_core --bench fit
    if let Ok(ss) = std::env::var("BENCH_SAMPLE_SIZE") {
        if let Ok(n) = ss.parse::<usize>() {
            g.sample_size(n.max(1));
        }
    } else {
        g.sample_size(50);
    }
    if let Ok(ms) = std::env::var("BENCH_MEAS_MS")
        && let Ok(ms_u64) = ms.parse::<u64>()
    {
        g.measurement_time(std::time::Duration::from_millis(ms_u64));
    }

    for &n in &[11usize, 101, 1001] {
        let sweep = synth_sweep(n, 0.5, 0xC0FFEE);
        g.bench_function(format!("linear_{n}"), |b| {
            b.iter(|| black_box(fit_linear(black_box(&sweep), 0, n - 1)));
        });
        g.bench_function(format!("log_linear_{n}"), |b| {
            b.iter(|| black_box(fit_log_linear(black_box(&sweep), 0, n - 1)));
        });
    }

    // Full refit + setpoint as done on every range edit
    let sweep = synth_sweep(101, 0.5, 0xBEEF);
    let detector = Detector::with_suffixes("IC1", None, None, ":DOSE", ":SP", ":SP_SET");
    g.bench_function("detector_fit_refit_range", |b| {
        b.iter_batched(
            || DetectorFit::new(DetectorDataset::new(detector.clone(), sweep.clone())),
            |mut f| {
                f.set_setpoint_params(SetpointParams {
                    current: 20.0,
                    margin_percent: 10.0,
                });
                f.update_fit_range(black_box(10), black_box(90));
                black_box(f.setpoint());
            },
            BatchSize::SmallInput,
        );
    });
    g.finish();
}

criterion_group!(fit, bench_fits);
criterion_main!(fit);
