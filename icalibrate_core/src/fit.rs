//! Curve fit engine: least-squares fits of dose rate against beam current.
//!
//! Two models are fitted over an inclusive index subrange of a measurement
//! sequence:
//! - linear: `dose = slope * current + intercept`
//! - log-linear: `dose = slope * ln(current) + intercept`, using only points
//!   with `current > 0`
//!
//! Degenerate inputs (fewer than two usable points, zero variance) yield NaN
//! parameters rather than errors; labels render those as `None`.
use crate::model::{DetectorDataset, Measurement, TripSetpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FitKind {
    #[default]
    Linear,
    LogLinear,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fit {
    pub kind: FitKind,
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl Fit {
    fn undefined(kind: FitKind) -> Self {
        Self {
            kind,
            slope: f64::NAN,
            intercept: f64::NAN,
            r_squared: f64::NAN,
        }
    }

    pub fn is_defined(&self) -> bool {
        !(self.slope.is_nan() || self.intercept.is_nan())
    }
}

/// Ordinary least squares over `(x, y)` pairs.
fn ols(kind: FitKind, points: impl Iterator<Item = (f64, f64)>) -> Fit {
    let pts: Vec<(f64, f64)> = points.collect();
    if pts.len() < 2 {
        return Fit::undefined(kind);
    }
    let n = pts.len() as f64;
    let mean_x = pts.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = pts.iter().map(|p| p.1).sum::<f64>() / n;
    let (mut sxx, mut sxy, mut syy) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in &pts {
        let dx = x - mean_x;
        let dy = y - mean_y;
        sxx += dx * dx;
        sxy += dx * dy;
        syy += dy * dy;
    }
    // sxx == 0 gives NaN slope; that propagates to an undefined equation.
    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;
    let r_squared = if sxx == 0.0 || syy == 0.0 {
        f64::NAN
    } else {
        (sxy * sxy) / (sxx * syy)
    };
    Fit {
        kind,
        slope,
        intercept,
        r_squared,
    }
}

fn subrange(m: &[Measurement], min_index: usize, max_index: usize) -> &[Measurement] {
    if m.is_empty() || min_index > max_index || min_index >= m.len() {
        return &[];
    }
    &m[min_index..=max_index.min(m.len() - 1)]
}

/// Linear fit over `measurements[min_index..=max_index]`.
pub fn fit_linear(measurements: &[Measurement], min_index: usize, max_index: usize) -> Fit {
    ols(
        FitKind::Linear,
        subrange(measurements, min_index, max_index)
            .iter()
            .map(|m| (m.current, m.dose_rate)),
    )
}

/// Log-linear fit over the subrange, skipping points with `current <= 0`.
pub fn fit_log_linear(measurements: &[Measurement], min_index: usize, max_index: usize) -> Fit {
    ols(
        FitKind::LogLinear,
        subrange(measurements, min_index, max_index)
            .iter()
            .filter(|m| m.current > 0.0)
            .map(|m| (m.current.ln(), m.dose_rate)),
    )
}

/// Dose rate predicted at `current`. Log fits are undefined (NaN) for `current <= 0`.
pub fn evaluate(fit: &Fit, current: f64) -> f64 {
    match fit.kind {
        FitKind::Linear => fit.slope * current + fit.intercept,
        FitKind::LogLinear => {
            if current > 0.0 {
                fit.slope * current.ln() + fit.intercept
            } else {
                f64::NAN
            }
        }
    }
}

/// `evaluate(fit, current) * (100 + margin) / 100`, unclamped.
pub fn compute_setpoint(fit: &Fit, current: f64, margin_percent: f64) -> f64 {
    evaluate(fit, current) * (100.0 + margin_percent) / 100.0
}

/// Display/use policy for setpoints: NaN and negatives become zero.
pub fn clamp_setpoint(v: f64) -> f64 {
    if v.is_nan() || v < 0.0 { 0.0 } else { v }
}

/// `1234.5` -> `1,234.50`
fn grouped(v: f64) -> String {
    let s = format!("{:.2}", v.abs());
    let (int, frac) = s.split_once('.').unwrap_or((s.as_str(), "00"));
    let mut out = String::with_capacity(s.len() + int.len() / 3);
    for (i, c) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    let sign = if v < 0.0 && s.bytes().any(|b| b != b'0' && b != b'.') {
        "-"
    } else {
        ""
    };
    format!("{sign}{out}.{frac}")
}

/// `y = 3.00x + 7.00`, `y = 1.00 * ln(x) - 2.00`, or `None`.
pub fn equation_label(fit: &Fit) -> String {
    if !fit.is_defined() {
        return "None".to_string();
    }
    let sign = if fit.intercept < 0.0 { "-" } else { "+" };
    let b = grouped(fit.intercept.abs());
    let m = grouped(fit.slope);
    match fit.kind {
        FitKind::Linear => format!("y = {m}x {sign} {b}"),
        FitKind::LogLinear => format!("y = {m} * ln(x) {sign} {b}"),
    }
}

/// `99.5%` or `None`.
pub fn r_squared_label(fit: &Fit) -> String {
    if fit.r_squared.is_nan() {
        "None".to_string()
    } else {
        format!("{:.1}%", fit.r_squared * 100.0)
    }
}

/// Beam current and signed margin used to derive a setpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SetpointParams {
    pub current: f64,
    pub margin_percent: f64,
}

/// Fits, fit subrange, model selection and setpoint parameters for one detector.
#[derive(Debug, Clone)]
pub struct DetectorFit {
    dataset: DetectorDataset,
    min_index: usize,
    max_index: usize,
    linear: Fit,
    log_linear: Fit,
    selected: FitKind,
    params: SetpointParams,
}

impl DetectorFit {
    pub fn new(dataset: DetectorDataset) -> Self {
        let max_index = dataset.measurements().len().saturating_sub(1);
        let m = dataset.measurements();
        let linear = fit_linear(m, 0, max_index);
        let log_linear = fit_log_linear(m, 0, max_index);
        Self {
            dataset,
            min_index: 0,
            max_index,
            linear,
            log_linear,
            selected: FitKind::Linear,
            params: SetpointParams::default(),
        }
    }

    pub fn dataset(&self) -> &DetectorDataset {
        &self.dataset
    }

    /// Replace the measurement sequence and refit over all of it.
    pub fn set_measurements(&mut self, measurements: Vec<Measurement>) {
        let selected = self.selected;
        let params = self.params;
        *self = Self::new(self.dataset.with_measurements(measurements));
        self.selected = selected;
        self.params = params;
    }

    /// Refit both models over `[min, max]` (inclusive). A range with fewer than two
    /// points returns false and changes nothing: the fits and the bounds reported by
    /// [`fit_range`](Self::fit_range) both stay at the last range that could be fitted.
    pub fn update_fit_range(&mut self, min: usize, max: usize) -> bool {
        let m = self.dataset.measurements();
        if subrange(m, min, max).len() < 2 {
            tracing::debug!(min, max, "fit range too small; keeping previous fit");
            return false;
        }
        self.min_index = min;
        self.max_index = max.min(m.len() - 1);
        self.linear = fit_linear(m, self.min_index, self.max_index);
        self.log_linear = fit_log_linear(m, self.min_index, self.max_index);
        true
    }

    pub fn fit_range(&self) -> (usize, usize) {
        (self.min_index, self.max_index)
    }

    pub fn select(&mut self, kind: FitKind) {
        self.selected = kind;
    }

    pub fn selected_kind(&self) -> FitKind {
        self.selected
    }

    pub fn linear(&self) -> &Fit {
        &self.linear
    }

    pub fn log_linear(&self) -> &Fit {
        &self.log_linear
    }

    /// The currently selected fit.
    pub fn fit(&self) -> &Fit {
        match self.selected {
            FitKind::Linear => &self.linear,
            FitKind::LogLinear => &self.log_linear,
        }
    }

    pub fn set_setpoint_params(&mut self, params: SetpointParams) {
        self.params = params;
    }

    pub fn setpoint_params(&self) -> SetpointParams {
        self.params
    }

    /// Setpoint before the clamp policy.
    pub fn raw_setpoint(&self) -> f64 {
        compute_setpoint(self.fit(), self.params.current, self.params.margin_percent)
    }

    /// Setpoint with NaN/negative clamped to zero.
    pub fn setpoint(&self) -> f64 {
        clamp_setpoint(self.raw_setpoint())
    }

    pub fn trip_setpoint(&self) -> TripSetpoint {
        TripSetpoint {
            detector: self.dataset.detector.clone(),
            dose_rate: self.setpoint(),
        }
    }

    pub fn equation_label(&self) -> String {
        equation_label(self.fit())
    }

    pub fn r_squared_label(&self) -> String {
        r_squared_label(self.fit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Detector;
    use rstest::rstest;

    fn ms(points: &[(f64, f64)]) -> Vec<Measurement> {
        points.iter().map(|&(c, d)| Measurement::new(c, d)).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn recovers_exact_line() {
        let m: Vec<Measurement> = (0..6)
            .map(|i| {
                let c = f64::from(i) * 2.5;
                Measurement::new(c, 3.0 * c + 7.0)
            })
            .collect();
        let f = fit_linear(&m, 0, m.len() - 1);
        assert!(close(f.slope, 3.0));
        assert!(close(f.intercept, 7.0));
        assert!(close(f.r_squared, 1.0));
        assert_eq!(equation_label(&f), "y = 3.00x + 7.00");
        assert_eq!(r_squared_label(&f), "100.0%");
    }

    #[test]
    fn log_fit_ignores_non_positive_currents() {
        let good = [(1.0, 5.0), (2.0, 9.0), (4.0, 12.5), (8.0, 17.0)];
        let mut with_zero = vec![(0.0, 100.0)];
        with_zero.extend_from_slice(&good);
        let a = fit_log_linear(&ms(&good), 0, 3);
        let b = fit_log_linear(&ms(&with_zero), 0, 4);
        assert_eq!(a, b);
        assert!(a.is_defined());
    }

    #[rstest]
    #[case(0.0)]
    #[case(-1.0)]
    fn log_evaluate_is_undefined_off_domain(#[case] x: f64) {
        let f = fit_log_linear(&ms(&[(1.0, 1.0), (std::f64::consts::E, 2.0)]), 0, 1);
        assert!(evaluate(&f, x).is_nan());
        assert!(close(evaluate(&f, 1.0), 1.0));
    }

    #[test]
    fn degenerate_inputs_yield_nan_not_errors() {
        let same_x = ms(&[(5.0, 1.0), (5.0, 2.0), (5.0, 3.0)]);
        let f = fit_linear(&same_x, 0, 2);
        assert!(f.slope.is_nan());
        assert_eq!(equation_label(&f), "None");
        assert_eq!(r_squared_label(&f), "None");

        let one = ms(&[(1.0, 1.0)]);
        assert!(!fit_linear(&one, 0, 0).is_defined());
        assert!(!fit_linear(&[], 0, 0).is_defined());
    }

    #[test]
    fn setpoint_margin_and_clamp() {
        let f = fit_linear(&ms(&[(0.0, 0.0), (10.0, 100.0)]), 0, 1);
        assert!(close(compute_setpoint(&f, 5.0, 20.0), 60.0));
        assert!(close(compute_setpoint(&f, 5.0, -20.0), 40.0));
        assert!(close(compute_setpoint(&f, -5.0, 0.0), -50.0));
        assert_eq!(clamp_setpoint(-50.0), 0.0);
        assert_eq!(clamp_setpoint(f64::NAN), 0.0);
        assert_eq!(clamp_setpoint(12.0), 12.0);
    }

    #[test]
    fn labels_group_thousands_and_show_sign() {
        let f = Fit {
            kind: FitKind::LogLinear,
            slope: 1234.5,
            intercept: -2.0,
            r_squared: 0.995,
        };
        assert_eq!(equation_label(&f), "y = 1,234.50 * ln(x) - 2.00");
        assert_eq!(r_squared_label(&f), "99.5%");
        let neg = Fit {
            slope: -0.5,
            kind: FitKind::Linear,
            ..f
        };
        assert_eq!(equation_label(&neg), "y = -0.50x - 2.00");
    }

    fn detector_fit(points: &[(f64, f64)]) -> DetectorFit {
        let det = Detector::with_suffixes("IC1", None, None, ":D", ":S", ":W");
        DetectorFit::new(DetectorDataset::new(det, ms(points)))
    }

    #[test]
    fn subrange_refit_needs_two_points() {
        let mut df = detector_fit(&[(0.0, 0.0), (1.0, 1.0), (2.0, 10.0), (3.0, 20.0)]);
        let before = *df.linear();
        assert!(!df.update_fit_range(2, 2));
        assert_eq!(*df.linear(), before);
        assert_eq!(df.fit_range(), (0, 3));

        assert!(df.update_fit_range(2, 3));
        assert!(close(df.linear().slope, 10.0));
        assert_eq!(df.fit_range(), (2, 3));
    }

    #[test]
    fn detector_setpoint_uses_selected_fit_and_clamps() {
        let mut df = detector_fit(&[(1.0, 10.0), (2.0, 20.0), (4.0, 40.0)]);
        df.set_setpoint_params(SetpointParams {
            current: 3.0,
            margin_percent: 10.0,
        });
        assert!(close(df.setpoint(), 33.0));
        df.select(FitKind::LogLinear);
        assert_eq!(df.selected_kind(), FitKind::LogLinear);
        df.set_setpoint_params(SetpointParams {
            current: 0.0,
            margin_percent: 10.0,
        });
        assert!(df.raw_setpoint().is_nan());
        assert_eq!(df.setpoint(), 0.0);
        assert_eq!(df.trip_setpoint().dose_rate, 0.0);
    }

    #[test]
    fn replacing_measurements_refits_and_keeps_selection() {
        let mut df = detector_fit(&[(1.0, 1.0), (2.0, 2.0)]);
        df.select(FitKind::LogLinear);
        df.set_measurements(ms(&[(0.0, 7.0), (1.0, 10.0), (2.0, 13.0)]));
        assert_eq!(df.selected_kind(), FitKind::LogLinear);
        assert!(close(df.linear().slope, 3.0));
        assert_eq!(df.fit_range(), (0, 2));
    }
}
