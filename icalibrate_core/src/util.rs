//! Small helpers shared by the sequencer and the file writers.
use std::{fs, io::Write, path::Path};

/// Write `bytes` to `path` via a `.new` sibling, fsync, then rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("new");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(tmp, path)
}

/// Percent complete after finishing `step` of `0..=steps`.
///
/// `step * 100 / steps` in integer arithmetic: non-decreasing in `step`,
/// 0 after the first point and exactly 100 after the last.
#[inline]
pub fn progress_percent(step: u64, steps: u64) -> u8 {
    if steps == 0 {
        return 100;
    }
    let p = u128::from(step.min(steps)) * 100 / u128::from(steps);
    u8::try_from(p).unwrap_or(100)
}

/// Mean of `samples`; NaN when empty.
#[inline]
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return f64::NAN;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

const UNKNOWN: &str = "Unknown";

/// Keep `[A-Za-z0-9.-]`, replace anything else with `_`.
pub fn sanitize_target(target: &str) -> String {
    let t = target.trim();
    if t.is_empty() {
        return UNKNOWN.to_string();
    }
    t.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Collapse whitespace runs to `_`.
pub fn sanitize_pass(pass: &str) -> String {
    let p: Vec<&str> = pass.split_whitespace().collect();
    if p.is_empty() {
        return UNKNOWN.to_string();
    }
    p.join("_")
}
