//! Hall calibration dataset (HCD) files.
//!
//! ```text
//! --- Start HCD header
//! Hall: A
//! Target: Carbon
//! Pass: 1
//! Note: morning run
//! Calibrated Date: 2024-03-05T14:30
//! Calibrated By: operator
//! File Format: Independent ICs
//! --- End HCD header
//! #IC: IC1L01 Upstream
//! 0.00 0
//! 12.50 125
//! ```
//!
//! Files written before per-chamber blocks existed omit `File Format` and carry a
//! comma-separated matrix body instead: a `#HALL CURR,<ic>,<ic>...` title row
//! followed by `current,dose,dose...` rows.
use std::path::Path;

use chrono::NaiveDateTime;
use eyre::WrapErr;

use crate::HALLS;

pub const HEADER_START: &str = "--- Start HCD header";
pub const HEADER_END: &str = "--- End HCD header";
pub const FORMAT_INDEPENDENT: &str = "Independent ICs";
pub const DATE_FORMAT: &str = "%Y-%m-%dT%H:%M";
const CHAMBER_TAG: &str = "#IC:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    /// One `#IC:` block per chamber, each with its own currents.
    IndependentIcs,
    /// Legacy shared-current matrix.
    Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChamberRecord {
    pub epics_name: String,
    pub friendly_name: Option<String>,
    /// `(current, dose rate)` pairs in file order.
    pub samples: Vec<(f64, f64)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HcdFile {
    pub hall: String,
    pub target: String,
    pub pass: String,
    pub note: String,
    pub calibrated_at: NaiveDateTime,
    pub calibrated_by: String,
    pub format: BodyFormat,
    pub chambers: Vec<ChamberRecord>,
}

struct Lines<'a> {
    inner: std::iter::Enumerate<std::str::Lines<'a>>,
}

impl<'a> Lines<'a> {
    fn next_line(&mut self, missing: &str) -> eyre::Result<(usize, &'a str)> {
        self.inner
            .next()
            .map(|(i, l)| (i + 1, l.trim_end_matches('\r')))
            .ok_or_else(|| eyre::eyre!("HCD file is missing {missing}"))
    }

    fn field(&mut self, key: &str) -> eyre::Result<String> {
        let (_, line) = self.next_line(&format!("{key} metadata"))?;
        match line.split_once(':') {
            Some((k, v)) if k == key => Ok(v.trim().to_string()),
            _ => eyre::bail!("HCD file is missing {key} metadata"),
        }
    }
}

/// Parse an HCD document.
pub fn parse(text: &str) -> eyre::Result<HcdFile> {
    let mut lines = Lines {
        inner: text.lines().enumerate(),
    };

    let (_, first) = lines.next_line("header")?;
    if first != HEADER_START {
        eyre::bail!("HCD file is missing header");
    }
    let hall = lines.field("Hall")?;
    if !HALLS.contains(&hall.as_str()) {
        eyre::bail!("HCD file names unknown hall {hall:?}");
    }
    let target = lines.field("Target")?;
    let pass = lines.field("Pass")?;
    let note = lines.field("Note")?;
    let date = lines.field("Calibrated Date")?;
    let calibrated_at = NaiveDateTime::parse_from_str(&date, DATE_FORMAT)
        .wrap_err_with(|| format!("invalid Calibrated Date {date:?}"))?;
    let calibrated_by = lines.field("Calibrated By")?;

    let (_, mut line) = lines.next_line("end of header")?;
    let mut format = BodyFormat::Matrix;
    if let Some(("File Format", v)) = line.split_once(':') {
        let v = v.trim();
        if v != FORMAT_INDEPENDENT {
            eyre::bail!("unsupported HCD file format {v:?}");
        }
        format = BodyFormat::IndependentIcs;
        line = lines.next_line("end of header")?.1;
    }
    if line != HEADER_END {
        eyre::bail!("HCD file header is longer than expected");
    }

    let chambers = match format {
        BodyFormat::IndependentIcs => parse_independent(lines)?,
        BodyFormat::Matrix => parse_matrix(lines)?,
    };

    Ok(HcdFile {
        hall,
        target,
        pass,
        note,
        calibrated_at,
        calibrated_by,
        format,
        chambers,
    })
}

fn number(tok: Option<&str>, line_no: usize) -> eyre::Result<f64> {
    let tok = tok.ok_or_else(|| eyre::eyre!("line {line_no}: expected `current dose` pair"))?;
    tok.parse::<f64>()
        .wrap_err_with(|| format!("line {line_no}: invalid number {tok:?}"))
}

fn parse_independent(lines: Lines<'_>) -> eyre::Result<Vec<ChamberRecord>> {
    let mut out: Vec<ChamberRecord> = Vec::new();
    for (idx, raw) in lines.inner {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix(CHAMBER_TAG) {
            let rest = rest.trim();
            let (epics, friendly) = match rest.split_once(char::is_whitespace) {
                Some((e, f)) => (e, f.trim()),
                None => (rest, ""),
            };
            if epics.is_empty() {
                eyre::bail!("line {line_no}: chamber line without a name");
            }
            // Older writers emitted a literal `null` for a missing friendly name.
            let friendly_name = match friendly {
                "" | "null" => None,
                f => Some(f.to_string()),
            };
            out.push(ChamberRecord {
                epics_name: epics.to_string(),
                friendly_name,
                samples: Vec::new(),
            });
            continue;
        }
        let Some(chamber) = out.last_mut() else {
            eyre::bail!("line {line_no}: sample before the first {CHAMBER_TAG} line");
        };
        let mut toks = line.split_whitespace();
        let current = number(toks.next(), line_no)?;
        let dose = number(toks.next(), line_no)?;
        chamber.samples.push((current, dose));
    }
    Ok(out)
}

fn parse_matrix(lines: Lines<'_>) -> eyre::Result<Vec<ChamberRecord>> {
    let body: Vec<&str> = lines
        .inner
        .map(|(_, l)| l.trim_end_matches('\r'))
        .filter(|l| !l.trim().is_empty())
        .collect();
    let body = body.join("\n");
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(body.as_bytes());

    let headers = rdr
        .headers()
        .wrap_err("read HCD matrix title row")?
        .clone();
    let mut chambers: Vec<ChamberRecord> = headers
        .iter()
        .skip(1)
        .map(|name| ChamberRecord {
            epics_name: name.to_string(),
            friendly_name: None,
            samples: Vec::new(),
        })
        .collect();

    for (idx, rec) in rdr.records().enumerate() {
        let row = idx + 2;
        let rec = rec.wrap_err_with(|| format!("invalid HCD matrix row {row}"))?;
        let current = number(rec.get(0), row)?;
        for (i, chamber) in chambers.iter_mut().enumerate() {
            let dose = number(rec.get(i + 1), row)?;
            chamber.samples.push((current, dose));
        }
    }
    Ok(chambers)
}

/// Render in the per-chamber format. Currents keep two decimals, dose rates none.
pub fn render(file: &HcdFile) -> String {
    use std::fmt::Write as _;

    let mut s = String::new();
    let _ = writeln!(s, "{HEADER_START}");
    let _ = writeln!(s, "Hall: {}", file.hall);
    let _ = writeln!(s, "Target: {}", file.target);
    let _ = writeln!(s, "Pass: {}", file.pass);
    let _ = writeln!(s, "Note: {}", file.note);
    let _ = writeln!(
        s,
        "Calibrated Date: {}",
        file.calibrated_at.format(DATE_FORMAT)
    );
    let _ = writeln!(s, "Calibrated By: {}", file.calibrated_by);
    let _ = writeln!(s, "File Format: {FORMAT_INDEPENDENT}");
    let _ = writeln!(s, "{HEADER_END}");
    for c in &file.chambers {
        match &c.friendly_name {
            Some(f) => {
                let _ = writeln!(s, "{CHAMBER_TAG} {} {f}", c.epics_name);
            }
            None => {
                let _ = writeln!(s, "{CHAMBER_TAG} {}", c.epics_name);
            }
        }
        for (current, dose) in &c.samples {
            let _ = writeln!(s, "{current:.2} {dose:.0}");
        }
    }
    s
}

pub fn read(path: &Path) -> eyre::Result<HcdFile> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read HCD file {}", path.display()))?;
    parse(&text).wrap_err_with(|| format!("parse HCD file {}", path.display()))
}
