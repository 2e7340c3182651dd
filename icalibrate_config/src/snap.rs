//! Setpoint snapshot (SNAP) files in the BURT save-set layout.
use chrono::NaiveDateTime;

pub const HEADER_START: &str = "--- Start BURT header";
pub const HEADER_END: &str = "--- End BURT header";
/// `Tue Mar 5 14:30:00 2024`
pub const TIME_FORMAT: &str = "%a %b %-d %H:%M:%S %Y";

/// One line of the body: `<pv> 1 <value>`.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapEntry {
    pub pv: String,
    pub value: f64,
}

pub fn render(time: NaiveDateTime, login: &str, entries: &[SnapEntry]) -> String {
    use std::fmt::Write as _;

    let mut s = String::new();
    let _ = writeln!(s, "{HEADER_START}");
    let _ = writeln!(s, "Time: {}", time.format(TIME_FORMAT));
    let _ = writeln!(s, "Login ID: {login}");
    for key in ["Eff UID: ", "Group ID: ", "Keywords: ", "Comments: ", "Type: "] {
        let _ = writeln!(s, "{key}");
    }
    // The save-set tooling expects this key without a colon.
    let _ = writeln!(s, "Directory ");
    let _ = writeln!(s, "Req File: ");
    let _ = writeln!(s, "{HEADER_END}");
    for e in entries {
        let _ = writeln!(s, "{} 1 {:.0}", e.pv, e.value);
    }
    s
}
