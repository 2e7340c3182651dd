//! Human-readable error descriptions, exit codes and structured JSON errors.

use icalibrate_core::{BuildError, CalibrateError, GatewayErrorKind};

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    if let Some(ce) = err.downcast_ref::<CalibrateError>() {
        return humanize_calibrate(ce);
    }

    if let Some(be) = err.downcast_ref::<BuildError>() {
        return match be {
            BuildError::UnknownHall(h) => format!(
                "What happened: Unknown hall {h:?}.\nLikely causes: Typo in --hall or a dataset from another tool.\nHow to fix: Use one of A, C or D."
            ),
            BuildError::UnknownLaser(l) => format!(
                "What happened: Unknown laser {l:?}.\nLikely causes: Typo in --laser.\nHow to fix: Use one of A, B, C or D."
            ),
            BuildError::MissingPv { what, key } => format!(
                "What happened: No {what} configured for {key}.\nLikely causes: The [pvs] section of the config is incomplete.\nHow to fix: Add the missing entry under [pvs.current] or [pvs.laser.<L>] and rerun."
            ),
            BuildError::MissingHall | BuildError::MissingLaser => format!(
                "What happened: Run parameters are incomplete ({be}).\nLikely causes: The run was started without a hall or laser.\nHow to fix: Pass --hall and --laser."
            ),
        };
    }

    // String-based heuristics for errors coming from config or file loading
    let msg = format!("{err:#}");
    let lower = msg.to_ascii_lowercase();

    if lower.contains("read config") {
        return format!(
            "What happened: The config file could not be read.\nLikely causes: Wrong --config path or missing permissions.\nHow to fix: Point --config at an existing TOML file (see etc/icalibrate.toml). Detail: {msg}"
        );
    }
    if lower.contains("parse config") || lower.contains("invalid config") {
        return format!(
            "What happened: Configuration is invalid.\nLikely causes: A missing section, an empty PV name or an out-of-range value.\nHow to fix: Edit the TOML config and try again. Detail: {msg}"
        );
    }
    if lower.contains("hcd") {
        return format!(
            "What happened: The dataset file could not be used.\nLikely causes: Wrong path, or a file that is not a hall calibration dataset.\nHow to fix: Check the --file argument. Detail: {msg}"
        );
    }

    // Generic fallback
    format!(
        "Something went wrong.\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

fn humanize_calibrate(e: &CalibrateError) -> String {
    match e {
        CalibrateError::Validation(m) => format!(
            "What happened: Run parameters are invalid: {m}.\nLikely causes: Attenuator range, steps, settle time or samples out of range.\nHow to fix: Adjust --min/--max/--steps/--settle/--samples or the [run] defaults."
        ),
        CalibrateError::Gateway { pv, op, kind, message } => {
            let (causes, fix) = match kind {
                GatewayErrorKind::Timeout => (
                    "The IOC serving it is down, the name is misspelled, or gateway.timeout_ms is too low.",
                    "Check the channel with a CA client and raise gateway.timeout_ms if the IOC is slow.",
                ),
                GatewayErrorKind::Connection => (
                    "The channel does not exist or the gateway refused the request.",
                    "Verify the PV names in [pvs] and [hall.*] and that writes are permitted.",
                ),
                GatewayErrorKind::Protocol => (
                    "The channel returned a value of an unexpected type.",
                    "Verify that the configured PV is the numeric readback, not a string or status record.",
                ),
            };
            format!(
                "What happened: {kind} during {op} of {pv} ({message}).\nLikely causes: {causes}\nHow to fix: {fix}"
            )
        }
        CalibrateError::Interlock(m) => format!(
            "What happened: Interlock fault ({m}).\nLikely causes: The master FSD tripped.\nHow to fix: Clear the interlock, then start a new run."
        ),
        CalibrateError::Cancelled => "What happened: The run was cancelled before any data was taken.\nLikely causes: Ctrl-C during the first step.\nHow to fix: Start a new run when ready.".to_string(),
        CalibrateError::Cleanup { source, salvaged } => {
            let saved = if salvaged.is_some() {
                " The measured data was saved."
            } else {
                ""
            };
            format!(
                "What happened: Restoring the attenuator or laser mode failed: {source}.{saved}\nLikely causes: The attenuator or mode PV stopped accepting writes at the end of the run.\nHow to fix: Check the attenuator position and laser mode by hand before beam operations resume."
            )
        }
        CalibrateError::State(_) | CalibrateError::Io(_) => format!(
            "What happened: {e}.\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
        ),
    }
}

/// 0 success, 1 generic, 2 validation, 3 gateway, 4 cancelled without data, 5 cleanup.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if let Some(ce) = err.downcast_ref::<CalibrateError>() {
        return match ce {
            CalibrateError::Validation(_) => 2,
            CalibrateError::Gateway { .. } => 3,
            CalibrateError::Cancelled => 4,
            CalibrateError::Cleanup { .. } => 5,
            CalibrateError::Interlock(_) | CalibrateError::State(_) | CalibrateError::Io(_) => 1,
        };
    }
    if err.downcast_ref::<BuildError>().is_some() {
        return 2;
    }
    1
}

fn reason_name(err: &eyre::Report) -> &'static str {
    match err.downcast_ref::<CalibrateError>() {
        Some(CalibrateError::Validation(_)) => "Validation",
        Some(CalibrateError::Gateway { .. }) => "Gateway",
        Some(CalibrateError::Interlock(_)) => "Interlock",
        Some(CalibrateError::Cancelled) => "Cancelled",
        Some(CalibrateError::Cleanup { .. }) => "Cleanup",
        Some(CalibrateError::State(_)) => "State",
        Some(CalibrateError::Io(_)) => "Io",
        None if err.downcast_ref::<BuildError>().is_some() => "Validation",
        None => "Error",
    }
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use serde_json::json;

    let mut obj = json!({
        "reason": reason_name(err),
        "exit_code": exit_code_for_error(err),
        "message": humanize(err),
    });
    if let Some(pv) = err.downcast_ref::<CalibrateError>().and_then(CalibrateError::pv) {
        obj["pv"] = json!(pv);
    }
    obj.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use icalibrate_core::GatewayOp;

    #[test]
    fn gateway_errors_name_the_pv_and_exit_3() {
        let e = eyre::Report::new(CalibrateError::Gateway {
            pv: "IC1L01:DOSE".into(),
            op: GatewayOp::Get,
            kind: GatewayErrorKind::Timeout,
            message: "timeout after 200 ms".into(),
        });
        assert_eq!(exit_code_for_error(&e), 3);
        let h = humanize(&e);
        assert!(h.starts_with("What happened: timeout during get of IC1L01:DOSE"));
        let v: serde_json::Value = serde_json::from_str(&format_error_json(&e)).unwrap();
        assert_eq!(v["reason"], "Gateway");
        assert_eq!(v["pv"], "IC1L01:DOSE");
    }

    #[test]
    fn cleanup_and_cancel_codes() {
        let cleanup = eyre::Report::new(CalibrateError::Cleanup {
            source: Box::new(CalibrateError::Io("x".into())),
            salvaged: None,
        });
        assert_eq!(exit_code_for_error(&cleanup), 5);
        assert_eq!(exit_code_for_error(&eyre::Report::new(CalibrateError::Cancelled)), 4);
        assert_eq!(
            exit_code_for_error(&eyre::Report::new(BuildError::UnknownHall("B".into()))),
            2
        );
        assert_eq!(exit_code_for_error(&eyre::eyre!("boom")), 1);
    }
}
