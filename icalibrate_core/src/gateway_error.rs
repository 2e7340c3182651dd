//! Maps `Box<dyn Error>` from the gateway seam to typed `CalibrateError`.
//!
//! `icalibrate_traits::Gateway` returns boxed errors so any client library can
//! sit behind it; this module classifies them, with an optional feature-gated
//! path that downcasts `icalibrate_gateway::error::GatewayError` precisely.

use crate::error::{CalibrateError, GatewayErrorKind, GatewayOp};

/// Map a gateway error for `op` on `pv` to a typed `CalibrateError::Gateway`.
///
/// Known error types are downcast first, then string heuristics apply.
pub fn map_gateway_error(
    pv: &str,
    op: GatewayOp,
    e: &(dyn std::error::Error + 'static),
) -> CalibrateError {
    #[cfg(feature = "gateway-errors")]
    {
        use icalibrate_gateway::error::GatewayError;
        if let Some(g) = e.downcast_ref::<GatewayError>() {
            let kind = match g {
                GatewayError::Timeout { .. } => GatewayErrorKind::Timeout,
                GatewayError::Connection { .. } => GatewayErrorKind::Connection,
                GatewayError::Protocol { .. } => GatewayErrorKind::Protocol,
            };
            return CalibrateError::Gateway {
                pv: g.pv().to_string(),
                op,
                kind,
                message: g.to_string(),
            };
        }
    }

    let message = e.to_string();
    let lower = message.to_lowercase();
    let kind = if lower.contains("timeout") || lower.contains("timed out") {
        GatewayErrorKind::Timeout
    } else if lower.contains("protocol") || lower.contains("type") {
        GatewayErrorKind::Protocol
    } else {
        GatewayErrorKind::Connection
    };
    CalibrateError::Gateway {
        pv: pv.to_string(),
        op,
        kind,
        message,
    }
}
