use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Which gateway operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Get,
    Put,
    Subscribe,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Op::Get => "get",
            Op::Put => "put",
            Op::Subscribe => "subscribe",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    #[error("timeout after {} ms waiting for {op} of {pv}", timeout.as_millis())]
    Timeout {
        pv: String,
        op: Op,
        timeout: Duration,
    },
    #[error("unable to {op} {pv}: connection error: {reason}")]
    Connection { pv: String, op: Op, reason: String },
    #[error("protocol error on {pv}: {reason}")]
    Protocol { pv: String, reason: String },
}

impl GatewayError {
    /// Name of the endpoint the error refers to.
    pub fn pv(&self) -> &str {
        match self {
            GatewayError::Timeout { pv, .. }
            | GatewayError::Connection { pv, .. }
            | GatewayError::Protocol { pv, .. } => pv,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
