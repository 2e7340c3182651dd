use std::fmt;

use thiserror::Error;

use crate::model::CalibrationDataset;

/// Gateway operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOp {
    Get,
    Put,
    Subscribe,
}

impl fmt::Display for GatewayOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatewayOp::Get => "get",
            GatewayOp::Put => "put",
            GatewayOp::Subscribe => "subscribe",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    Timeout,
    Connection,
    Protocol,
}

impl fmt::Display for GatewayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GatewayErrorKind::Timeout => "timeout",
            GatewayErrorKind::Connection => "connection error",
            GatewayErrorKind::Protocol => "protocol error",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrateError {
    #[error("{0}")]
    Validation(String),
    #[error("{kind} during {op} of {pv}: {message}")]
    Gateway {
        pv: String,
        op: GatewayOp,
        kind: GatewayErrorKind,
        message: String,
    },
    #[error("interlock fault: {0}")]
    Interlock(String),
    #[error("run cancelled before any data was taken")]
    Cancelled,
    /// Restoring the attenuator or mode failed after the run itself ended normally.
    /// `salvaged` carries whatever the run produced.
    #[error("cleanup failed: {source}")]
    Cleanup {
        source: Box<CalibrateError>,
        salvaged: Option<Box<CalibrationDataset>>,
    },
    #[error("invalid state: {0}")]
    State(String),
    #[error("io error: {0}")]
    Io(String),
}

impl CalibrateError {
    /// Endpoint named by a gateway failure, looking through cleanup wrappers.
    pub fn pv(&self) -> Option<&str> {
        match self {
            CalibrateError::Gateway { pv, .. } => Some(pv),
            CalibrateError::Cleanup { source, .. } => source.pv(),
            _ => None,
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum BuildError {
    #[error("missing hall")]
    MissingHall,
    #[error("missing laser")]
    MissingLaser,
    #[error("unknown hall {0:?}")]
    UnknownHall(String),
    #[error("unknown laser {0:?}")]
    UnknownLaser(String),
    #[error("no {what} configured for {key}")]
    MissingPv { what: &'static str, key: String },
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
