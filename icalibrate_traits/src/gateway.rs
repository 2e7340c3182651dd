//! The control-system gateway capability.
//!
//! A gateway is shared process-wide (behind an `Arc`), so every method takes
//! `&self` and implementations synchronise internally. Errors cross this
//! boundary boxed; consumers downcast to their concrete types when they need
//! to classify them.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A process-variable value as carried on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    Double(f64),
    Int(i64),
    /// Enumerated value (index into the record's state strings).
    Enum(u16),
    /// Metadata-only reads (descriptions, units).
    Text(String),
}

impl PvValue {
    /// Numeric view of the value; `None` for text.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Double(v) => Some(*v),
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Enum(v) => Some(f64::from(*v)),
            PvValue::Text(_) => None,
        }
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Double(v)
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Double(v) => write!(f, "{v}"),
            PvValue::Int(v) => write!(f, "{v}"),
            PvValue::Enum(v) => write!(f, "enum({v})"),
            PvValue::Text(s) => f.write_str(s),
        }
    }
}

/// Notification delivered to a subscriber on the gateway's notification thread.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// The channel is connected; a value update follows.
    Connected { pv: String },
    /// The channel was lost.
    Disconnected { pv: String },
    Update { pv: String, value: PvValue },
}

impl MonitorEvent {
    pub fn pv(&self) -> &str {
        match self {
            MonitorEvent::Connected { pv }
            | MonitorEvent::Disconnected { pv }
            | MonitorEvent::Update { pv, .. } => pv,
        }
    }
}

/// Subscriber callback. Must not block: it runs on the gateway's notification thread.
pub type Listener = Arc<dyn Fn(&MonitorEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

pub trait Gateway: Send + Sync {
    /// Synchronous read, failing after `timeout`.
    fn get(&self, pv: &str, timeout: Duration) -> Result<PvValue, BoxError>;

    /// Synchronous write, failing after `timeout`.
    fn put(&self, pv: &str, value: PvValue, timeout: Duration) -> Result<(), BoxError>;

    /// Start monitoring `pv`. The listener receives `Connected` followed by the
    /// current value once the channel is up, then every change.
    fn subscribe(&self, pv: &str, listener: Listener) -> Result<SubscriptionId, BoxError>;

    /// Stop delivering to the subscription. Unknown ids are ignored.
    fn unsubscribe(&self, id: SubscriptionId);
}

impl<G: Gateway + ?Sized> Gateway for Arc<G> {
    fn get(&self, pv: &str, timeout: Duration) -> Result<PvValue, BoxError> {
        (**self).get(pv, timeout)
    }
    fn put(&self, pv: &str, value: PvValue, timeout: Duration) -> Result<(), BoxError> {
        (**self).put(pv, value, timeout)
    }
    fn subscribe(&self, pv: &str, listener: Listener) -> Result<SubscriptionId, BoxError> {
        (**self).subscribe(pv, listener)
    }
    fn unsubscribe(&self, id: SubscriptionId) {
        (**self).unsubscribe(id)
    }
}
