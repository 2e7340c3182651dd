//! Seam traits shared by every crate in the workspace.
//!
//! The control-system network is only ever reached through [`Gateway`], and
//! wall-clock time through [`Clock`], so the calibration engine can be driven by
//! a simulated backend in tests and by a real client in production.
pub mod clock;
pub mod gateway;

pub use clock::{Clock, FixedClock, SystemClock};
pub use gateway::{BoxError, Gateway, Listener, MonitorEvent, PvValue, SubscriptionId};
