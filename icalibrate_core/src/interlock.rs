//! Flags derived from the master interlock (FSD) monitor.
//!
//! The notification thread is the only writer. `tripped_during_step` is
//! sticky: set by any non-zero update, cleared only when a step attempt begins,
//! so a short trip is seen even if it clears before the sampler looks.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use icalibrate_traits::{Listener, MonitorEvent};

use crate::control::RunControl;

#[derive(Debug, Default)]
pub struct InterlockFlags {
    tripped_now: AtomicBool,
    tripped_during_step: AtomicBool,
}

impl InterlockFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_value(&self, v: f64) {
        let tripped = v != 0.0;
        self.tripped_now.store(tripped, Ordering::SeqCst);
        if tripped {
            self.tripped_during_step.store(true, Ordering::SeqCst);
        }
    }

    /// Clear the sticky flag at the start of a step attempt.
    pub fn begin_attempt(&self) {
        self.tripped_during_step.store(false, Ordering::SeqCst);
    }

    pub fn is_tripped_now(&self) -> bool {
        self.tripped_now.load(Ordering::SeqCst)
    }

    pub fn tripped_during_step(&self) -> bool {
        self.tripped_during_step.load(Ordering::SeqCst)
    }
}

/// Monitor callback feeding `flags` and reporting the connection to `control`.
///
/// The monitor only counts as connected once its first numeric value has been
/// applied to `flags`; a channel connection alone says nothing about whether
/// the interlock is tripped.
pub fn listener(flags: Arc<InterlockFlags>, control: Arc<RunControl>) -> Listener {
    Arc::new(move |event: &MonitorEvent| match event {
        MonitorEvent::Connected { pv } => {
            tracing::debug!(pv = %pv, "interlock monitor connected; waiting for first value");
        }
        MonitorEvent::Update { pv, value } => match value.as_f64() {
            Some(v) => {
                if v != 0.0 {
                    tracing::warn!(pv = %pv, value = v, "interlock tripped");
                }
                flags.on_value(v);
                control.mark_connected();
            }
            None => tracing::warn!(pv = %pv, %value, "non-numeric interlock value ignored"),
        },
        MonitorEvent::Disconnected { pv } => {
            tracing::warn!(pv = %pv, "interlock monitor disconnected");
        }
    })
}
