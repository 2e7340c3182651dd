//! Reference-counted subscription bookkeeping keyed by endpoint name.
//!
//! A monitor on a process variable is opened when its first subscriber
//! arrives and closed when its last one leaves. Gateways own one registry and
//! consult the returned flags to decide when to touch the network.
use std::collections::{BTreeMap, HashMap};

use icalibrate_traits::{Listener, SubscriptionId};

#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    channels: HashMap<String, BTreeMap<SubscriptionId, Listener>>,
    index: HashMap<SubscriptionId, String>,
}

impl core::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("counts", &self.counts())
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` on `pv`. The flag is true when this opened the monitor.
    pub fn subscribe(&mut self, pv: &str, listener: Listener) -> (SubscriptionId, bool) {
        self.next_id = self.next_id.wrapping_add(1);
        let id = SubscriptionId(self.next_id);
        let listeners = self.channels.entry(pv.to_string()).or_default();
        let opened = listeners.is_empty();
        listeners.insert(id, listener);
        self.index.insert(id, pv.to_string());
        (id, opened)
    }

    /// Drop a subscription. Returns the endpoint and whether its monitor closed,
    /// or `None` when the id is unknown (already removed).
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<(String, bool)> {
        let pv = self.index.remove(&id)?;
        let mut closed = false;
        if let Some(listeners) = self.channels.get_mut(&pv) {
            listeners.remove(&id);
            if listeners.is_empty() {
                self.channels.remove(&pv);
                closed = true;
            }
        }
        Some((pv, closed))
    }

    /// Snapshot of every listener on `pv`, in subscription order.
    pub fn listeners(&self, pv: &str) -> Vec<Listener> {
        self.channels
            .get(pv)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn listener(&self, id: SubscriptionId) -> Option<Listener> {
        let pv = self.index.get(&id)?;
        self.channels.get(pv)?.get(&id).cloned()
    }

    pub fn ref_count(&self, pv: &str) -> usize {
        self.channels.get(pv).map_or(0, BTreeMap::len)
    }

    /// Endpoint -> subscriber count for every open monitor.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.channels
            .iter()
            .map(|(pv, l)| (pv.clone(), l.len()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
