//! Simulated control-system gateway.
//!
//! [`SimulatedGateway`] keeps an in-memory table of process variables and
//! fans monitor events out on a dedicated notification thread, the way a
//! channel-access client delivers callbacks. It also models a crude beam
//! (current proportional to attenuator position, dose proportional to current)
//! so the calibration sequencer can be exercised end to end without a network.
//!
//! Failure injection (scripted reads, persistent failures, unreachable
//! channels, latency) and read hooks make it usable as a test double.
pub mod error;
pub mod registry;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use icalibrate_traits::{BoxError, Gateway, Listener, MonitorEvent, PvValue, SubscriptionId};
use rand::Rng;

use crate::error::{GatewayError, Op};
use crate::registry::SubscriptionRegistry;

/// Called on every `get`, with the endpoint and its 1-based read count.
/// Runs on the reader's thread with no gateway locks held.
///
/// Hooks are stored inside the gateway's shared state, so a hook must act on the
/// gateway it is handed rather than capture a clone of it. A captured clone keeps
/// the shared state alive forever and the notifier thread never exits.
pub type ReadHook = Arc<dyn Fn(&SimulatedGateway, &str, u64) + Send + Sync>;

/// Linear beam model: `current = attenuator * current_per_attenuator` and
/// `dose = current * dose_per_current` for every listed dose endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct BeamModel {
    pub attenuator_pv: String,
    pub current_pv: String,
    pub dose_pvs: Vec<String>,
    pub current_per_attenuator: f64,
    pub dose_per_current: f64,
    /// Relative noise amplitude (0.0 = deterministic).
    pub noise: f64,
}

impl BeamModel {
    fn jitter(&self, v: f64) -> f64 {
        if self.noise > 0.0 {
            let n = rand::thread_rng().gen_range(-self.noise..=self.noise);
            v * (1.0 + n)
        } else {
            v
        }
    }
}

enum Notification {
    Deliver { id: SubscriptionId, event: MonitorEvent },
    Publish { event: MonitorEvent },
    Flush(xch::Sender<()>),
}

#[derive(Default)]
struct State {
    values: HashMap<String, PvValue>,
    scripted: HashMap<String, VecDeque<Result<PvValue, GatewayError>>>,
    get_failures: HashMap<String, GatewayError>,
    put_failures: HashMap<String, GatewayError>,
    unreachable: HashSet<String>,
    puts: Vec<(String, PvValue)>,
    reads: HashMap<String, u64>,
    beam: Option<BeamModel>,
    latency: Duration,
    hooks: Vec<ReadHook>,
}

struct Shared {
    state: Mutex<State>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    tx: Option<xch::Sender<Notification>>,
    notifier: Option<JoinHandle<()>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Closing the channel ends the notifier loop.
        self.tx.take();
        if let Some(handle) = self.notifier.take() {
            if handle.join().is_err() {
                tracing::warn!("gateway notifier thread panicked during shutdown");
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn notifier_loop(rx: &xch::Receiver<Notification>, registry: &Mutex<SubscriptionRegistry>) {
    for note in rx {
        match note {
            Notification::Deliver { id, event } => {
                let listener = lock(registry).listener(id);
                if let Some(l) = listener {
                    l(&event);
                }
            }
            Notification::Publish { event } => {
                let listeners = lock(registry).listeners(event.pv());
                for l in listeners {
                    l(&event);
                }
            }
            Notification::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    tracing::trace!("gateway notifier exiting");
}

/// In-memory gateway. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimulatedGateway {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for SimulatedGateway {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimulatedGateway")
            .field("subscriptions", &self.subscription_counts())
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGateway {
    pub fn new() -> Self {
        let (tx, rx) = xch::unbounded();
        let registry = Arc::new(Mutex::new(SubscriptionRegistry::new()));
        let reg = Arc::clone(&registry);
        let notifier = std::thread::Builder::new()
            .name("gateway-notify".into())
            .spawn(move || notifier_loop(&rx, &reg))
            .ok();
        if notifier.is_none() {
            tracing::error!("failed to spawn gateway notifier; monitors will be silent");
        }
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                registry,
                tx: Some(tx),
                notifier,
            }),
        }
    }

    /// Gateway preloaded with a beam model. The attenuator starts at `initial_attenuator`.
    pub fn with_beam(model: BeamModel, initial_attenuator: f64) -> Self {
        let gw = Self::new();
        gw.set(&model.attenuator_pv, initial_attenuator);
        gw.set_beam(model);
        gw
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.shared.state)
    }

    fn notify(&self, note: Notification) {
        if let Some(tx) = &self.shared.tx {
            let _ = tx.send(note);
        }
    }

    pub fn set_beam(&self, model: BeamModel) {
        self.state().beam = Some(model);
    }

    /// Store a value and publish it to monitors of `pv`.
    pub fn set(&self, pv: &str, value: impl Into<PvValue>) {
        let value = value.into();
        self.state().values.insert(pv.to_string(), value.clone());
        self.notify(Notification::Publish {
            event: MonitorEvent::Update {
                pv: pv.to_string(),
                value,
            },
        });
    }

    /// Current stored value (beam-modelled endpoints are not materialised here).
    pub fn value(&self, pv: &str) -> Option<PvValue> {
        self.state().values.get(pv).cloned()
    }

    /// Tell monitors of `pv` the channel dropped.
    pub fn disconnect(&self, pv: &str) {
        self.notify(Notification::Publish {
            event: MonitorEvent::Disconnected { pv: pv.to_string() },
        });
    }

    /// Queue one result returned by the next `get` of `pv`, ahead of everything else.
    pub fn script_get(&self, pv: &str, result: Result<PvValue, GatewayError>) {
        self.state()
            .scripted
            .entry(pv.to_string())
            .or_default()
            .push_back(result);
    }

    /// Fail every `get` of `pv` until cleared.
    pub fn fail_get(&self, pv: &str, err: GatewayError) {
        self.state().get_failures.insert(pv.to_string(), err);
    }

    /// Fail every `put` to `pv` until cleared.
    pub fn fail_put(&self, pv: &str, err: GatewayError) {
        self.state().put_failures.insert(pv.to_string(), err);
    }

    pub fn clear_failures(&self, pv: &str) {
        let mut st = self.state();
        st.get_failures.remove(pv);
        st.put_failures.remove(pv);
        st.scripted.remove(pv);
    }

    /// Reads and writes time out; monitors never connect.
    pub fn make_unreachable(&self, pv: &str) {
        self.state().unreachable.insert(pv.to_string());
    }

    /// Simulated round-trip. Operations whose timeout is shorter fail with `Timeout`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    pub fn on_read(&self, hook: ReadHook) {
        self.state().hooks.push(hook);
    }

    /// Every successful `put`, in order.
    pub fn puts(&self) -> Vec<(String, PvValue)> {
        self.state().puts.clone()
    }

    pub fn puts_to(&self, pv: &str) -> Vec<PvValue> {
        self.state()
            .puts
            .iter()
            .filter(|(p, _)| p == pv)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn read_count(&self, pv: &str) -> u64 {
        self.state().reads.get(pv).copied().unwrap_or(0)
    }

    pub fn subscription_counts(&self) -> BTreeMap<String, usize> {
        lock(&self.shared.registry).counts()
    }

    /// Block until every event queued so far has been delivered.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = xch::bounded(1);
        self.notify(Notification::Flush(ack_tx));
        let _ = ack_rx.recv_timeout(Duration::from_secs(5));
    }

    fn simulate_latency(
        &self,
        st: &State,
        pv: &str,
        op: Op,
        timeout: Duration,
    ) -> Result<(), GatewayError> {
        if st.unreachable.contains(pv) || st.latency > timeout {
            return Err(GatewayError::Timeout {
                pv: pv.to_string(),
                op,
                timeout,
            });
        }
        Ok(())
    }

    fn read(&self, pv: &str, timeout: Duration) -> Result<PvValue, GatewayError> {
        let (count, hooks, latency) = {
            let mut st = self.state();
            let n = st.reads.entry(pv.to_string()).or_insert(0);
            *n += 1;
            (*n, st.hooks.clone(), st.latency)
        };
        for hook in &hooks {
            hook(self, pv, count);
        }
        if !latency.is_zero() && latency <= timeout {
            std::thread::sleep(latency);
        }

        let mut st = self.state();
        self.simulate_latency(&st, pv, Op::Get, timeout)?;
        if let Some(next) = st.scripted.get_mut(pv).and_then(VecDeque::pop_front) {
            return next;
        }
        if let Some(err) = st.get_failures.get(pv) {
            return Err(err.clone());
        }
        if let Some(beam) = &st.beam {
            let attenuator = || {
                st.values
                    .get(&beam.attenuator_pv)
                    .and_then(PvValue::as_f64)
                    .unwrap_or(0.0)
            };
            if pv == beam.current_pv {
                let current = attenuator() * beam.current_per_attenuator;
                return Ok(PvValue::Double(beam.jitter(current)));
            }
            if beam.dose_pvs.iter().any(|d| d == pv) {
                let dose = attenuator() * beam.current_per_attenuator * beam.dose_per_current;
                return Ok(PvValue::Double(beam.jitter(dose)));
            }
        }
        st.values
            .get(pv)
            .cloned()
            .ok_or_else(|| GatewayError::Connection {
                pv: pv.to_string(),
                op: Op::Get,
                reason: "no such channel".into(),
            })
    }

    fn write(&self, pv: &str, value: PvValue, timeout: Duration) -> Result<(), GatewayError> {
        {
            let mut st = self.state();
            self.simulate_latency(&st, pv, Op::Put, timeout)?;
            if let Some(err) = st.put_failures.get(pv) {
                return Err(err.clone());
            }
            st.puts.push((pv.to_string(), value.clone()));
        }
        tracing::debug!(pv, %value, "put");
        self.set(pv, value);
        Ok(())
    }
}

impl Gateway for SimulatedGateway {
    fn get(&self, pv: &str, timeout: Duration) -> Result<PvValue, BoxError> {
        let v = self.read(pv, timeout)?;
        tracing::trace!(pv, value = %v, "get");
        Ok(v)
    }

    fn put(&self, pv: &str, value: PvValue, timeout: Duration) -> Result<(), BoxError> {
        self.write(pv, value, timeout)?;
        Ok(())
    }

    fn subscribe(&self, pv: &str, listener: Listener) -> Result<SubscriptionId, BoxError> {
        let (id, opened) = lock(&self.shared.registry).subscribe(pv, listener);
        if opened {
            tracing::debug!(pv, "monitor opened");
        }
        let (reachable, current) = {
            let st = self.state();
            (
                !st.unreachable.contains(pv),
                st.values.get(pv).cloned().unwrap_or(PvValue::Double(0.0)),
            )
        };
        if reachable {
            self.notify(Notification::Deliver {
                id,
                event: MonitorEvent::Connected { pv: pv.to_string() },
            });
            self.notify(Notification::Deliver {
                id,
                event: MonitorEvent::Update {
                    pv: pv.to_string(),
                    value: current,
                },
            });
        }
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        if let Some((pv, true)) = lock(&self.shared.registry).unsubscribe(id) {
            tracing::debug!(pv, "monitor closed");
        }
    }
}
