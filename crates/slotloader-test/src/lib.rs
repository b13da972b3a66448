//! Helpers for testing the coordinator and cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Loads run on the blocking pool of the runtime, and the runtime waits for them when it shuts
//!    down. A test that ends while a [`GatedLoader`] still holds back a load would hang, so keep
//!    the guard returned by [`GatedLoader::open_on_drop`] alive for the entire test (e.g.
//!    `let _gate = loader.open_on_drop();`).

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

/// How long [`GatedLoader::wait_for_calls`] waits before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `slotloader_service` crate and mutes
///    all other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("slotloader_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The resource that [`GatedLoader`] produces for `key` once the gate is open.
pub fn resource_for(key: &str) -> String {
    format!("resource:{key}")
}

enum Outcome {
    Resource(Option<String>),
    Fail(String),
    Panic(String),
}

#[derive(Default)]
struct Gate {
    open: bool,
    calls: Vec<String>,
    outcomes: BTreeMap<String, VecDeque<Outcome>>,
}

/// A loader that blocks every load until the test decides how it ends.
///
/// Each call to [`load`](Self::load) is recorded and then waits for an outcome for its key, which
/// the test provides with [`release`](Self::release), [`release_absent`](Self::release_absent),
/// [`fail`](Self::fail) or [`panic`](Self::panic). Outcomes can be provided before the load starts,
/// and are consumed in order. Once the gate is [opened](Self::open), loads without an outcome
/// return [`resource_for`] their key.
#[derive(Default)]
pub struct GatedLoader {
    gate: Mutex<Gate>,
    changed: Condvar,
}

impl GatedLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a load, blocking until an outcome for `key` is available.
    pub fn load(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut gate = self.lock();
        gate.calls.push(key.to_owned());
        self.changed.notify_all();

        let outcome = loop {
            if let Some(outcome) = gate.outcomes.get_mut(key).and_then(VecDeque::pop_front) {
                break outcome;
            }
            if gate.open {
                break Outcome::Resource(Some(resource_for(key)));
            }
            gate = self
                .changed
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        };
        drop(gate);

        match outcome {
            Outcome::Resource(resource) => Ok(resource),
            Outcome::Fail(message) => Err(anyhow::anyhow!(message)),
            Outcome::Panic(message) => panic!("{message}"),
        }
    }

    fn push(&self, key: &str, outcome: Outcome) {
        let mut gate = self.lock();
        gate.outcomes
            .entry(key.to_owned())
            .or_default()
            .push_back(outcome);
        self.changed.notify_all();
    }

    /// Lets the next load of `key` return `resource`.
    pub fn release(&self, key: &str, resource: &str) {
        self.push(key, Outcome::Resource(Some(resource.to_owned())));
    }

    /// Lets the next load of `key` return no resource.
    pub fn release_absent(&self, key: &str) {
        self.push(key, Outcome::Resource(None));
    }

    /// Lets the next load of `key` fail with `message`.
    pub fn fail(&self, key: &str, message: &str) {
        self.push(key, Outcome::Fail(message.to_owned()));
    }

    /// Lets the next load of `key` panic with `message`.
    pub fn panic(&self, key: &str, message: &str) {
        self.push(key, Outcome::Panic(message.to_owned()));
    }

    /// Opens the gate for all current and future loads.
    pub fn open(&self) {
        self.lock().open = true;
        self.changed.notify_all();
    }

    /// Returns a guard that opens the gate when dropped.
    pub fn open_on_drop(self: &Arc<Self>) -> OpenOnDrop {
        OpenOnDrop(Arc::clone(self))
    }

    /// All keys that were loaded so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// How often `key` was loaded.
    pub fn call_count(&self, key: &str) -> usize {
        self.lock().calls.iter().filter(|call| *call == key).count()
    }

    /// Blocks until at least `count` loads have started.
    ///
    /// # Panics
    ///
    /// Panics if that does not happen within a few seconds.
    pub fn wait_for_calls(&self, count: usize) {
        let gate = self.lock();
        let (gate, timeout) = self
            .changed
            .wait_timeout_while(gate, WAIT_TIMEOUT, |gate| gate.calls.len() < count)
            .unwrap_or_else(PoisonError::into_inner);
        assert!(
            !timeout.timed_out(),
            "expected {count} loads, got {:?}",
            gate.calls
        );
    }
}

/// Opens a [`GatedLoader`] when dropped.
pub struct OpenOnDrop(Arc<GatedLoader>);

impl Drop for OpenOnDrop {
    fn drop(&mut self) {
        self.0.open();
    }
}
