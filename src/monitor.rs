//! Starvation reports for runners stuck in the material recheck.
//!
//! Steps record the shortage they are waiting on and clear it once every
//! ingredient is present. Only runners that are tracked (between `initialize`
//! and `terminate`) are recorded, so a step finishing after its runner was
//! torn down leaves nothing behind.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shortage a step is currently waiting on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MaterialWait {
    pub step: String,
    /// Required quantity and matcher, e.g. `5x board`.
    pub missing: String,
    pub region: String,
    pub available: u32,
    pub since: Instant,
}

impl MaterialWait {
    fn same_shortage(&self, other: &MaterialWait) -> bool {
        self.step == other.step && self.missing == other.missing && self.region == other.region
    }
}

pub struct StarvationMonitor {
    // Tracked runner -> current shortage, if any.
    waits: Mutex<HashMap<String, Option<MaterialWait>>>,
}

impl StarvationMonitor {
    pub fn new() -> Self {
        Self {
            waits: Mutex::new(HashMap::new()),
        }
    }

    pub fn track(&self, runner: &str) {
        let mut guard = self.waits.lock().expect("starvation monitor poisoned");
        guard.entry(runner.to_string()).or_insert(None);
    }

    pub fn forget(&self, runner: &str) {
        let mut guard = self.waits.lock().expect("starvation monitor poisoned");
        guard.remove(runner);
    }

    /// Record that `runner` is short of materials.
    ///
    /// The start time of an ongoing shortage is kept so repeated rechecks do
    /// not reset it. Untracked runners are ignored.
    pub fn waiting(&self, runner: &str, wait: MaterialWait) {
        let mut guard = self.waits.lock().expect("starvation monitor poisoned");
        let Some(slot) = guard.get_mut(runner) else {
            return;
        };
        match slot {
            Some(current) if current.same_shortage(&wait) => current.available = wait.available,
            _ => *slot = Some(wait),
        }
    }

    /// All ingredients are present again.
    pub fn resumed(&self, runner: &str) {
        let mut guard = self.waits.lock().expect("starvation monitor poisoned");
        if let Some(slot) = guard.get_mut(runner) {
            *slot = None;
        }
    }

    /// Runners short of materials for longer than `timeout`, sorted by name.
    pub fn starved(&self, timeout: Duration) -> Vec<(String, MaterialWait)> {
        let guard = self.waits.lock().expect("starvation monitor poisoned");
        let mut starved: Vec<_> = guard
            .iter()
            .filter_map(|(runner, wait)| {
                let wait = wait.as_ref()?;
                (wait.since.elapsed() >= timeout).then(|| (runner.clone(), wait.clone()))
            })
            .collect();
        starved.sort_by(|a, b| a.0.cmp(&b.0));
        starved
    }
}

impl Default for StarvationMonitor {
    fn default() -> Self {
        Self::new()
    }
}
