//! Test fakes for the world collaborators and the picking service.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::WorldError;
use crate::types::{Area, Coord, CraftCommand, MaterialMatcher};
use crate::world::{Crafter, PickService, Placer, WorldQuery};

/// 3x3 area whose corner sits at `(x, 0)`.
pub fn area_at(x: i32) -> Area {
    Area::from_corners(Coord::new(x, 0), Coord::new(x + 2, 2))
}

#[derive(Default)]
struct PickerState {
    waiting: HashSet<String>,
    outcomes: HashMap<String, Option<Area>>,
    started: usize,
    active: usize,
    max_active: usize,
    pick_mode: usize,
}

/// Picking service driven step by step from the test thread.
pub struct ManualPicker {
    state: Mutex<PickerState>,
    changed: Condvar,
}

impl ManualPicker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PickerState::default()),
            changed: Condvar::new(),
        }
    }

    /// Block until a capture for `region` is waiting on the operator.
    pub fn wait_for_capture(&self, region: &str) {
        let guard = self.state.lock().expect("picker mutex poisoned");
        let (guard, timeout) = self
            .changed
            .wait_timeout_while(guard, Duration::from_secs(2), |state| {
                !state.waiting.contains(region)
            })
            .expect("condvar wait failed");
        assert!(!timeout.timed_out(), "no capture started for {region}");
        drop(guard);
    }

    pub fn complete(&self, region: &str, area: Area) {
        self.finish(region, Some(area));
    }

    pub fn abandon(&self, region: &str) {
        self.finish(region, None);
    }

    fn finish(&self, region: &str, outcome: Option<Area>) {
        let mut guard = self.state.lock().expect("picker mutex poisoned");
        guard.outcomes.insert(region.to_string(), outcome);
        self.changed.notify_all();
    }

    pub fn captures_started(&self) -> usize {
        self.state.lock().expect("picker mutex poisoned").started
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().expect("picker mutex poisoned").max_active
    }

    pub fn pick_mode_enabled(&self) -> usize {
        self.state.lock().expect("picker mutex poisoned").pick_mode
    }
}

impl PickService for ManualPicker {
    fn enable_pick_mode(&self) {
        self.state.lock().expect("picker mutex poisoned").pick_mode += 1;
    }

    fn capture(&self, region: &str, session: &CancelToken) -> Option<Area> {
        let mut guard = self.state.lock().expect("picker mutex poisoned");
        guard.started += 1;
        guard.active += 1;
        guard.max_active = guard.max_active.max(guard.active);
        guard.waiting.insert(region.to_string());
        self.changed.notify_all();
        let outcome = loop {
            if let Some(outcome) = guard.outcomes.remove(region) {
                break outcome;
            }
            if session.is_cancelled() {
                break None;
            }
            let (next, _) = self
                .changed
                .wait_timeout(guard, Duration::from_millis(5))
                .expect("condvar wait failed");
            guard = next;
        };
        guard.waiting.remove(region);
        guard.active -= 1;
        self.changed.notify_all();
        outcome
    }
}

/// Collaborator call observed by `RecordingWorld`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Count(String),
    Craft(String),
    Place(String, Area),
}

type CraftHook = Box<dyn Fn(&CraftCommand) + Send + Sync>;

/// In-memory world that records every collaborator call in order.
pub struct RecordingWorld {
    stock: Mutex<Vec<(Coord, String, u32)>>,
    calls: Mutex<Vec<Call>>,
    failing_crafts: AtomicU32,
    on_craft: Mutex<Option<CraftHook>>,
}

impl RecordingWorld {
    pub fn new() -> Self {
        Self {
            stock: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            failing_crafts: AtomicU32::new(0),
            on_craft: Mutex::new(None),
        }
    }

    pub fn add_stock(&self, at: Coord, item: &str, quantity: u32) {
        let mut guard = self.stock.lock().expect("stock mutex poisoned");
        guard.push((at, item.to_string(), quantity));
    }

    /// Drop every pile of `item`.
    pub fn remove_stock(&self, item: &str) {
        let mut guard = self.stock.lock().expect("stock mutex poisoned");
        guard.retain(|(_, stocked, _)| stocked != item);
    }

    /// Make the next `count` craft calls fail.
    pub fn fail_next_crafts(&self, count: u32) {
        self.failing_crafts.store(count, Ordering::SeqCst);
    }

    /// Run `hook` inside every craft call, before it returns.
    pub fn on_craft(&self, hook: impl Fn(&CraftCommand) + Send + Sync + 'static) {
        *self.on_craft.lock().expect("hook mutex poisoned") = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    /// Calls excluding inventory queries.
    pub fn actions(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::Count(_)))
            .collect()
    }

    pub fn count_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Count(_)))
            .count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls mutex poisoned").push(call);
    }
}

impl WorldQuery for RecordingWorld {
    fn count_matching(&self, area: &Area, matcher: &MaterialMatcher) -> u32 {
        self.record(Call::Count(matcher.to_string()));
        let guard = self.stock.lock().expect("stock mutex poisoned");
        guard
            .iter()
            .filter(|(at, item, _)| area.contains(*at) && matcher.matches(item))
            .map(|(_, _, quantity)| *quantity)
            .sum()
    }
}

impl Crafter for RecordingWorld {
    fn craft(&self, command: &CraftCommand) -> Result<(), WorldError> {
        if let Some(hook) = self.on_craft.lock().expect("hook mutex poisoned").as_ref() {
            hook(command);
        }
        self.record(Call::Craft(command.id().to_string()));
        let failing = self.failing_crafts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_crafts.store(failing - 1, Ordering::SeqCst);
            return Err(WorldError::MissingMaterials(command.id().to_string()));
        }
        Ok(())
    }
}

impl Placer for RecordingWorld {
    fn move_item_into(&self, item: &str, area: &Area) -> Result<(), WorldError> {
        self.record(Call::Place(item.to_string(), *area));
        Ok(())
    }
}
