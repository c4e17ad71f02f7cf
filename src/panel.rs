//! Operator control surface: one trigger per region plus a status line.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::setup::SetupCoordinator;
use crate::types::RegionRef;

/// Result of pressing a control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PressOutcome {
    /// A capture worker was started.
    Started,
    /// Another capture was in progress or the region is already set.
    Ignored,
    UnknownControl,
}

struct Control {
    label: String,
    region: RegionRef,
}

pub struct ControlPanel {
    setup: Arc<SetupCoordinator>,
    controls: Mutex<Vec<Control>>,
    status: Mutex<String>,
    ignored: AtomicU64,
}

impl ControlPanel {
    pub fn new(setup: Arc<SetupCoordinator>) -> Self {
        Self {
            setup,
            controls: Mutex::new(Vec::new()),
            status: Mutex::new(String::new()),
            ignored: AtomicU64::new(0),
        }
    }

    /// Replace every control at once so operators never see a partial set.
    pub fn publish<I>(&self, controls: I)
    where
        I: IntoIterator<Item = (String, RegionRef)>,
    {
        let controls = controls
            .into_iter()
            .map(|(label, region)| Control { label, region })
            .collect();
        *self.controls.lock().expect("panel mutex poisoned") = controls;
    }

    pub fn labels(&self) -> Vec<String> {
        let guard = self.controls.lock().expect("panel mutex poisoned");
        guard.iter().map(|control| control.label.clone()).collect()
    }

    /// Operator clicked the control named `label`.
    pub fn press(&self, label: &str) -> PressOutcome {
        let region = {
            let guard = self.controls.lock().expect("panel mutex poisoned");
            match guard.iter().find(|control| control.label == label) {
                Some(control) => control.region.clone(),
                None => return PressOutcome::UnknownControl,
            }
        };
        if self.setup.request_region(&region) {
            self.set_status(format!("drawing {}", region.name()));
            PressOutcome::Started
        } else {
            self.ignored.fetch_add(1, Ordering::SeqCst);
            debug!("[PANEL] press on '{label}' ignored");
            PressOutcome::Ignored
        }
    }

    /// A region is being drawn; further presses are ignored until it ends.
    pub fn is_busy(&self) -> bool {
        self.setup.is_selecting()
    }

    pub fn clear(&self) {
        self.controls.lock().expect("panel mutex poisoned").clear();
    }

    pub fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().expect("panel mutex poisoned") = status.into();
    }

    pub fn status(&self) -> String {
        self.status.lock().expect("panel mutex poisoned").clone()
    }

    /// Presses dropped because a capture was already running.
    pub fn ignored_presses(&self) -> u64 {
        self.ignored.load(Ordering::SeqCst)
    }
}
