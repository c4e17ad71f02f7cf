use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::types::{Area, RegionRef};

/// Operator-drawn area, written once per setup session.
pub struct Region {
    name: String,
    confirmed: AtomicBool,
    area: Mutex<Option<Area>>,
}

impl Region {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            confirmed: AtomicBool::new(false),
            area: Mutex::new(None),
        }
    }

    pub fn shared(name: impl Into<String>) -> RegionRef {
        Arc::new(Self::new(name))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed.load(Ordering::SeqCst)
    }

    /// Store the boundary and raise the confirmed flag.
    ///
    /// Returns false if the region was already confirmed; the first boundary wins.
    pub fn confirm(&self, area: Area) -> bool {
        let mut guard = self.area.lock().expect("region mutex poisoned");
        if self.is_confirmed() {
            warn!("[REGION] {} already confirmed, ignoring {area}", self.name);
            return false;
        }
        *guard = Some(area);
        // Area is visible before the flag flips.
        self.confirmed.store(true, Ordering::SeqCst);
        true
    }

    /// Boundary of a confirmed region, `None` otherwise.
    pub fn area(&self) -> Option<Area> {
        if !self.is_confirmed() {
            return None;
        }
        let guard = self.area.lock().expect("region mutex poisoned");
        *guard
    }

    pub fn clear(&self) {
        let mut guard = self.area.lock().expect("region mutex poisoned");
        self.confirmed.store(false, Ordering::SeqCst);
        *guard = None;
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("confirmed", &self.is_confirmed())
            .finish()
    }
}

/// True when every region in the slice has been confirmed.
pub fn all_confirmed(regions: &[RegionRef]) -> bool {
    regions.iter().all(|region| region.is_confirmed())
}

/// Names of regions still waiting for the operator.
pub fn pending_names(regions: &[RegionRef]) -> Vec<String> {
    regions
        .iter()
        .filter(|region| !region.is_confirmed())
        .map(|region| region.name().to_string())
        .collect()
}
