//! Interactive region acquisition before a task starts running.
//!
//! Each `request_region` launches at most one capture worker at a time. The
//! worker writes the region once and wakes anyone blocked in
//! `await_all_regions`. `reset` retires the current capture session so that a
//! worker still drawing when the task ends can never confirm a region later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::regions::{all_confirmed, pending_names};
use crate::types::{Area, RegionRef};
use crate::world::PickService;

/// Default interval between cancellation checks while waiting for regions.
pub const DEFAULT_SETUP_POLL: Duration = Duration::from_millis(100);

struct SessionState {
    // Cancelled and replaced on every reset.
    token: CancelToken,
    resets: u64,
}

struct SetupShared {
    selecting: AtomicBool,
    session: Mutex<SessionState>,
    changed: Condvar,
}

impl SetupShared {
    fn finish_capture(&self, region: &RegionRef, session: &CancelToken, area: Option<Area>) {
        let _guard = self.session.lock().expect("setup mutex poisoned");
        if session.is_cancelled() {
            debug!("[SETUP] discarding capture for {} from retired session", region.name());
            return;
        }
        match area {
            Some(area) => {
                if region.confirm(area) {
                    info!("[SETUP] region {} confirmed at {area}", region.name());
                }
            }
            None => info!("[SETUP] selection for {} abandoned", region.name()),
        }
        self.selecting.store(false, Ordering::SeqCst);
        self.changed.notify_all();
    }
}

/// Coordinates operator-driven region capture for one task instance.
pub struct SetupCoordinator {
    shared: Arc<SetupShared>,
    picker: Arc<dyn PickService>,
    poll_interval: Duration,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SetupCoordinator {
    pub fn with_poll_interval(picker: Arc<dyn PickService>, poll_interval: Duration) -> Self {
        Self {
            shared: Arc::new(SetupShared {
                selecting: AtomicBool::new(false),
                session: Mutex::new(SessionState {
                    token: CancelToken::new(),
                    resets: 0,
                }),
                changed: Condvar::new(),
            }),
            picker,
            poll_interval,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Whether a capture worker currently owns the picking surface.
    pub fn is_selecting(&self) -> bool {
        self.shared.selecting.load(Ordering::SeqCst)
    }

    /// Number of resets performed on this coordinator.
    pub fn resets(&self) -> u64 {
        let guard = self.shared.session.lock().expect("setup mutex poisoned");
        guard.resets
    }

    /// Start an interactive capture for `region`.
    ///
    /// Returns false without side effects when another capture is in progress
    /// or the region is already confirmed.
    pub fn request_region(&self, region: &RegionRef) -> bool {
        let session = {
            let guard = self.shared.session.lock().expect("setup mutex poisoned");
            if region.is_confirmed() {
                debug!("[SETUP] {} already confirmed, request ignored", region.name());
                return false;
            }
            if self
                .shared
                .selecting
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("[SETUP] selection in progress, request for {} ignored", region.name());
                return false;
            }
            guard.token.clone()
        };

        self.picker.enable_pick_mode();
        let shared = Arc::clone(&self.shared);
        let picker = Arc::clone(&self.picker);
        let target = Arc::clone(region);
        let spawned = thread::Builder::new()
            .name(format!("area-selector-{}", region.name()))
            .spawn(move || {
                let area = picker.capture(target.name(), &session);
                shared.finish_capture(&target, &session, area);
            });

        match spawned {
            Ok(handle) => {
                let mut workers = self.workers.lock().expect("worker list poisoned");
                reap_finished(&mut workers);
                workers.push(handle);
                info!("[SETUP] capture started for {}", region.name());
                true
            }
            Err(err) => {
                warn!("[SETUP] failed to spawn capture worker for {}: {err}", region.name());
                self.shared.selecting.store(false, Ordering::SeqCst);
                false
            }
        }
    }

    /// Block until every region is confirmed or `cancel` fires.
    pub fn await_all_regions(&self, regions: &[RegionRef], cancel: &CancelToken) -> Result<()> {
        let mut guard = self.shared.session.lock().expect("setup mutex poisoned");
        let mut last_pending = Vec::new();
        loop {
            if all_confirmed(regions) {
                return Ok(());
            }
            cancel.checkpoint()?;
            let pending = pending_names(regions);
            if pending != last_pending {
                debug!("[SETUP] waiting for regions: {}", pending.join(", "));
                last_pending = pending;
            }
            // Capture workers notify under this lock, so no confirmation is missed.
            let (next, _) = self
                .shared
                .changed
                .wait_timeout(guard, self.poll_interval)
                .expect("condvar wait failed");
            guard = next;
        }
    }

    /// Clear all regions and retire in-flight captures.
    pub fn reset(&self, regions: &[RegionRef]) {
        {
            let mut guard = self.shared.session.lock().expect("setup mutex poisoned");
            guard.token.cancel();
            guard.token = CancelToken::new();
            guard.resets += 1;
            for region in regions {
                region.clear();
            }
            self.shared.selecting.store(false, Ordering::SeqCst);
            self.shared.changed.notify_all();
        }
        let mut workers = self.workers.lock().expect("worker list poisoned");
        reap_finished(&mut workers);
        info!(
            "[SETUP] reset {} region(s), {} capture worker(s) still unwinding",
            regions.len(),
            workers.len()
        );
    }

    /// Wait for retired capture workers to exit.
    ///
    /// Only meaningful after `reset`; a worker whose picker ignores
    /// cancellation keeps this blocked.
    pub fn join_workers(&self) {
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().expect("worker list poisoned");
            workers.drain(..).collect()
        };
        for handle in handles {
            if handle.join().is_err() {
                warn!("[SETUP] capture worker panicked");
            }
        }
    }
}

fn reap_finished(workers: &mut Vec<thread::JoinHandle<()>>) {
    let mut index = 0;
    while index < workers.len() {
        if workers[index].is_finished() {
            let handle = workers.swap_remove(index);
            if handle.join().is_err() {
                warn!("[SETUP] capture worker panicked");
            }
        } else {
            index += 1;
        }
    }
}
