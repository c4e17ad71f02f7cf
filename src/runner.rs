//! Task lifecycle: interactive setup, then the endless step cycle.
//!
//! `Unconfigured -> AwaitingSetup -> Running -> Terminated`. The runner
//! publishes one panel control per region, waits for the operator to draw them
//! all, and then repeats its steps in declaration order until cancelled.
//! `Terminated` is final; a new runner is needed to start again.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info};

use crate::actions::{ActionStep, StepContext, StepOutcome};
use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::{Result, TaskError};
use crate::monitor::StarvationMonitor;
use crate::panel::ControlPanel;
use crate::regions::pending_names;
use crate::setup::SetupCoordinator;
use crate::types::{RegionRef, TaskState};
use crate::world::{PickService, World};

/// Region exposed to the operator under a control label.
#[derive(Clone, Debug)]
pub struct RegionBinding {
    pub label: String,
    pub region: RegionRef,
}

/// Regions and steps for one task instance.
#[derive(Clone, Debug)]
pub struct TaskPlan {
    pub name: String,
    pub regions: Vec<RegionBinding>,
    pub steps: Vec<ActionStep>,
}

/// Counters reported when a runner stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub steps_completed: u64,
    pub steps_skipped: u64,
}

pub struct TaskRunner {
    name: String,
    bindings: Vec<RegionBinding>,
    regions: Vec<RegionRef>,
    steps: Vec<ActionStep>,
    setup: Arc<SetupCoordinator>,
    panel: Arc<ControlPanel>,
    world: World,
    retry: RetryPolicy,
    monitor: Option<Arc<StarvationMonitor>>,
    cancel: CancelToken,
    state: Mutex<TaskState>,
    cycles: AtomicU64,
    steps_completed: AtomicU64,
    steps_skipped: AtomicU64,
}

impl TaskRunner {
    /// Build a runner with its own setup coordinator over `picker`.
    ///
    /// `setup_poll` bounds how long a cancelled setup wait takes to notice.
    pub fn new(
        plan: TaskPlan,
        picker: Arc<dyn PickService>,
        setup_poll: Duration,
        world: World,
    ) -> Self {
        let mut bindings: Vec<RegionBinding> = Vec::new();
        let declared = plan.regions.into_iter().map(|b| (b.label, b.region));
        // Any region a step touches must be drawn before the loop starts.
        let referenced = plan
            .steps
            .iter()
            .flat_map(ActionStep::regions)
            .map(|region| (region.name().to_string(), region));
        for (label, region) in declared.chain(referenced) {
            if bindings.iter().any(|b| Arc::ptr_eq(&b.region, &region)) {
                continue;
            }
            let label = unique_label(&bindings, &label);
            bindings.push(RegionBinding { label, region });
        }
        let regions = bindings.iter().map(|b| b.region.clone()).collect();
        let setup = Arc::new(SetupCoordinator::with_poll_interval(picker, setup_poll));
        let panel = Arc::new(ControlPanel::new(Arc::clone(&setup)));

        Self {
            name: plan.name,
            bindings,
            regions,
            steps: plan.steps,
            setup,
            panel,
            world,
            retry: RetryPolicy::default(),
            monitor: None,
            cancel: CancelToken::new(),
            state: Mutex::new(TaskState::Unconfigured),
            cycles: AtomicU64::new(0),
            steps_completed: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<StarvationMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().expect("runner state poisoned")
    }

    /// Operator controls for this task.
    pub fn panel(&self) -> Arc<ControlPanel> {
        Arc::clone(&self.panel)
    }

    /// Handle that stops the runner at its next checkpoint.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Region capture for this runner only.
    pub fn setup(&self) -> &SetupCoordinator {
        &self.setup
    }

    pub fn regions(&self) -> &[RegionRef] {
        &self.regions
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            cycles: self.cycles.load(Ordering::SeqCst),
            steps_completed: self.steps_completed.load(Ordering::SeqCst),
            steps_skipped: self.steps_skipped.load(Ordering::SeqCst),
        }
    }

    /// Publish the region controls and block until the operator drew them all.
    pub fn initialize(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("runner state poisoned");
            if *state != TaskState::Unconfigured {
                return Err(TaskError::InvalidState {
                    operation: "initialize",
                    state: *state,
                });
            }
            *state = TaskState::AwaitingSetup;
        }

        self.panel.publish(
            self.bindings
                .iter()
                .map(|binding| (binding.label.clone(), binding.region.clone())),
        );
        self.panel
            .set_status(format!("select: {}", pending_names(&self.regions).join(", ")));
        info!(
            "[TASK] {} awaiting {} region(s): {}",
            self.name,
            self.regions.len(),
            self.panel.labels().join(", ")
        );

        if let Err(err) = self.setup.await_all_regions(&self.regions, &self.cancel) {
            self.terminate();
            return Err(err);
        }

        {
            let mut state = self.state.lock().expect("runner state poisoned");
            if *state != TaskState::AwaitingSetup {
                return Err(TaskError::Cancelled);
            }
            *state = TaskState::Running;
        }
        self.panel.set_status("running");
        if let Some(monitor) = &self.monitor {
            monitor.track(&self.name);
        }
        info!("[TASK] {} setup complete, running", self.name);
        Ok(())
    }

    /// Execute every step once, in declaration order.
    pub fn run_cycle(&self) -> Result<()> {
        let state = self.state();
        if state != TaskState::Running {
            return Err(TaskError::InvalidState {
                operation: "run a cycle",
                state,
            });
        }

        let ctx = StepContext {
            world: &self.world,
            cancel: &self.cancel,
            retry: &self.retry,
            monitor: self.monitor.as_deref(),
            task: &self.name,
        };
        for (index, step) in self.steps.iter().enumerate() {
            let outcome = self
                .cancel
                .checkpoint()
                .and_then(|()| step.execute(&ctx));
            match outcome {
                Ok(StepOutcome::Completed) => {
                    self.steps_completed.fetch_add(1, Ordering::SeqCst);
                }
                Ok(StepOutcome::Skipped { phase, attempts }) => {
                    self.steps_skipped.fetch_add(1, Ordering::SeqCst);
                    debug!(
                        "[TASK] {} step {index} skipped in {phase:?} after {attempts} attempt(s)",
                        self.name
                    );
                }
                Err(err) => {
                    if err.is_cancelled() {
                        info!("[TASK] {} cancelled at step {index} ({step})", self.name);
                        self.terminate();
                    }
                    return Err(err);
                }
            }
        }

        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        info!("[TASK] {} finished cycle {cycle}", self.name);
        Ok(())
    }

    /// Set up, then cycle until cancelled.
    ///
    /// Cancellation is the normal way out and yields the run summary.
    pub fn run(&self) -> Result<RunSummary> {
        match self.drive() {
            Ok(never) => match never {},
            Err(TaskError::Cancelled) => {
                self.terminate();
                Ok(self.summary())
            }
            Err(err) => {
                self.terminate();
                Err(err)
            }
        }
    }

    fn drive(&self) -> Result<Infallible> {
        self.initialize()?;
        loop {
            self.run_cycle()?;
        }
    }

    /// Stop the task and release its regions.
    ///
    /// Returns false if the task was already terminated.
    pub fn terminate(&self) -> bool {
        self.cancel.cancel();
        {
            let mut state = self.state.lock().expect("runner state poisoned");
            if *state == TaskState::Terminated {
                return false;
            }
            *state = TaskState::Terminated;
        }
        self.setup.reset(&self.regions);
        self.panel.clear();
        self.panel.set_status("terminated");
        if let Some(monitor) = &self.monitor {
            monitor.forget(&self.name);
        }
        let summary = self.summary();
        info!(
            "[TASK] {} terminated after {} cycle(s), {} step(s) completed, {} skipped",
            self.name, summary.cycles, summary.steps_completed, summary.steps_skipped
        );
        true
    }
}

/// `base`, or `base (2)`, `base (3)`, ... if a control already uses it.
fn unique_label(bindings: &[RegionBinding], base: &str) -> String {
    let taken = |label: &str| bindings.iter().any(|b| b.label == label);
    if !taken(base) {
        return base.to_string();
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{base} ({suffix})");
        if !taken(&candidate) {
            return candidate;
        }
        suffix += 1;
    }
}

impl Drop for TaskRunner {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskConfig;
    use crate::panel::PressOutcome;
    use crate::regions::Region;
    use crate::test_support::{Call, ManualPicker, RecordingWorld, area_at};
    use crate::types::{Coord, CraftCommand, CraftSpec, Ingredient, MaterialMatcher};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    const SETUP_POLL: Duration = Duration::from_millis(10);

    struct Harness {
        picker: Arc<ManualPicker>,
        world: Arc<RecordingWorld>,
    }

    fn harness() -> Harness {
        Harness {
            picker: Arc::new(ManualPicker::new()),
            world: Arc::new(RecordingWorld::new()),
        }
    }

    fn runner_for(h: &Harness, plan: TaskPlan) -> TaskRunner {
        TaskRunner::new(plan, h.picker.clone(), SETUP_POLL, World::new(h.world.clone()))
            .with_retry(fast_retry())
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            poll_interval_ms: 5,
            ..RetryPolicy::default()
        }
    }

    fn barrel_runner(h: &Harness) -> TaskRunner {
        runner_for(h, TaskConfig::barrels().plan().expect("plan preset"))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Draw both preset regions: boards at x=10, build site at x=0.
    fn draw_regions(h: &Harness, runner: &TaskRunner) {
        let panel = runner.panel();
        wait_until(|| panel.labels().len() == 2);
        assert_eq!(panel.press("Boards"), PressOutcome::Started);
        h.picker.wait_for_capture("board_area");
        h.picker.complete("board_area", area_at(10));
        wait_until(|| !panel.is_busy());
        assert_eq!(panel.press("Build area"), PressOutcome::Started);
        h.picker.wait_for_capture("build_area");
        h.picker.complete("build_area", area_at(0));
    }

    #[test]
    fn initialize_runs_once_all_regions_are_drawn() {
        let h = harness();
        let runner = Arc::new(barrel_runner(&h));
        assert_eq!(runner.state(), TaskState::Unconfigured);

        let handle = {
            let runner = Arc::clone(&runner);
            thread::spawn(move || runner.initialize())
        };
        wait_until(|| runner.state() == TaskState::AwaitingSetup);
        draw_regions(&h, &runner);

        handle.join().expect("initialize panicked").expect("initialize failed");
        assert_eq!(runner.state(), TaskState::Running);
        assert_eq!(runner.panel().status(), "running");
        assert!(runner.regions().iter().all(|r| r.is_confirmed()));
    }

    #[test]
    fn run_cycle_requires_running_state() {
        let h = harness();
        let runner = barrel_runner(&h);
        assert_eq!(
            runner.run_cycle(),
            Err(TaskError::InvalidState {
                operation: "run a cycle",
                state: TaskState::Unconfigured
            })
        );
        assert!(h.world.calls().is_empty());
    }

    #[test]
    fn steps_run_in_declaration_order() {
        let h = harness();
        let logs = Region::shared("logs");
        let stockpile = Region::shared("stockpile");
        let spec = |command: &str, name: &str, source: &RegionRef| CraftSpec {
            command: CraftCommand::new(command),
            name: name.to_string(),
            ingredients: vec![Ingredient::new(MaterialMatcher::new(["log"]), source.clone(), 1)],
        };
        let plan = TaskPlan {
            name: "ordered".to_string(),
            regions: Vec::new(),
            steps: vec![
                ActionStep::Craft {
                    spec: spec("plank", "Plank", &logs),
                    output: stockpile.clone(),
                },
                ActionStep::Build {
                    spec: spec("crate", "Crate", &logs),
                    site: stockpile.clone(),
                    structure: "crate".to_string(),
                },
            ],
        };
        let runner = Arc::new(runner_for(&h, plan));
        // Regions referenced only by steps still get controls.
        assert_eq!(runner.regions().len(), 2);
        h.world.add_stock(Coord::new(10, 0), "log", 4);

        let handle = {
            let runner = Arc::clone(&runner);
            thread::spawn(move || runner.initialize())
        };
        let panel = runner.panel();
        wait_until(|| panel.labels() == vec!["logs", "stockpile"]);
        panel.press("logs");
        h.picker.wait_for_capture("logs");
        h.picker.complete("logs", area_at(10));
        wait_until(|| !panel.is_busy());
        panel.press("stockpile");
        h.picker.wait_for_capture("stockpile");
        h.picker.complete("stockpile", area_at(0));
        handle.join().expect("initialize panicked").expect("initialize failed");

        runner.run_cycle().expect("first cycle");
        runner.run_cycle().expect("second cycle");
        let cycle = vec![
            Call::Craft("plank".to_string()),
            Call::Place("Plank".to_string(), area_at(0)),
            Call::Craft("crate".to_string()),
            Call::Place("crate".to_string(), area_at(0)),
        ];
        assert_eq!(h.world.actions(), [cycle.clone(), cycle].concat());
        assert_eq!(
            runner.summary(),
            RunSummary {
                cycles: 2,
                steps_completed: 4,
                steps_skipped: 0
            }
        );
    }

    #[test]
    fn terminate_is_idempotent() {
        let h = harness();
        let runner = barrel_runner(&h);
        runner.regions()[0].confirm(area_at(0));

        assert!(runner.terminate());
        assert_eq!(runner.state(), TaskState::Terminated);
        assert!(!runner.regions()[0].is_confirmed());
        let resets = runner.setup().resets();

        assert!(!runner.terminate());
        assert_eq!(runner.state(), TaskState::Terminated);
        assert_eq!(runner.setup().resets(), resets);
        assert_eq!(runner.panel().status(), "terminated");
    }

    #[test]
    fn terminated_runner_cannot_be_reused() {
        let h = harness();
        let runner = barrel_runner(&h);
        runner.terminate();
        assert_eq!(
            runner.initialize(),
            Err(TaskError::InvalidState {
                operation: "initialize",
                state: TaskState::Terminated
            })
        );
        assert!(runner.run().is_err());
    }

    #[test]
    fn cancel_during_setup_terminates() {
        let h = harness();
        let runner = Arc::new(barrel_runner(&h));
        let handle = {
            let runner = Arc::clone(&runner);
            thread::spawn(move || runner.run())
        };
        wait_until(|| runner.state() == TaskState::AwaitingSetup);
        runner.cancel_token().cancel();

        let summary = handle.join().expect("run panicked").expect("run failed");
        assert_eq!(summary, RunSummary::default());
        assert_eq!(runner.state(), TaskState::Terminated);
        assert!(runner.panel().labels().is_empty());
    }

    #[test]
    fn run_loops_until_cancelled_and_waits_for_materials() {
        let h = harness();
        let monitor = Arc::new(StarvationMonitor::new());
        let runner = Arc::new(barrel_runner(&h).with_monitor(monitor.clone()));
        h.world.add_stock(Coord::new(10, 0), "board", 3);

        let (done_tx, done_rx) = mpsc::channel();
        let handle = {
            let runner = Arc::clone(&runner);
            thread::spawn(move || done_tx.send(runner.run()).expect("send summary"))
        };
        wait_until(|| runner.state() == TaskState::AwaitingSetup);
        draw_regions(&h, &runner);
        wait_until(|| runner.state() == TaskState::Running);

        // Only 3 of 5 boards: the runner keeps rechecking instead of failing.
        thread::sleep(Duration::from_millis(50));
        assert!(h.world.actions().is_empty());
        assert_eq!(runner.state(), TaskState::Running);
        let starved = monitor.starved(Duration::from_millis(20));
        assert_eq!(starved.len(), 1);
        assert_eq!(starved[0].0, "barrels");
        assert_eq!(starved[0].1.available, 3);

        h.world.add_stock(Coord::new(11, 1), "board", 2);
        wait_until(|| runner.summary().cycles >= 2);

        runner.cancel_token().cancel();
        let summary = done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("run did not stop")
            .expect("run failed");
        handle.join().expect("run thread panicked");

        assert!(summary.cycles >= 2);
        assert_eq!(runner.state(), TaskState::Terminated);
        assert!(runner.regions().iter().all(|r| !r.is_confirmed()));
        assert!(monitor.starved(Duration::ZERO).is_empty());
        let actions = h.world.actions();
        assert_eq!(actions[0], Call::Craft("barrel".to_string()));
        assert_eq!(actions[1], Call::Place("barrel".to_string(), area_at(0)));
    }

    #[test]
    fn fresh_runner_reacquires_regions_after_termination() {
        let h = harness();
        let first = Arc::new(barrel_runner(&h));
        let handle = {
            let runner = Arc::clone(&first);
            thread::spawn(move || runner.initialize())
        };
        wait_until(|| first.state() == TaskState::AwaitingSetup);
        draw_regions(&h, &first);
        handle.join().expect("initialize panicked").expect("initialize failed");
        first.terminate();

        let second = Arc::new(barrel_runner(&h));
        let handle = {
            let runner = Arc::clone(&second);
            thread::spawn(move || runner.initialize())
        };
        wait_until(|| second.state() == TaskState::AwaitingSetup);
        assert!(second.regions().iter().all(|r| !r.is_confirmed()));
        draw_regions(&h, &second);
        handle.join().expect("initialize panicked").expect("initialize failed");
        assert_eq!(second.state(), TaskState::Running);
    }

    #[test]
    fn terminating_one_runner_leaves_another_setup_alone() {
        let h = harness();
        let first = barrel_runner(&h);
        let second = Arc::new(barrel_runner(&h));
        let handle = {
            let runner = Arc::clone(&second);
            thread::spawn(move || runner.initialize())
        };
        wait_until(|| second.state() == TaskState::AwaitingSetup);
        let panel = second.panel();
        wait_until(|| panel.labels().len() == 2);
        assert_eq!(panel.press("Boards"), PressOutcome::Started);
        h.picker.wait_for_capture("board_area");

        assert!(first.terminate());
        h.picker.complete("board_area", area_at(10));
        wait_until(|| !panel.is_busy());
        let boards = second
            .regions()
            .iter()
            .find(|r| r.name() == "board_area")
            .expect("board_area region");
        assert!(boards.is_confirmed());

        assert_eq!(panel.press("Build area"), PressOutcome::Started);
        h.picker.wait_for_capture("build_area");
        h.picker.complete("build_area", area_at(0));
        handle.join().expect("initialize panicked").expect("initialize failed");
        assert_eq!(second.state(), TaskState::Running);
    }

    #[test]
    fn colliding_labels_get_distinct_controls() {
        let h = harness();
        let logs = Region::shared("logs");
        let stockpile = Region::shared("stockpile");
        let plan = TaskPlan {
            name: "labels".to_string(),
            regions: vec![RegionBinding {
                label: "stockpile".to_string(),
                region: logs.clone(),
            }],
            steps: vec![ActionStep::Craft {
                spec: CraftSpec {
                    command: CraftCommand::new("plank"),
                    name: "Plank".to_string(),
                    ingredients: vec![Ingredient::new(MaterialMatcher::new(["log"]), logs, 1)],
                },
                output: stockpile,
            }],
        };
        let runner = Arc::new(runner_for(&h, plan));
        let handle = {
            let runner = Arc::clone(&runner);
            thread::spawn(move || runner.initialize())
        };
        let panel = runner.panel();
        wait_until(|| panel.labels() == vec!["stockpile", "stockpile (2)"]);

        assert_eq!(panel.press("stockpile"), PressOutcome::Started);
        h.picker.wait_for_capture("logs");
        h.picker.complete("logs", area_at(10));
        wait_until(|| !panel.is_busy());
        assert_eq!(panel.press("stockpile (2)"), PressOutcome::Started);
        h.picker.wait_for_capture("stockpile");
        h.picker.complete("stockpile", area_at(0));

        handle.join().expect("initialize panicked").expect("initialize failed");
        assert_eq!(runner.state(), TaskState::Running);
    }
}
