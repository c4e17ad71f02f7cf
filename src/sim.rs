//! In-memory world and scripted operator for running the task end to end.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::TaskConfig;
use crate::error::{Result, TaskError, WorldError};
use crate::monitor::StarvationMonitor;
use crate::runner::TaskRunner;
use crate::types::{Area, Coord, CraftCommand, MaterialMatcher};
use crate::world::{Crafter, PickService, Placer, World, WorldQuery};

// Operator and supply pacing (small for quick CLI feedback).
const DEMO_DRAW_MS: u64 = 50;
const DEMO_RESTOCK_MS: u64 = 150;
const DEMO_STARVATION_MS: u64 = 1_000;
const DEMO_MAX_RUNTIME_MS: u64 = 20_000;
// Polling interval for the demo's helper threads.
const DEMO_POLL_MS: u64 = 10;
// Side length of each scripted region.
const REGION_SIDE: i32 = 5;

struct Pile {
    at: Coord,
    item: String,
    quantity: u32,
}

struct RecipeInput {
    matcher: MaterialMatcher,
    quantity: u32,
    // None when the source region has no known area; nothing can be taken.
    source: Option<Area>,
}

impl RecipeInput {
    fn draws_from(&self, pile: &Pile) -> bool {
        self.source.is_some_and(|area| area.contains(pile.at)) && self.matcher.matches(&pile.item)
    }
}

/// Item piles on a tile grid, with recipes resolved from a task definition.
pub struct SimWorld {
    piles: Mutex<Vec<Pile>>,
    keymap: BTreeMap<String, String>,
    consumes: HashMap<String, Vec<RecipeInput>>,
    placed: Mutex<Vec<(String, Area)>>,
    keys_sent: Mutex<Vec<String>>,
}

impl SimWorld {
    /// Resolve recipe sources against `areas`, keyed by region name.
    pub fn from_config(config: &TaskConfig, areas: &HashMap<String, Area>) -> Self {
        let consumes = config
            .recipes
            .values()
            .map(|recipe| {
                let inputs = recipe
                    .ingredients
                    .iter()
                    .map(|i| RecipeInput {
                        matcher: MaterialMatcher::new(i.aliases.iter().cloned())
                            .excluding(i.exclude.iter().cloned()),
                        quantity: i.quantity,
                        source: areas.get(&i.from).copied(),
                    })
                    .collect();
                (recipe.command.clone(), inputs)
            })
            .collect();
        Self {
            piles: Mutex::new(Vec::new()),
            keymap: config.keymap.clone(),
            consumes,
            placed: Mutex::new(Vec::new()),
            keys_sent: Mutex::new(Vec::new()),
        }
    }

    pub fn add_pile(&self, at: Coord, item: &str, quantity: u32) {
        let mut guard = self.piles.lock().expect("pile mutex poisoned");
        match guard.iter_mut().find(|pile| pile.at == at && pile.item == item) {
            Some(pile) => pile.quantity += quantity,
            None => guard.push(Pile {
                at,
                item: item.to_string(),
                quantity,
            }),
        }
    }

    pub fn placed(&self) -> Vec<(String, Area)> {
        self.placed.lock().expect("placed mutex poisoned").clone()
    }

    pub fn keys_sent(&self) -> Vec<String> {
        self.keys_sent.lock().expect("keys mutex poisoned").clone()
    }

    fn take(piles: &mut [Pile], input: &RecipeInput) {
        let mut quantity = input.quantity;
        for pile in piles.iter_mut().filter(|pile| input.draws_from(pile)) {
            let taken = pile.quantity.min(quantity);
            pile.quantity -= taken;
            quantity -= taken;
            if quantity == 0 {
                break;
            }
        }
    }
}

impl WorldQuery for SimWorld {
    fn count_matching(&self, area: &Area, matcher: &MaterialMatcher) -> u32 {
        let guard = self.piles.lock().expect("pile mutex poisoned");
        guard
            .iter()
            .filter(|pile| area.contains(pile.at) && matcher.matches(&pile.item))
            .map(|pile| pile.quantity)
            .sum()
    }
}

impl Crafter for SimWorld {
    fn craft(&self, command: &CraftCommand) -> std::result::Result<(), WorldError> {
        let keys = self
            .keymap
            .get(command.id())
            .ok_or_else(|| WorldError::UnknownCommand(command.id().to_string()))?;
        let inputs = self.consumes.get(command.id()).map(Vec::as_slice).unwrap_or(&[]);

        let mut piles = self.piles.lock().expect("pile mutex poisoned");
        for input in inputs {
            let available: u32 = piles
                .iter()
                .filter(|pile| input.draws_from(pile))
                .map(|pile| pile.quantity)
                .sum();
            if available < input.quantity {
                return Err(WorldError::MissingMaterials(command.id().to_string()));
            }
        }
        for input in inputs {
            Self::take(&mut piles, input);
        }
        piles.retain(|pile| pile.quantity > 0);
        drop(piles);

        debug!("[SIM] sending keys '{keys}' for {command}");
        self.keys_sent
            .lock()
            .expect("keys mutex poisoned")
            .push(keys.clone());
        Ok(())
    }
}

impl Placer for SimWorld {
    fn move_item_into(&self, item: &str, area: &Area) -> std::result::Result<(), WorldError> {
        let mut guard = self.placed.lock().expect("placed mutex poisoned");
        let inside = guard.iter().filter(|(_, at)| at == area).count() as u64;
        if inside >= area.tiles() {
            return Err(WorldError::PlacementRejected(format!("{area} is full")));
        }
        guard.push((item.to_string(), *area));
        Ok(())
    }
}

/// Picking service that "draws" preset areas after a fixed delay.
pub struct ScriptedOperator {
    areas: HashMap<String, Area>,
    draw_time: Duration,
    pick_mode: AtomicBool,
    captures: AtomicUsize,
}

impl ScriptedOperator {
    pub fn new(areas: HashMap<String, Area>, draw_time: Duration) -> Self {
        Self {
            areas,
            draw_time,
            pick_mode: AtomicBool::new(false),
            captures: AtomicUsize::new(0),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

impl PickService for ScriptedOperator {
    fn enable_pick_mode(&self) {
        self.pick_mode.store(true, Ordering::SeqCst);
    }

    fn capture(&self, region: &str, session: &CancelToken) -> Option<Area> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        session.sleep(self.draw_time).ok()?;
        self.pick_mode.store(false, Ordering::SeqCst);
        self.areas.get(region).copied()
    }
}

/// Lay the task's regions out side by side, ten tiles apart.
fn scripted_areas(config: &TaskConfig) -> HashMap<String, Area> {
    config
        .regions
        .iter()
        .enumerate()
        .map(|(index, region)| {
            let x = index as i32 * 10;
            let area = Area::from_corners(
                Coord::new(x, 0),
                Coord::new(x + REGION_SIDE - 1, REGION_SIDE - 1),
            );
            (region.name.clone(), area)
        })
        .collect()
}

/// (tile, item, quantity) restocked for every ingredient of every recipe.
fn supply_plan(config: &TaskConfig, areas: &HashMap<String, Area>) -> Vec<(Coord, String, u32)> {
    config
        .recipes
        .values()
        .flat_map(|recipe| recipe.ingredients.iter())
        .filter_map(|ingredient| {
            let area = areas.get(&ingredient.from)?;
            let item = ingredient.aliases.first()?;
            Some((area.min, item.clone(), ingredient.quantity))
        })
        .collect()
}

/// Warn once per shortage that outlasts `timeout`; yields the warning count.
fn spawn_starvation_watcher(
    monitor: Arc<StarvationMonitor>,
    stop_flag: Arc<AtomicBool>,
    timeout: Duration,
    poll: Duration,
) -> thread::JoinHandle<usize> {
    thread::Builder::new()
        .name("starvation-watcher".to_string())
        .spawn(move || {
            let mut reported: HashSet<(String, String)> = HashSet::new();
            let mut warnings = 0;
            while !stop_flag.load(Ordering::SeqCst) {
                let starved = monitor.starved(timeout);
                for (runner, wait) in &starved {
                    if reported.insert((runner.clone(), wait.missing.clone())) {
                        warnings += 1;
                        warn!(
                            "[MONITOR] {runner} waiting {}ms for {} in {} (have {})",
                            wait.since.elapsed().as_millis(),
                            wait.missing,
                            wait.region,
                            wait.available
                        );
                    }
                }
                reported.retain(|(runner, missing)| {
                    starved
                        .iter()
                        .any(|(r, wait)| r == runner && &wait.missing == missing)
                });
                thread::sleep(poll);
            }
            warnings
        })
        .expect("failed to spawn starvation watcher")
}

/// Run the task against the simulated world until `cycles` cycles complete.
pub fn run_demo(config: &TaskConfig, cycles: u64) -> Result<()> {
    run_demo_within(config, cycles, Duration::from_millis(DEMO_MAX_RUNTIME_MS))
}

/// Like `run_demo`, but fails with `Incomplete` if `deadline` passes first.
fn run_demo_within(config: &TaskConfig, cycles: u64, deadline: Duration) -> Result<()> {
    let plan = config.plan()?;
    info!("[DEMO] start task={} cycles={cycles}", plan.name);

    let areas = scripted_areas(config);
    let supplies = supply_plan(config, &areas);
    let world = Arc::new(SimWorld::from_config(config, &areas));
    // Start two short of every recipe so the first cycle has to wait.
    for (at, item, quantity) in &supplies {
        world.add_pile(*at, item, quantity.saturating_sub(2));
    }

    let operator = Arc::new(ScriptedOperator::new(
        areas,
        Duration::from_millis(DEMO_DRAW_MS),
    ));
    let monitor = Arc::new(StarvationMonitor::new());
    let runner = Arc::new(
        TaskRunner::new(
            plan,
            operator.clone(),
            config.setup_poll(),
            World::new(world.clone()),
        )
        .with_retry(config.retry.clone())
        .with_monitor(Arc::clone(&monitor)),
    );
    let stop_flag = Arc::new(AtomicBool::new(false));
    let poll = Duration::from_millis(DEMO_POLL_MS);

    let runner_thread = {
        let runner = Arc::clone(&runner);
        thread::Builder::new()
            .name("task-runner".to_string())
            .spawn(move || runner.run())
            .expect("failed to spawn task runner")
    };

    let operator_thread = {
        let panel = runner.panel();
        let stop_flag = Arc::clone(&stop_flag);
        thread::Builder::new()
            .name("operator".to_string())
            .spawn(move || {
                let mut labels = Vec::new();
                while labels.is_empty() && !stop_flag.load(Ordering::SeqCst) {
                    labels = panel.labels();
                    thread::sleep(poll);
                }
                // Draw the material regions before the build site.
                for (index, label) in labels.iter().rev().enumerate() {
                    panel.press(label);
                    if index == 0 {
                        // Impatient double click while the first capture runs.
                        panel.press(label);
                    }
                    while panel.is_busy() && !stop_flag.load(Ordering::SeqCst) {
                        thread::sleep(poll);
                    }
                }
            })
            .expect("failed to spawn operator")
    };

    let supplier_thread = {
        let world = Arc::clone(&world);
        let stop_flag = Arc::clone(&stop_flag);
        thread::Builder::new()
            .name("supplier".to_string())
            .spawn(move || {
                let interval = Duration::from_millis(DEMO_RESTOCK_MS);
                let mut last = Instant::now();
                while !stop_flag.load(Ordering::SeqCst) {
                    if last.elapsed() >= interval {
                        for (at, item, quantity) in &supplies {
                            world.add_pile(*at, item, *quantity);
                        }
                        debug!("[SIM] restocked {} pile(s)", supplies.len());
                        last = Instant::now();
                    }
                    thread::sleep(poll);
                }
            })
            .expect("failed to spawn supplier")
    };

    let watcher_thread = spawn_starvation_watcher(
        Arc::clone(&monitor),
        Arc::clone(&stop_flag),
        Duration::from_millis(DEMO_STARVATION_MS),
        Duration::from_millis(DEMO_STARVATION_MS / 4),
    );

    let start = Instant::now();
    while runner.summary().cycles < cycles && !runner_thread.is_finished() {
        if start.elapsed() >= deadline {
            warn!("[DEMO] giving up after {}ms", deadline.as_millis());
            break;
        }
        thread::sleep(poll);
    }
    runner.cancel_token().cancel();
    let outcome = runner_thread.join().expect("task runner thread panicked");

    stop_flag.store(true, Ordering::SeqCst);
    operator_thread.join().expect("operator thread panicked");
    supplier_thread.join().expect("supplier thread panicked");
    let starvation_warnings = watcher_thread.join().expect("starvation watcher panicked");
    runner.setup().join_workers();

    let summary = outcome?;
    let completed = summary.cycles >= cycles;
    let confirmed_after = runner
        .regions()
        .iter()
        .filter(|region| region.is_confirmed())
        .count();
    info!("[DEMO] finished in {}ms", start.elapsed().as_millis());

    println!("DEMO SUMMARY");
    println!("task={}", runner.name());
    println!("completed={completed}");
    println!("cycles_completed={}", summary.cycles);
    println!("steps_completed={}", summary.steps_completed);
    println!("steps_skipped={}", summary.steps_skipped);
    println!("structures_placed={}", world.placed().len());
    println!("keys_sent={:?}", world.keys_sent().first());
    println!("captures_started={}", operator.captures());
    println!("duplicate_requests_ignored={}", runner.panel().ignored_presses());
    println!("starvation_warnings={starvation_warnings}");
    println!("final_state={}", runner.state());
    println!("regions_confirmed_after_terminate={confirmed_after}");

    if !completed {
        return Err(TaskError::Incomplete {
            completed: summary.cycles,
            requested: cycles,
        });
    }
    Ok(())
}
