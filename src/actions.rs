//! Gather → craft → place steps executed by the task runner.

use std::fmt;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::RetryPolicy;
use crate::error::{Result, TaskError};
use crate::monitor::{MaterialWait, StarvationMonitor};
use crate::types::{Area, CraftSpec, Ingredient, RegionRef};
use crate::world::World;

/// Phase of a single step execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepPhase {
    Gather,
    Craft,
    Place,
    Done,
}

/// How a step execution ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Retry ceiling reached; the step is skipped for this cycle.
    Skipped { phase: StepPhase, attempts: u32 },
}

/// Borrowed runtime context for one step execution.
pub struct StepContext<'a> {
    pub world: &'a World,
    pub cancel: &'a CancelToken,
    pub retry: &'a RetryPolicy,
    /// Receives shortages while the step waits for materials.
    pub monitor: Option<&'a StarvationMonitor>,
    /// Name the runner is tracked under in `monitor`.
    pub task: &'a str,
}

impl StepContext<'_> {
    fn report_shortage(&self, step: &ActionStep, ingredient: &Ingredient, available: u32) {
        if let Some(monitor) = self.monitor {
            monitor.waiting(
                self.task,
                MaterialWait {
                    step: step.to_string(),
                    missing: describe(ingredient),
                    region: ingredient.source.name().to_string(),
                    available,
                    since: Instant::now(),
                },
            );
        }
    }

    fn report_resumed(&self) {
        if let Some(monitor) = self.monitor {
            monitor.resumed(self.task);
        }
    }
}

/// One unit of work in the repeating cycle.
#[derive(Clone, Debug)]
pub enum ActionStep {
    /// Gather ingredients, craft the item, and store it in `output`.
    Craft { spec: CraftSpec, output: RegionRef },
    /// Gather ingredients and erect `structure` inside `site`.
    Build {
        spec: CraftSpec,
        site: RegionRef,
        structure: String,
    },
}

enum Gathered {
    Ready,
    Exhausted(u32),
}

impl ActionStep {
    pub fn spec(&self) -> &CraftSpec {
        match self {
            ActionStep::Craft { spec, .. } | ActionStep::Build { spec, .. } => spec,
        }
    }

    /// Region the result is placed into.
    pub fn destination(&self) -> &RegionRef {
        match self {
            ActionStep::Craft { output, .. } => output,
            ActionStep::Build { site, .. } => site,
        }
    }

    /// Every region this step reads.
    pub fn regions(&self) -> Vec<RegionRef> {
        let mut regions: Vec<RegionRef> = self
            .spec()
            .ingredients
            .iter()
            .map(|ingredient| ingredient.source.clone())
            .collect();
        regions.push(self.destination().clone());
        regions
    }

    fn placed_item(&self) -> &str {
        match self {
            ActionStep::Craft { spec, .. } => &spec.name,
            ActionStep::Build { structure, .. } => structure,
        }
    }

    /// Run gather, craft, and place once.
    ///
    /// Cancellation is honoured between phases and while waiting for
    /// materials; a collaborator call already in progress always finishes.
    pub fn execute(&self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let mut phase = StepPhase::Gather;
        let mut failures = 0u32;
        loop {
            ctx.cancel.checkpoint()?;
            phase = match phase {
                StepPhase::Gather => match self.gather(ctx)? {
                    Gathered::Ready => StepPhase::Craft,
                    Gathered::Exhausted(attempts) => {
                        warn!("[STEP] {self}: still short after {attempts} checks, skipping");
                        return Ok(StepOutcome::Skipped {
                            phase: StepPhase::Gather,
                            attempts,
                        });
                    }
                },
                StepPhase::Craft => match ctx.world.crafter.craft(&self.spec().command) {
                    Ok(()) => {
                        debug!("[STEP] {self}: crafted via {}", self.spec().command);
                        StepPhase::Place
                    }
                    Err(err) => {
                        failures += 1;
                        warn!("[STEP] {self}: craft failed ({err}), attempt {failures}");
                        if ctx.retry.exhausted(failures) {
                            return Ok(StepOutcome::Skipped {
                                phase: StepPhase::Craft,
                                attempts: failures,
                            });
                        }
                        ctx.cancel.sleep(ctx.retry.delay(failures))?;
                        StepPhase::Gather
                    }
                },
                StepPhase::Place => {
                    let area = confirmed_area(self.destination())?;
                    match ctx.world.placer.move_item_into(self.placed_item(), &area) {
                        Ok(()) => StepPhase::Done,
                        Err(err) => {
                            failures += 1;
                            warn!("[STEP] {self}: placement failed ({err}), attempt {failures}");
                            if ctx.retry.exhausted(failures) {
                                return Ok(StepOutcome::Skipped {
                                    phase: StepPhase::Place,
                                    attempts: failures,
                                });
                            }
                            ctx.cancel.sleep(ctx.retry.delay(failures))?;
                            // The crafted item is still in hand.
                            StepPhase::Place
                        }
                    }
                }
                StepPhase::Done => {
                    info!("[STEP] {self}: placed into {}", self.destination().name());
                    return Ok(StepOutcome::Completed);
                }
            };
        }
    }

    fn gather(&self, ctx: &StepContext<'_>) -> Result<Gathered> {
        let mut checks = 0u32;
        // Counts go stale during a wait, so every pass re-reads all ingredients.
        'pass: loop {
            for ingredient in &self.spec().ingredients {
                let area = confirmed_area(&ingredient.source)?;
                let available = ctx.world.query.count_matching(&area, &ingredient.matcher);
                if available >= ingredient.quantity {
                    continue;
                }
                checks += 1;
                if checks == 1 {
                    info!(
                        "[STEP] {self}: waiting for {} in {} (have {available})",
                        describe(ingredient),
                        ingredient.source.name()
                    );
                }
                ctx.report_shortage(self, ingredient, available);
                if ctx.retry.exhausted(checks) {
                    ctx.report_resumed();
                    return Ok(Gathered::Exhausted(checks));
                }
                ctx.cancel.sleep(ctx.retry.delay(checks))?;
                continue 'pass;
            }
            if checks > 0 {
                ctx.report_resumed();
            }
            debug!("[STEP] {self}: all ingredients ready after {checks} wait(s)");
            return Ok(Gathered::Ready);
        }
    }
}

impl fmt::Display for ActionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionStep::Craft { spec, .. } => write!(f, "craft {}", spec.name),
            ActionStep::Build { structure, .. } => write!(f, "build {structure}"),
        }
    }
}

// An unconfirmed region here means setup was reset underneath the step.
fn confirmed_area(region: &RegionRef) -> Result<Area> {
    region.area().ok_or(TaskError::Cancelled)
}

fn describe(ingredient: &Ingredient) -> String {
    format!("{}x {}", ingredient.quantity, ingredient.matcher)
}
