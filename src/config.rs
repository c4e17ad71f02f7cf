//! Task definition loaded from YAML, plus the material retry policy.
//!
//! A task file names the operator regions, the recipes, and the ordered steps
//! of one cycle. Unknown fields are ignored. `TaskConfig::barrels` is the
//! built-in preset: build barrels from five boards each.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::actions::ActionStep;
use crate::error::{Result, TaskError};
use crate::regions::Region;
use crate::runner::{RegionBinding, TaskPlan};
use crate::setup::DEFAULT_SETUP_POLL;
use crate::types::{CraftCommand, CraftSpec, Ingredient, MaterialMatcher, RegionRef};

/// Growth of the wait between material rechecks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    #[default]
    Fixed,
    Exponential,
}

/// How long to wait between rechecks and when to give up on a step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Base wait between rechecks.
    pub poll_interval_ms: u64,
    pub backoff: Backoff,
    /// Cap for exponential backoff.
    pub max_interval_ms: u64,
    /// Checks before the step is skipped for the current cycle; unbounded if unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            backoff: Backoff::Fixed,
            max_interval_ms: 5_000,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Wait before the next check, after `attempt` failed checks (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.poll_interval_ms.max(1);
        let millis = match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
                    .min(self.max_interval_ms.max(base))
            }
        };
        Duration::from_millis(millis)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

/// Operator-drawn region and the label of its control.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSpec {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngredientSpec {
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// Source region name.
    pub from: String,
    pub quantity: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeSpec {
    pub command: String,
    pub name: String,
    pub ingredients: Vec<IngredientSpec>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSpec {
    Craft { recipe: String, into: String },
    Build {
        recipe: String,
        site: String,
        structure: String,
    },
}

/// Contents of a task definition file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub name: String,
    /// Interval between cancellation checks while waiting for the operator.
    pub setup_poll_ms: u64,
    pub retry: RetryPolicy,
    pub regions: Vec<RegionSpec>,
    pub recipes: BTreeMap<String, RecipeSpec>,
    pub steps: Vec<StepSpec>,
    /// Command id to crafting-menu key sequence.
    pub keymap: BTreeMap<String, String>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            name: "task".to_string(),
            setup_poll_ms: DEFAULT_SETUP_POLL.as_millis() as u64,
            retry: RetryPolicy::default(),
            regions: Vec::new(),
            recipes: BTreeMap::new(),
            steps: Vec::new(),
            keymap: BTreeMap::new(),
        }
    }
}

impl TaskConfig {
    /// Built-in barrel building task.
    pub fn barrels() -> Self {
        let mut recipes = BTreeMap::new();
        recipes.insert(
            "barrel".to_string(),
            RecipeSpec {
                command: "barrel".to_string(),
                name: "Barrel".to_string(),
                ingredients: vec![IngredientSpec {
                    aliases: vec!["board".to_string()],
                    exclude: Vec::new(),
                    from: "board_area".to_string(),
                    quantity: 5,
                }],
            },
        );
        let mut keymap = BTreeMap::new();
        keymap.insert("barrel".to_string(), "bcb".to_string());

        Self {
            name: "barrels".to_string(),
            regions: vec![
                RegionSpec {
                    name: "build_area".to_string(),
                    label: Some("Build area".to_string()),
                },
                RegionSpec {
                    name: "board_area".to_string(),
                    label: Some("Boards".to_string()),
                },
            ],
            recipes,
            steps: vec![StepSpec::Build {
                recipe: "barrel".to_string(),
                site: "build_area".to_string(),
                structure: "barrel".to_string(),
            }],
            keymap,
            ..Self::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TaskError::Config(format!("failed to read task file '{}': {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TaskConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TaskError::Config(format!("failed to parse task YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| TaskError::Config(format!("failed to serialize task to YAML: {}", e)))
    }

    pub fn setup_poll(&self) -> Duration {
        Duration::from_millis(self.setup_poll_ms.max(1))
    }

    /// Check names and quantities before anything runs.
    pub fn validate(&self) -> Result<()> {
        if self.retry.poll_interval_ms == 0 {
            return Err(invalid("retry.poll_interval_ms must be greater than 0"));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(invalid("retry.max_attempts must be greater than 0"));
        }
        if self.steps.is_empty() {
            return Err(invalid("at least one step is required"));
        }

        let mut names = HashSet::new();
        let mut labels = HashSet::new();
        for region in &self.regions {
            if region.name.trim().is_empty() {
                return Err(invalid("region names must be non-empty"));
            }
            if !names.insert(region.name.as_str()) {
                return Err(invalid(&format!("duplicate region '{}'", region.name)));
            }
            // Each control must reach exactly one region.
            let label = region.label.as_deref().unwrap_or(&region.name);
            if !labels.insert(label) {
                return Err(invalid(&format!(
                    "region '{}' reuses control label '{label}'",
                    region.name
                )));
            }
        }

        for (id, recipe) in &self.recipes {
            if recipe.command.trim().is_empty() {
                return Err(invalid(&format!("recipe '{id}' has an empty command")));
            }
            for ingredient in &recipe.ingredients {
                if ingredient.quantity == 0 {
                    return Err(invalid(&format!(
                        "recipe '{id}' requires a quantity greater than 0"
                    )));
                }
                if ingredient.aliases.is_empty() {
                    return Err(invalid(&format!(
                        "recipe '{id}' has an ingredient without aliases"
                    )));
                }
                if !names.contains(ingredient.from.as_str()) {
                    return Err(invalid(&format!(
                        "recipe '{id}' draws from unknown region '{}'",
                        ingredient.from
                    )));
                }
            }
        }

        for step in &self.steps {
            let (recipe, destination) = match step {
                StepSpec::Craft { recipe, into } => (recipe, into),
                StepSpec::Build { recipe, site, .. } => (recipe, site),
            };
            if !self.recipes.contains_key(recipe) {
                return Err(invalid(&format!("step uses unknown recipe '{recipe}'")));
            }
            if !names.contains(destination.as_str()) {
                return Err(invalid(&format!(
                    "step places into unknown region '{destination}'"
                )));
            }
        }

        for (command, keys) in &self.keymap {
            if keys.is_empty() {
                return Err(invalid(&format!("keymap entry '{command}' is empty")));
            }
        }
        Ok(())
    }

    /// Validate and build fresh regions and steps for one task instance.
    pub fn plan(&self) -> Result<TaskPlan> {
        self.validate()?;

        let regions: Vec<RegionBinding> = self
            .regions
            .iter()
            .map(|spec| RegionBinding {
                label: spec.label.clone().unwrap_or_else(|| spec.name.clone()),
                region: Region::shared(spec.name.clone()),
            })
            .collect();
        let by_name: HashMap<String, RegionRef> = regions
            .iter()
            .map(|binding| (binding.region.name().to_string(), binding.region.clone()))
            .collect();
        // validate() guarantees every lookup below succeeds.
        let lookup = |name: &str| -> Result<RegionRef> {
            by_name
                .get(name)
                .cloned()
                .ok_or_else(|| invalid(&format!("unknown region '{name}'")))
        };

        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let recipe_id = match step {
                StepSpec::Craft { recipe, .. } | StepSpec::Build { recipe, .. } => recipe,
            };
            let recipe = self
                .recipes
                .get(recipe_id)
                .ok_or_else(|| invalid(&format!("unknown recipe '{recipe_id}'")))?;
            let spec = craft_spec(recipe, &lookup)?;
            steps.push(match step {
                StepSpec::Craft { into, .. } => ActionStep::Craft {
                    spec,
                    output: lookup(into)?,
                },
                StepSpec::Build {
                    site, structure, ..
                } => ActionStep::Build {
                    spec,
                    site: lookup(site)?,
                    structure: structure.clone(),
                },
            });
        }

        Ok(TaskPlan {
            name: self.name.clone(),
            regions,
            steps,
        })
    }
}

fn craft_spec(
    recipe: &RecipeSpec,
    lookup: &dyn Fn(&str) -> Result<RegionRef>,
) -> Result<CraftSpec> {
    let ingredients = recipe
        .ingredients
        .iter()
        .map(|spec| {
            Ok(Ingredient::new(
                MaterialMatcher::new(spec.aliases.iter().cloned())
                    .excluding(spec.exclude.iter().cloned()),
                lookup(&spec.from)?,
                spec.quantity,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CraftSpec {
        command: CraftCommand::new(recipe.command.clone()),
        name: recipe.name.clone(),
        ingredients,
    })
}

fn invalid(message: &str) -> TaskError {
    TaskError::Config(format!("validation failed: {message}"))
}
