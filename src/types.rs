//! Shared geometry, material, and recipe model used across the system.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::regions::Region;

/// Shared handle to a region owned by one task instance.
pub type RegionRef = Arc<Region>;

/// Tile coordinate in world space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle of tiles, inclusive on both corners.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Area {
    pub min: Coord,
    pub max: Coord,
}

impl Area {
    /// Build an area from two opposite corners in any order.
    pub fn from_corners(a: Coord, b: Coord) -> Self {
        Self {
            min: Coord::new(a.x.min(b.x), a.y.min(b.y)),
            max: Coord::new(a.x.max(b.x), a.y.max(b.y)),
        }
    }

    pub fn contains(&self, point: Coord) -> bool {
        (self.min.x..=self.max.x).contains(&point.x) && (self.min.y..=self.max.y).contains(&point.y)
    }

    /// Number of tiles covered.
    pub fn tiles(&self) -> u64 {
        let w = (self.max.x - self.min.x) as u64 + 1;
        let h = (self.max.y - self.min.y) as u64 + 1;
        w * h
    }
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({},{})..({},{})",
            self.min.x, self.min.y, self.max.x, self.max.y
        )
    }
}

/// Accepted item names for an ingredient.
///
/// An item matches when its name contains any alias (case-insensitive) and
/// contains none of the exclusions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterialMatcher {
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

impl MaterialMatcher {
    pub fn new<I, S>(aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            aliases: aliases.into_iter().map(Into::into).collect(),
            exclude: Vec::new(),
        }
    }

    pub fn excluding<I, S>(mut self, exclude: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude = exclude.into_iter().map(Into::into).collect();
        self
    }

    pub fn matches(&self, item: &str) -> bool {
        let item = item.to_lowercase();
        let hit = |needle: &String| item.contains(&needle.to_lowercase());
        self.aliases.iter().any(hit) && !self.exclude.iter().any(hit)
    }
}

impl fmt::Display for MaterialMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.aliases.join("|"))
    }
}

/// Required quantity of a material drawn from a source region.
#[derive(Clone, Debug)]
pub struct Ingredient {
    pub matcher: MaterialMatcher,
    pub source: RegionRef,
    pub quantity: u32,
}

impl Ingredient {
    pub fn new(matcher: MaterialMatcher, source: RegionRef, quantity: u32) -> Self {
        Self {
            matcher,
            source,
            quantity,
        }
    }
}

/// Opaque crafting command, resolved to concrete input by the crafter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CraftCommand(pub String);

impl CraftCommand {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn id(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CraftCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fixed recipe descriptor for one craftable item.
#[derive(Clone, Debug)]
pub struct CraftSpec {
    pub command: CraftCommand,
    pub name: String,
    pub ingredients: Vec<Ingredient>,
}

/// Lifecycle of a task instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    Unconfigured,
    AwaitingSetup,
    Running,
    Terminated,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Unconfigured => "unconfigured",
            TaskState::AwaitingSetup => "awaiting_setup",
            TaskState::Running => "running",
            TaskState::Terminated => "terminated",
        };
        f.write_str(label)
    }
}
