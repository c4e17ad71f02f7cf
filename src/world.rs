//! Narrow interfaces to the game client consumed by the task core.

use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::error::WorldError;
use crate::types::{Area, CraftCommand, MaterialMatcher};

/// Interactive area picking on the shared map view.
pub trait PickService: Send + Sync {
    /// Switch the map into area-drawing mode.
    fn enable_pick_mode(&self);

    /// Block until the operator finishes drawing the named region.
    ///
    /// Returns `None` if the operator abandons the selection or `session` is
    /// cancelled; implementations should notice cancellation promptly.
    fn capture(&self, region: &str, session: &CancelToken) -> Option<Area>;
}

/// Live inventory queries against the world.
pub trait WorldQuery: Send + Sync {
    fn count_matching(&self, area: &Area, matcher: &MaterialMatcher) -> u32;
}

/// Crafting menu invocation.
pub trait Crafter: Send + Sync {
    fn craft(&self, command: &CraftCommand) -> Result<(), WorldError>;
}

/// Moves a crafted item or structure into an area.
pub trait Placer: Send + Sync {
    fn move_item_into(&self, item: &str, area: &Area) -> Result<(), WorldError>;
}

/// Bundle of world collaborators used by action steps.
#[derive(Clone)]
pub struct World {
    pub query: Arc<dyn WorldQuery>,
    pub crafter: Arc<dyn Crafter>,
    pub placer: Arc<dyn Placer>,
}

impl World {
    /// Use one backend for every collaborator.
    pub fn new<T>(backend: Arc<T>) -> Self
    where
        T: WorldQuery + Crafter + Placer + 'static,
    {
        Self {
            query: backend.clone(),
            crafter: backend.clone(),
            placer: backend,
        }
    }
}
