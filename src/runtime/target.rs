//! Targets, sprites, scripts, and the execution-ordered target registry
//!
//! A [`Sprite`] is the shared identity (name, assets, scripts) referenced by
//! an original [`Target`] and all of its clones. Each target carries its own
//! mutable [`TargetState`]. The [`TargetRegistry`] keeps targets in execution
//! order; the scheduler walks it back to front.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use uuid::Uuid;

/// Target identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetId(pub Uuid);

impl TargetId {
    /// Create a new random TargetId
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TargetId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_SCRIPT: AtomicU64 = AtomicU64::new(1);

/// Script identifier, unique for the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptId(pub u64);

impl ScriptId {
    /// Allocate a fresh script id
    pub fn next() -> Self {
        Self(NEXT_SCRIPT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script-{}", self.0)
    }
}

/// A hat-topped script owned by a sprite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    /// Script identifier
    pub id: ScriptId,
    /// Opcode of the top-level hat
    pub hat: String,
    /// Hat field values (e.g. `BROADCAST_OPTION`), compared case-insensitively
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
    /// Body handed to the script-execution environment
    pub source: String,
}

impl Script {
    /// Create a script under the given hat
    pub fn new(hat: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: ScriptId::next(),
            hat: hat.into(),
            fields: BTreeMap::new(),
            source: source.into(),
        }
    }

    /// Add a hat field
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// The hat option (first field value), used when reporting which hat started a thread
    pub fn option(&self) -> Option<&str> {
        self.fields.values().next().map(String::as_str)
    }
}

/// Identity shared by an original target and its clones
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sprite {
    /// Sprite name
    pub name: String,
    /// Asset names (costumes, sounds); opaque to the scheduler
    #[serde(default)]
    pub assets: Vec<String>,
    /// Scripts owned by the sprite
    #[serde(default)]
    pub scripts: Vec<Script>,
}

impl Sprite {
    /// Create an empty sprite
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assets: Vec::new(),
            scripts: Vec::new(),
        }
    }

    /// Attach a script
    pub fn with_script(mut self, script: Script) -> Self {
        self.scripts.push(script);
        self
    }

    /// Look up a script by id
    pub fn script(&self, id: ScriptId) -> Option<&Script> {
        self.scripts.iter().find(|script| script.id == id)
    }
}

/// Per-instance mutable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetState {
    /// Horizontal position
    pub x: f64,
    /// Vertical position
    pub y: f64,
    /// Heading in degrees, 90 = right
    pub direction: f64,
    /// Visibility
    pub visible: bool,
    /// Custom per-target state stored by primitives
    #[serde(default)]
    pub custom: serde_json::Map<String, Value>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            direction: 90.0,
            visible: true,
            custom: serde_json::Map::new(),
        }
    }
}

/// A sprite instance or clone
pub struct Target {
    id: TargetId,
    sprite: Arc<Sprite>,
    is_original: bool,
    is_stage: bool,
    state: Mutex<TargetState>,
    edge_values: Mutex<HashMap<ScriptId, bool>>,
    disposed: AtomicBool,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("id", &self.id)
            .field("sprite", &self.sprite.name)
            .field("is_original", &self.is_original)
            .field("is_stage", &self.is_stage)
            .finish()
    }
}

impl Target {
    /// Create an original sprite target
    pub fn new(sprite: Arc<Sprite>) -> Self {
        Self::build(sprite, true, false, TargetState::default())
    }

    /// Create the stage target
    pub fn new_stage(sprite: Arc<Sprite>) -> Self {
        Self::build(sprite, true, true, TargetState::default())
    }

    fn build(sprite: Arc<Sprite>, is_original: bool, is_stage: bool, state: TargetState) -> Self {
        Self {
            id: TargetId::new(),
            sprite,
            is_original,
            is_stage,
            state: Mutex::new(state),
            edge_values: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Target id
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// Shared sprite identity
    pub fn sprite(&self) -> &Arc<Sprite> {
        &self.sprite
    }

    /// Sprite name
    pub fn name(&self) -> &str {
        &self.sprite.name
    }

    /// False for clones
    pub fn is_original(&self) -> bool {
        self.is_original
    }

    /// True for the stage
    pub fn is_stage(&self) -> bool {
        self.is_stage
    }

    /// Scripts reachable from this target
    pub fn scripts(&self) -> &[Script] {
        &self.sprite.scripts
    }

    /// Snapshot of the mutable state
    pub fn state(&self) -> TargetState {
        self.state.lock().clone()
    }

    /// Mutate the state under its lock
    pub fn with_state<R>(&self, f: impl FnOnce(&mut TargetState) -> R) -> R {
        f(&mut self.state.lock())
    }

    /// Duplicate this target as a clone: same sprite, copied state, no threads.
    pub fn make_clone(&self) -> Target {
        Self::build(self.sprite.clone(), false, false, self.state())
    }

    /// Release per-target resources. Safe to call more than once.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().custom.clear();
        self.edge_values.lock().clear();
    }

    /// Whether [`Target::dispose`] has run
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Store the latest predicate value of an edge-activated hat, returning the previous one.
    pub fn update_edge_value(&self, script: ScriptId, value: bool) -> Option<bool> {
        self.edge_values.lock().insert(script, value)
    }

    /// Forget all edge-activated hat values
    pub fn clear_edge_values(&self) {
        self.edge_values.lock().clear();
    }
}

/// Targets in execution order
#[derive(Default)]
pub struct TargetRegistry {
    targets: Vec<Arc<Target>>,
}

impl TargetRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a target. Duplicates are not filtered.
    pub fn add(&mut self, target: Arc<Target>) {
        self.targets.push(target);
    }

    /// Insert `target` directly behind `other` in execution order.
    pub fn insert_behind(&mut self, target: Arc<Target>, other: TargetId) {
        match self.position(other) {
            Some(index) => self.targets.insert(index, target),
            None => self.targets.push(target),
        }
    }

    /// Remove a target and run its disposal. Returns `None` if it was not present.
    pub fn dispose(&mut self, id: TargetId) -> Option<Arc<Target>> {
        let mut removed = None;
        self.targets.retain(|target| {
            if target.id() != id {
                return true;
            }
            target.dispose();
            removed = Some(target.clone());
            false
        });
        removed
    }

    /// Dispose and remove every target matching `predicate`, returning them.
    pub fn dispose_where(
        &mut self,
        mut predicate: impl FnMut(&Target) -> bool,
    ) -> Vec<Arc<Target>> {
        let mut removed = Vec::new();
        self.targets.retain(|target| {
            if !predicate(target) {
                return true;
            }
            target.dispose();
            removed.push(target.clone());
            false
        });
        removed
    }

    /// Look up a target by id
    pub fn get(&self, id: TargetId) -> Option<&Arc<Target>> {
        self.targets.iter().find(|target| target.id() == id)
    }

    /// The stage, if registered
    pub fn stage(&self) -> Option<&Arc<Target>> {
        self.targets.iter().find(|target| target.is_stage())
    }

    /// First non-stage target whose sprite has the given name.
    ///
    /// Clones share their sprite's name, so this can return a clone if it sits
    /// ahead of the original.
    pub fn sprite_by_name(&self, name: &str) -> Option<&Arc<Target>> {
        self.targets
            .iter()
            .filter(|target| !target.is_stage())
            .find(|target| target.name() == name)
    }

    /// Index of a target in execution order
    pub fn position(&self, id: TargetId) -> Option<usize> {
        self.targets.iter().position(|target| target.id() == id)
    }

    /// Targets in registry order
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Arc<Target>> {
        self.targets.iter()
    }

    /// Number of registered targets
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
