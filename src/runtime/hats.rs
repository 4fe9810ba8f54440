//! Hat dispatch
//!
//! `dispatch` walks targets back to front, matches scripts against the
//! requested hat and fields, and applies the per-hat restart policy to the
//! thread list. It only mutates in-memory state; the caller sends the
//! resulting wire messages while still holding the scheduler lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::Runtime;
use super::scheduler::ThreadList;
use super::target::{Script, Target, TargetId, TargetRegistry};
use super::thread::{HatTrigger, RunId, Thread};

/// Static dispatch policy for one hat opcode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HatMetadata {
    /// Retrigger restarts a running thread instead of skipping it
    pub restart_existing_threads: bool,
    /// Fires only on a false to true transition of its predicate
    pub edge_activated: bool,
}

impl HatMetadata {
    /// Policy for hats that restart running threads
    pub const RESTART: HatMetadata = HatMetadata {
        restart_existing_threads: true,
        edge_activated: false,
    };

    /// Policy for hats that skip while a thread is running
    pub const SKIP: HatMetadata = HatMetadata {
        restart_existing_threads: false,
        edge_activated: false,
    };

    /// Policy for edge-activated hats
    pub const EDGE: HatMetadata = HatMetadata {
        restart_existing_threads: false,
        edge_activated: true,
    };
}

/// Predicate of an edge-activated hat.
///
/// Evaluated while the scheduler lock is held, so it must not call back into
/// `Runtime` methods that take that lock.
pub type HatPredicate = Arc<dyn Fn(&Script, &Target, &Runtime) -> bool + Send + Sync>;

/// Hat metadata and edge predicates, keyed by opcode
#[derive(Default, Clone)]
pub struct HatTable {
    metadata: HashMap<String, HatMetadata>,
    predicates: HashMap<String, HatPredicate>,
}

impl HatTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hat
    pub fn insert(&mut self, opcode: impl Into<String>, metadata: HatMetadata) {
        self.metadata.insert(opcode.into(), metadata);
    }

    /// Register an edge-activated hat and its predicate
    pub fn insert_edge(&mut self, opcode: impl Into<String>, predicate: HatPredicate) {
        let opcode = opcode.into();
        self.metadata.insert(opcode.clone(), HatMetadata::EDGE);
        self.predicates.insert(opcode, predicate);
    }

    /// Metadata for a hat, if it is registered
    pub fn get(&self, opcode: &str) -> Option<HatMetadata> {
        self.metadata.get(opcode).copied()
    }

    /// Whether the opcode is a registered hat
    pub fn contains(&self, opcode: &str) -> bool {
        self.metadata.contains_key(opcode)
    }

    /// Edge-activated hats with their predicates
    pub fn edge_predicates(&self) -> impl Iterator<Item = (&str, &HatPredicate)> {
        self.predicates
            .iter()
            .map(|(opcode, predicate)| (opcode.as_str(), predicate))
    }
}

/// A request to start the scripts under one hat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HatRequest {
    /// Hat opcode
    pub opcode: String,
    /// Field values to match, uppercased
    pub fields: BTreeMap<String, String>,
    /// Restrict matching to one target
    pub target: Option<TargetId>,
}

impl HatRequest {
    /// Match every script under `opcode`
    pub fn new(opcode: impl Into<String>) -> Self {
        Self {
            opcode: opcode.into(),
            fields: BTreeMap::new(),
            target: None,
        }
    }

    /// Require a hat field value (compared case-insensitively)
    pub fn field(mut self, name: impl Into<String>, value: impl AsRef<str>) -> Self {
        self.fields
            .insert(name.into(), value.as_ref().to_uppercase());
        self
    }

    /// Restrict to a single target
    pub fn on_target(mut self, target: TargetId) -> Self {
        self.target = Some(target);
        self
    }

    /// Option reported to the environment with the start request
    pub fn option(&self) -> Option<String> {
        self.fields.values().next().cloned()
    }

    fn matches(&self, script: &Script) -> bool {
        script.hat == self.opcode
            && self.fields.iter().all(|(name, value)| {
                script
                    .fields
                    .get(name)
                    .is_some_and(|actual| actual.to_uppercase() == *value)
            })
    }
}

/// Outcome of one dispatch pass
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Threads started or restarted, in scan order
    pub started: Vec<Arc<Thread>>,
    /// Runs replaced by a restart; the environment must stop them
    pub replaced: Vec<RunId>,
}

impl Dispatch {
    /// True when nothing was started
    pub fn is_empty(&self) -> bool {
        self.started.is_empty()
    }
}

/// Match `request` against every target and apply the hat's restart policy.
///
/// `accept` is consulted for every matching script before the policy check,
/// which lets edge-activated hats record predicate values on every pass.
pub fn dispatch(
    metadata: HatMetadata,
    request: &HatRequest,
    targets: &TargetRegistry,
    threads: &mut ThreadList,
    mut accept: impl FnMut(&Script, &Target) -> bool,
) -> Dispatch {
    let mut out = Dispatch::default();
    let trigger = HatTrigger {
        opcode: request.opcode.clone(),
        option: request.option(),
    };

    for target in targets.iter().rev() {
        if request.target.is_some_and(|only| only != target.id()) {
            continue;
        }
        for script in target.scripts() {
            if !request.matches(script) || !accept(script, target) {
                continue;
            }

            let existing = threads.find(target.id(), script.id, false);
            if metadata.restart_existing_threads {
                if let Some((index, old)) = existing {
                    let fresh = Arc::new(old.restarted(trigger.clone()));
                    let old = threads.replace_at(index, fresh.clone());
                    old.interrupt();
                    if !old.has_finished() {
                        out.replaced.push(old.run());
                    }
                    tracing::debug!(
                        thread = %fresh.id(),
                        run = %fresh.run(),
                        hat = %request.opcode,
                        "restarted thread in place"
                    );
                    out.started.push(fresh);
                    continue;
                }
            } else if existing.is_some_and(|(_, thread)| !thread.is_done()) {
                tracing::debug!(
                    target = %target.id(),
                    script = %script.id,
                    hat = %request.opcode,
                    "skipping hat, thread already running"
                );
                continue;
            }

            let thread = Arc::new(Thread::new(
                target.id(),
                script.id,
                trigger.clone(),
                false,
            ));
            threads.push(thread.clone());
            out.started.push(thread);
        }
    }

    out
}
