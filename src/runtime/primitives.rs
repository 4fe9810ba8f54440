//! Primitive registry and the per-call block utility
//!
//! Primitives are grouped into [`BlockPackage`]s. Packages register their
//! opcodes and hats into a [`PrimitiveTable`] once when the runtime is
//! built; dispatch afterwards is a plain map lookup.

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::Runtime;
use super::error::{PrimitiveError, PrimitiveResult};
use super::hats::{HatMetadata, HatPredicate, HatRequest, HatTable};
use super::protocol::Args;
use super::target::Target;
use super::thread::Thread;

/// A callable primitive
pub type Primitive =
    Arc<dyn Fn(Args, BlockUtility) -> BoxFuture<'static, PrimitiveResult<Value>> + Send + Sync>;

/// A group of related primitives and hats
pub trait BlockPackage: Send + Sync {
    /// Opcode prefix, for logs
    fn name(&self) -> &'static str;

    /// Register the package's primitives and hats
    fn register(&self, table: &mut PrimitiveTable);
}

/// Opcode to primitive, plus hat metadata
#[derive(Default, Clone)]
pub struct PrimitiveTable {
    primitives: HashMap<String, Primitive>,
    hats: HatTable,
}

impl PrimitiveTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from packages
    pub fn from_packages(packages: &[&dyn BlockPackage]) -> Self {
        let mut table = Self::new();
        for package in packages {
            let before = table.primitives.len();
            package.register(&mut table);
            tracing::debug!(
                package = package.name(),
                primitives = table.primitives.len() - before,
                "registered block package"
            );
        }
        table
    }

    /// Register a primitive under `opcode`, replacing any earlier one.
    pub fn register<F, Fut>(&mut self, opcode: &str, primitive: F)
    where
        F: Fn(Args, BlockUtility) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PrimitiveResult<Value>> + Send + 'static,
    {
        let primitive: Primitive = Arc::new(move |args, util| primitive(args, util).boxed());
        self.primitives.insert(opcode.to_string(), primitive);
    }

    /// Register a hat
    pub fn register_hat(&mut self, opcode: &str, metadata: HatMetadata) {
        self.hats.insert(opcode, metadata);
    }

    /// Register an edge-activated hat
    pub fn register_edge_hat(&mut self, opcode: &str, predicate: HatPredicate) {
        self.hats.insert_edge(opcode, predicate);
    }

    /// Look up a primitive
    pub fn get(&self, opcode: &str) -> Option<&Primitive> {
        self.primitives.get(opcode)
    }

    /// Whether an opcode is registered
    pub fn contains(&self, opcode: &str) -> bool {
        self.primitives.contains_key(opcode)
    }

    /// Hat metadata
    pub fn hats(&self) -> &HatTable {
        &self.hats
    }

    /// Number of registered primitives
    pub fn len(&self) -> usize {
        self.primitives.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.primitives.is_empty()
    }
}

const TIMER_START: &str = "timer_start_ms";

/// Handle a primitive uses to reach its thread, target and the scheduler
#[derive(Clone)]
pub struct BlockUtility {
    runtime: Runtime,
    thread: Arc<Thread>,
    target: Arc<Target>,
}

impl BlockUtility {
    pub(crate) fn new(runtime: Runtime, thread: Arc<Thread>, target: Arc<Target>) -> Self {
        Self {
            runtime,
            thread,
            target,
        }
    }

    /// The scheduler
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// The calling thread
    pub fn thread(&self) -> &Arc<Thread> {
        &self.thread
    }

    /// The calling thread's target
    pub fn target(&self) -> &Arc<Target> {
        &self.target
    }

    /// Pause until the next scheduler pass
    pub fn yield_now(&self) {
        self.thread.yield_now();
    }

    /// Ask to be re-invoked after one tick interval
    pub fn yield_tick(&self) {
        self.thread.yield_tick();
    }

    /// Progress of a timed, multi-tick operation in `[0, 1]`.
    ///
    /// The first invocation starts the timer. Until the duration has elapsed
    /// the thread is left in `YieldTick`, so the primitive is called again.
    pub fn timed(&self, seconds: f64) -> f64 {
        let now = self.runtime.clock_ms();
        let start = {
            let mut frame = self.thread.frame();
            match frame.get(TIMER_START).and_then(Value::as_f64) {
                Some(start) => start,
                None => {
                    frame.insert(TIMER_START.into(), json!(now));
                    now
                }
            }
        };
        let duration_ms = (seconds * 1000.0).max(0.0);
        let progress = if duration_ms == 0.0 {
            1.0
        } else {
            ((now - start) / duration_ms).clamp(0.0, 1.0)
        };
        if progress < 1.0 {
            self.yield_tick();
        }
        progress
    }

    /// Read or initialise a value in the current call's frame
    pub fn frame_value(&self, key: &str, init: impl FnOnce() -> Value) -> Value {
        self.thread
            .frame()
            .entry(key.to_string())
            .or_insert_with(init)
            .clone()
    }

    /// Stop every thread and dispose every clone
    pub fn stop_all(&self) {
        self.runtime.stop_all();
    }

    /// Stop the target's other threads
    pub fn stop_other_target_threads(&self) {
        self.runtime
            .stop_for_target(self.target.id(), Some(self.thread.id()));
    }

    /// Stop the calling thread
    pub fn stop_this_script(&self) {
        self.runtime.stop_thread(&self.thread);
    }

    /// Start hats on behalf of the calling thread
    pub fn start_hats(&self, request: HatRequest) -> Vec<Arc<Thread>> {
        self.runtime.start_hats(request)
    }

    /// Wait until every thread has finished, or the caller is stopped.
    pub async fn wait_for_threads(&self, threads: &[Arc<Thread>]) {
        let all = futures::future::join_all(threads.iter().map(|thread| thread.finished()));
        tokio::select! {
            _ = all => {}
            _ = self.thread.cancellation().cancelled() => {}
        }
    }

    /// Clone the sprite called `name`, or the calling target for `_myself_`.
    pub fn create_clone(&self, name: &str) -> Option<Arc<Target>> {
        let source = if name == "_myself_" {
            Some(self.target.clone())
        } else {
            self.runtime.get_sprite_target_by_name(name)
        }?;
        self.runtime.create_clone(source.id())
    }

    /// Delete the calling target if it is a clone
    pub fn delete_this_clone(&self) {
        self.runtime.delete_clone(self.target.id());
    }
}

/// Numeric argument; numeric strings are accepted.
pub fn number_arg(args: &Args, name: &str) -> PrimitiveResult<f64> {
    let value = args.get(name).ok_or_else(|| missing(name))?;
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| invalid(name, "not finite")),
        Value::String(s) if s.trim().is_empty() => Ok(0.0),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| invalid(name, &format!("'{}' is not a number", s))),
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        other => Err(invalid(name, &format!("expected a number, got {}", other))),
    }
}

/// String argument; numbers are rendered as text.
pub fn string_arg(args: &Args, name: &str) -> PrimitiveResult<String> {
    match args.get(name).ok_or_else(|| missing(name))? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        other => Err(invalid(name, &format!("expected text, got {}", other))),
    }
}

fn missing(name: &str) -> PrimitiveError {
    invalid(name, "missing")
}

fn invalid(name: &str, detail: &str) -> PrimitiveError {
    PrimitiveError::InvalidArgument {
        name: name.to_string(),
        detail: detail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(value: Value) -> Args {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn number_arg_casts_like_scratch() {
        let args = args(json!({"A": 3, "B": " 2.5 ", "C": "", "D": true, "E": "cat"}));
        assert_eq!(number_arg(&args, "A").unwrap(), 3.0);
        assert_eq!(number_arg(&args, "B").unwrap(), 2.5);
        assert_eq!(number_arg(&args, "C").unwrap(), 0.0);
        assert_eq!(number_arg(&args, "D").unwrap(), 1.0);
        assert!(matches!(
            number_arg(&args, "E"),
            Err(PrimitiveError::InvalidArgument { .. })
        ));
        assert!(number_arg(&args, "missing").is_err());
    }

    #[test]
    fn string_arg_renders_numbers() {
        let args = args(json!({"N": 10, "S": "hello"}));
        assert_eq!(string_arg(&args, "N").unwrap(), "10");
        assert_eq!(string_arg(&args, "S").unwrap(), "hello");
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let mut table = PrimitiveTable::new();
        table.register("test_op", |_, _| async { Ok(json!(1)) });
        table.register("test_op", |_, _| async { Ok(json!(2)) });
        assert_eq!(table.len(), 1);
        assert!(table.contains("test_op"));
        assert!(table.get("other").is_none());
    }
}
