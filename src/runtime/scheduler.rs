//! Ordered thread list and tick bookkeeping
//!
//! The scheduler owns threads in a `Vec` of slots. Restarting a thread
//! replaces its slot in place so relative execution order survives the
//! restart; finished threads are reaped once per tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::target::{ScriptId, TargetId};
use super::thread::{Thread, ThreadId, ThreadStatus};

/// Threads in execution order
#[derive(Debug, Default)]
pub struct ThreadList {
    threads: Vec<Arc<Thread>>,
}

impl ThreadList {
    /// Create an empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a thread
    pub fn push(&mut self, thread: Arc<Thread>) {
        self.threads.push(thread);
    }

    /// Replace the thread at `index`, returning the previous occupant.
    pub fn replace_at(&mut self, index: usize, thread: Arc<Thread>) -> Arc<Thread> {
        std::mem::replace(&mut self.threads[index], thread)
    }

    /// Find the slot of the thread running `script` on `target`.
    ///
    /// A finished thread can linger until the next reap while a newer run of
    /// the same script is active; the active one is preferred.
    pub fn find(
        &self,
        target: TargetId,
        script: ScriptId,
        stack_click: bool,
    ) -> Option<(usize, &Arc<Thread>)> {
        let mut matching = self.threads.iter().enumerate().filter(|(_, thread)| {
            thread.target() == target
                && thread.script() == script
                && thread.is_stack_click() == stack_click
        });
        let first = matching.next()?;
        if !first.1.is_done() {
            return Some(first);
        }
        matching.find(|(_, thread)| !thread.is_done()).or(Some(first))
    }

    /// Look up a thread by id
    pub fn get(&self, id: ThreadId) -> Option<&Arc<Thread>> {
        self.threads.iter().find(|thread| thread.id() == id)
    }

    /// Remove every thread matching `predicate`, preserving the order of the rest.
    pub fn remove_where(
        &mut self,
        mut predicate: impl FnMut(&Thread) -> bool,
    ) -> Vec<Arc<Thread>> {
        let mut removed = Vec::new();
        self.threads.retain(|thread| {
            if predicate(thread) {
                removed.push(thread.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove finished threads
    pub fn reap(&mut self) -> Vec<Arc<Thread>> {
        self.remove_where(|thread| thread.status() == ThreadStatus::Done)
    }

    /// Remove every thread
    pub fn drain(&mut self) -> Vec<Arc<Thread>> {
        std::mem::take(&mut self.threads)
    }

    /// Threads in execution order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Thread>> {
        self.threads.iter()
    }

    /// Number of threads
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// True when no thread is resident
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }
}

/// Project timer, reset by stop-all and green flag
#[derive(Debug)]
pub struct ProjectTimer {
    started: Instant,
}

impl Default for ProjectTimer {
    fn default() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl ProjectTimer {
    /// Seconds since the last reset
    pub fn seconds(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Restart from zero
    pub fn reset(&mut self) {
        self.started = Instant::now();
    }
}

/// Per-tick statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct TickStats {
    /// Completed scheduler passes
    pub ticks: u64,
    /// Threads reaped during the last pass
    pub reaped: usize,
    /// Wall-clock duration of the last pass
    pub last_step: Duration,
}
