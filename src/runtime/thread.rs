//! Threads: one cooperative run of a script on a target
//!
//! A [`Thread`] owns its status state machine and drives at most one block
//! operation at a time through [`Thread::execute_primitive`]. Cancellation is
//! cooperative: the interrupt flag is checked before and after every
//! primitive invocation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::PrimitiveResult;
use super::protocol::{Args, CallOutcome};
use super::target::{ScriptId, TargetId};

static NEXT_THREAD: AtomicU64 = AtomicU64::new(1);
static NEXT_RUN: AtomicU64 = AtomicU64::new(1);

/// Stable thread identity, preserved across restart in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Allocate a fresh thread id
    pub fn next() -> Self {
        Self(NEXT_THREAD.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread-{}", self.0)
    }
}

/// Identifies one run of a thread; every wire message is correlated on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    /// Allocate a fresh run id
    pub fn next() -> Self {
        Self(NEXT_RUN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run-{}", self.0)
    }
}

/// Thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    /// Active; the default
    Running,
    /// Blocked on an outstanding reply; treated like `YieldTick`
    PromiseWait,
    /// Paused until the next scheduler pass
    Yield,
    /// Paused until a full tick interval has elapsed
    YieldTick,
    /// Finished or stopped; terminal
    Done,
    /// Queued work finished, resident and waiting for more
    Idle,
}

impl ThreadStatus {
    /// Statuses in which a primitive invocation may proceed
    pub fn can_advance(self) -> bool {
        matches!(
            self,
            ThreadStatus::Running | ThreadStatus::YieldTick | ThreadStatus::PromiseWait
        )
    }

    /// Statuses that re-run the primitive after a tick interval
    pub fn waits_for_tick(self) -> bool {
        matches!(self, ThreadStatus::YieldTick | ThreadStatus::PromiseWait)
    }
}

/// The hat (and option) that started a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HatTrigger {
    /// Hat opcode
    pub opcode: String,
    /// Hat option, if any
    pub option: Option<String>,
}

/// One cooperative execution unit bound to (target, script)
pub struct Thread {
    id: ThreadId,
    run: RunId,
    target: TargetId,
    script: ScriptId,
    trigger: HatTrigger,
    stack_click: bool,
    update_monitor: bool,
    status: Mutex<ThreadStatus>,
    frame: Mutex<serde_json::Map<String, Value>>,
    cancel: CancellationToken,
    finished: watch::Sender<bool>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("run", &self.run)
            .field("target", &self.target)
            .field("script", &self.script)
            .field("status", &self.status())
            .field("stack_click", &self.stack_click)
            .finish()
    }
}

impl Thread {
    /// Create a thread for a hat-triggered or stack-click run
    pub fn new(target: TargetId, script: ScriptId, trigger: HatTrigger, stack_click: bool) -> Self {
        Self::with_identity(ThreadId::next(), target, script, trigger, stack_click, false)
    }

    fn with_identity(
        id: ThreadId,
        target: TargetId,
        script: ScriptId,
        trigger: HatTrigger,
        stack_click: bool,
        update_monitor: bool,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            id,
            run: RunId::next(),
            target,
            script,
            trigger,
            stack_click,
            update_monitor,
            status: Mutex::new(ThreadStatus::Running),
            frame: Mutex::new(serde_json::Map::new()),
            cancel: CancellationToken::new(),
            finished,
        }
    }

    /// Fresh run of the same thread: same id, target, script and linkage.
    pub fn restarted(&self, trigger: HatTrigger) -> Self {
        Self::with_identity(
            self.id,
            self.target,
            self.script,
            trigger,
            self.stack_click,
            self.update_monitor,
        )
    }

    /// Mark the thread as feeding a monitor
    pub fn with_monitor(mut self) -> Self {
        self.update_monitor = true;
        self
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Current run id
    pub fn run(&self) -> RunId {
        self.run
    }

    /// Owning target
    pub fn target(&self) -> TargetId {
        self.target
    }

    /// Script being run
    pub fn script(&self) -> ScriptId {
        self.script
    }

    /// Triggering hat
    pub fn trigger(&self) -> &HatTrigger {
        &self.trigger
    }

    /// Manual single run rather than hat-triggered
    pub fn is_stack_click(&self) -> bool {
        self.stack_click
    }

    /// Whether the thread feeds a monitor
    pub fn updates_monitor(&self) -> bool {
        self.update_monitor
    }

    /// Current status
    pub fn status(&self) -> ThreadStatus {
        *self.status.lock()
    }

    /// Set the status. `Done` is terminal and is never overwritten.
    pub fn set_status(&self, status: ThreadStatus) {
        let mut current = self.status.lock();
        if *current != ThreadStatus::Done {
            *current = status;
        }
    }

    /// Replace `from` with `to`, returning whether the swap happened
    pub fn transition(&self, from: ThreadStatus, to: ThreadStatus) -> bool {
        let mut current = self.status.lock();
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    }

    /// Pause until the next scheduler pass
    pub fn yield_now(&self) {
        self.set_status(ThreadStatus::Yield);
    }

    /// Pause for one full tick interval
    pub fn yield_tick(&self) {
        self.set_status(ThreadStatus::YieldTick);
    }

    /// Mark finished
    pub fn end(&self) {
        *self.status.lock() = ThreadStatus::Done;
    }

    /// True once `Done`
    pub fn is_done(&self) -> bool {
        self.status() == ThreadStatus::Done
    }

    /// Stop the thread: set the interrupt flag and finish it.
    pub fn interrupt(&self) {
        self.cancel.cancel();
        self.end();
    }

    /// Whether the interrupt flag is set
    pub fn is_interrupted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the thread is interrupted
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Scratch space for multi-tick primitives; cleared when a call completes
    pub fn frame(&self) -> parking_lot::MutexGuard<'_, serde_json::Map<String, Value>> {
        self.frame.lock()
    }

    /// Record that the environment reported the end of this run
    pub fn mark_finished(&self) {
        self.end();
        self.finished.send_replace(true);
    }

    /// Wait until the environment reports the end of this run
    pub async fn finished(&self) {
        let mut rx = self.finished.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether the environment has reported the end of this run
    pub fn has_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Drive one block operation through the cooperative contract.
    ///
    /// `call` invokes the primitive; it is re-invoked after a tick interval
    /// for as long as the primitive leaves the thread in `YieldTick`.
    pub async fn execute_primitive<F, Fut>(
        &self,
        args: &Args,
        tick: Duration,
        mut call: F,
    ) -> CallOutcome
    where
        F: FnMut(Args) -> Fut,
        Fut: Future<Output = PrimitiveResult<Value>>,
    {
        loop {
            if self.is_interrupted() {
                return CallOutcome::Interrupted;
            }
            if !self.status().can_advance() {
                return CallOutcome::null();
            }
            self.set_status(ThreadStatus::Running);

            let result = call(args.clone()).await;

            if self.is_interrupted() {
                return CallOutcome::Interrupted;
            }
            let value = match result {
                Ok(value) => value,
                Err(err) => {
                    self.frame.lock().clear();
                    return CallOutcome::Fault(err.to_string());
                }
            };
            if !self.status().waits_for_tick() {
                self.frame.lock().clear();
                return CallOutcome::Value(value);
            }

            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = self.cancel.cancelled() => return CallOutcome::Interrupted,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::error::PrimitiveError;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn thread() -> Arc<Thread> {
        Arc::new(Thread::new(
            TargetId::new(),
            ScriptId::next(),
            HatTrigger {
                opcode: "event_whenflagclicked".into(),
                option: None,
            },
            false,
        ))
    }

    const TICK: Duration = Duration::from_millis(1);

    #[tokio::test]
    async fn interrupted_thread_never_calls_primitive() {
        let thread = thread();
        thread.interrupt();
        let calls = AtomicUsize::new(0);

        let outcome = thread
            .execute_primitive(&Args::new(), TICK, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!(1)) }
            })
            .await;

        assert_eq!(outcome, CallOutcome::Interrupted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn yielded_thread_does_not_advance() {
        let thread = thread();
        thread.yield_now();

        let outcome = thread
            .execute_primitive(&Args::new(), TICK, |_| async { Ok(json!(1)) })
            .await;
        assert_eq!(outcome, CallOutcome::null());
    }

    #[tokio::test]
    async fn yield_tick_reruns_until_primitive_settles() {
        let thread = thread();
        let calls = AtomicUsize::new(0);

        let outcome = thread
            .execute_primitive(&Args::new(), TICK, |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    thread.yield_tick();
                }
                async move { Ok(json!(n)) }
            })
            .await;

        assert_eq!(outcome, CallOutcome::Value(json!(3)));
        assert_eq!(thread.status(), ThreadStatus::Running);
    }

    #[tokio::test]
    async fn interrupt_during_primitive_unwinds() {
        let thread = thread();
        let outcome = thread
            .execute_primitive(&Args::new(), TICK, |_| {
                thread.interrupt();
                async { Ok(json!("ignored")) }
            })
            .await;
        assert_eq!(outcome, CallOutcome::Interrupted);
        assert!(thread.is_done());
    }

    #[tokio::test]
    async fn primitive_errors_become_faults() {
        let thread = thread();
        let outcome = thread
            .execute_primitive(&Args::new(), TICK, |_| async {
                Err(PrimitiveError::UnknownOpcode("looks_say".into()))
            })
            .await;
        assert_eq!(
            outcome,
            CallOutcome::Fault("Unknown opcode 'looks_say'".into())
        );
    }

    #[test]
    fn restart_keeps_identity_with_new_run() {
        let thread = Thread::new(
            TargetId::new(),
            ScriptId::next(),
            HatTrigger {
                opcode: "event_whenflagclicked".into(),
                option: None,
            },
            false,
        )
        .with_monitor();
        let restarted = thread.restarted(thread.trigger().clone());

        assert_eq!(restarted.id(), thread.id());
        assert_ne!(restarted.run(), thread.run());
        assert!(restarted.updates_monitor());
        assert_eq!(restarted.status(), ThreadStatus::Running);
    }

    #[test]
    fn done_is_terminal() {
        let thread = thread();
        thread.end();
        thread.set_status(ThreadStatus::Running);
        assert!(thread.is_done());
    }
}
