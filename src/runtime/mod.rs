//! Runtime orchestrator and public API
//!
//! This module provides the main `Runtime` struct that owns the target
//! registry, the thread list and the clone counter, and bridges threads to
//! the script-execution environment over the RPC channel.
//!
//! All scheduler state sits behind one `parking_lot::Mutex`. It is never held
//! across an `.await`; wire messages describing a mutation are sent while it
//! is held, so the environment sees them in mutation order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

// Submodules
pub mod blocks;
pub mod channel;
pub mod clones;
pub mod environment;
pub mod error;
pub mod events;
pub mod hats;
pub mod primitives;
pub mod protocol;
pub mod scheduler;
pub mod target;
pub mod thread;

use channel::{HostEnd, HostSender, PendingCalls};
use clones::CloneCounter;
use environment::LocalEnvironment;
use error::{ChannelError, ConfigError, PrimitiveError, PrimitiveResult, Result, RuntimeError};
use events::{EventBus, RuntimeEvent, ScriptFault};
use hats::{HatMetadata, HatRequest};
use primitives::{BlockUtility, PrimitiveTable};
use protocol::{
    Args, CallOutcome, EnvConfig, EnvMessage, EnvStatus, HostMessage, ScriptBody, StopScope,
    ThreadRun, Token, TriggerMap,
};
use scheduler::{ProjectTimer, ThreadList, TickStats};
use target::{Script, ScriptId, Target, TargetId, TargetRegistry};
use thread::{HatTrigger, RunId, Thread, ThreadId, ThreadStatus};

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Scheduler passes per second
    pub tick_rate_hz: u32,

    /// Deadline for the environment's reply to `init` and `register_threads`
    pub init_timeout_ms: u64,

    /// Deadline for a full script run awaited by the host
    pub run_timeout_ms: u64,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 60,
            init_timeout_ms: 10_000,
            run_timeout_ms: 10_000,
            debug: false,
        }
    }
}

impl RuntimeConfig {
    /// Load a JSON config file
    pub fn load(path: &Path) -> std::result::Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty JSON
    pub fn save(&self, path: &Path) -> std::result::Result<(), ConfigError> {
        self.validate()?;
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reject values the scheduler cannot run with
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.tick_rate_hz == 0 {
            return Err(ConfigError::Invalid("tick_rate_hz must be positive".into()));
        }
        if self.init_timeout_ms == 0 || self.run_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        Ok(())
    }

    /// Duration of one scheduler pass
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

#[derive(Default)]
struct SchedulerState {
    targets: TargetRegistry,
    threads: ThreadList,
    clones: CloneCounter,
    /// Every run handed to the environment whose `end_of_thread` has not arrived yet
    live_runs: HashMap<RunId, Arc<Thread>>,
    faults: Vec<ScriptFault>,
}

struct Shared {
    config: RuntimeConfig,
    state: Mutex<SchedulerState>,
    primitives: PrimitiveTable,
    sender: HostSender,
    host_calls: PendingCalls<Result<()>>,
    env_status: watch::Sender<EnvStatus>,
    live: watch::Sender<usize>,
    tick: watch::Sender<TickStats>,
    events: EventBus,
    timer: Mutex<ProjectTimer>,
    io: Mutex<HashMap<String, Value>>,
    redraw: AtomicBool,
    ticking: AtomicBool,
    epoch: Instant,
    shutdown: CancellationToken,
}

/// The scheduler: targets, threads, clones, and the environment bridge
///
/// Cheap to clone; every clone drives the same scheduler.
#[derive(Clone)]
pub struct Runtime {
    shared: Arc<Shared>,
}

impl Runtime {
    /// Create a runtime with the built-in block packages, talking to the
    /// environment on the other end of `host`.
    ///
    /// Must be called inside a tokio runtime: the reply dispatcher is spawned here.
    pub fn new(config: RuntimeConfig, host: HostEnd) -> Self {
        Self::with_primitives(config, host, blocks::builtin_table())
    }

    /// Create a runtime with a custom primitive table
    pub fn with_primitives(
        config: RuntimeConfig,
        host: HostEnd,
        primitives: PrimitiveTable,
    ) -> Self {
        let HostEnd { sender, receiver } = host;
        let runtime = Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(SchedulerState::default()),
                primitives,
                sender,
                host_calls: PendingCalls::new(),
                env_status: watch::channel(EnvStatus::Uninitialized).0,
                live: watch::channel(0).0,
                tick: watch::channel(TickStats::default()).0,
                events: EventBus::new(),
                timer: Mutex::new(ProjectTimer::default()),
                io: Mutex::new(HashMap::new()),
                redraw: AtomicBool::new(false),
                ticking: AtomicBool::new(false),
                epoch: Instant::now(),
                shutdown: CancellationToken::new(),
            }),
        };
        tokio::spawn(runtime.clone().dispatch_replies(receiver));
        runtime
    }

    /// Create a runtime wired to an in-process [`LocalEnvironment`]
    pub fn with_local_environment(config: RuntimeConfig) -> Self {
        let (host, env) = channel::channel_pair();
        tokio::spawn(LocalEnvironment::new(env).run());
        Self::new(config, host)
    }

    /// Get the current configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.shared.config
    }

    /// Duration of one scheduler pass
    pub fn tick_interval(&self) -> Duration {
        self.shared.config.tick_interval()
    }

    /// Subscribe to runtime events
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.shared.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Environment lifecycle
    // ------------------------------------------------------------------

    /// Initialise the environment.
    ///
    /// Bounded by `init_timeout_ms`. On expiry the channel is poisoned and
    /// the environment has to be replaced.
    pub async fn init(&self) -> Result<()> {
        let config = EnvConfig {
            protocol_version: crate::PROTOCOL_VERSION.to_string(),
            tick_interval_ms: self.tick_interval().as_millis() as u64,
            debug: self.shared.config.debug,
        };
        let (token, reply) = self.shared.host_calls.open(None);
        if let Err(err) = self.shared.sender.send(HostMessage::Init { token, config }) {
            self.shared.host_calls.cancel(token);
            return Err(err.into());
        }
        self.await_reply("init", token, reply).await?;
        tracing::info!("environment initialised");
        Ok(())
    }

    /// Send every script body to the environment, replacing earlier registrations.
    pub async fn register_threads(&self) -> Result<()> {
        let (bodies, trigger_map) = {
            let state = self.shared.state.lock();
            let mut bodies: BTreeMap<ScriptId, ScriptBody> = BTreeMap::new();
            let mut trigger_map = TriggerMap::new();
            for target in state.targets.iter() {
                for script in target.scripts() {
                    if bodies.contains_key(&script.id) {
                        continue;
                    }
                    bodies.insert(
                        script.id,
                        ScriptBody {
                            script: script.id,
                            source: script.source.clone(),
                        },
                    );
                    trigger_map
                        .entry(script.hat.clone())
                        .or_default()
                        .push(script.id);
                }
            }
            (bodies.into_values().collect::<Vec<_>>(), trigger_map)
        };

        let count = bodies.len();
        let (token, reply) = self.shared.host_calls.open(None);
        let message = HostMessage::RegisterThreads {
            token,
            bodies,
            trigger_map,
        };
        if let Err(err) = self.shared.sender.send(message) {
            self.shared.host_calls.cancel(token);
            return Err(err.into());
        }
        self.await_reply("register_threads", token, reply).await?;
        tracing::info!(scripts = count, "scripts registered");
        Ok(())
    }

    /// Initialise the environment and register every script
    pub async fn load(&self) -> Result<()> {
        self.init().await?;
        self.register_threads().await
    }

    /// Last lifecycle status reported by the environment
    pub fn env_status(&self) -> EnvStatus {
        *self.shared.env_status.borrow()
    }

    /// The failure that poisoned the channel, if any
    pub fn channel_fault(&self) -> Option<ChannelError> {
        self.shared.sender.fault()
    }

    async fn await_reply(
        &self,
        operation: &'static str,
        token: Token,
        reply: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        let timeout_ms = self.shared.config.init_timeout_ms;
        match tokio::time::timeout(Duration::from_millis(timeout_ms), reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.channel_failure().into()),
            Err(_) => {
                self.shared.host_calls.cancel(token);
                let err = ChannelError::Timeout {
                    operation,
                    timeout_ms,
                };
                self.shared.sender.poison(err.clone());
                Err(err.into())
            }
        }
    }

    fn channel_failure(&self) -> ChannelError {
        match self.shared.sender.fault() {
            Some(err) => ChannelError::Poisoned(err.to_string()),
            None => ChannelError::Closed,
        }
    }

    // ------------------------------------------------------------------
    // Environment -> host
    // ------------------------------------------------------------------

    async fn dispatch_replies(self, mut inbox: mpsc::UnboundedReceiver<EnvMessage>) {
        loop {
            let message = tokio::select! {
                message = inbox.recv() => message,
                _ = self.shared.shutdown.cancelled() => break,
            };
            match message {
                Some(message) => self.on_env_message(message),
                None => {
                    self.on_channel_closed();
                    break;
                }
            }
        }
        tracing::debug!("reply dispatcher stopped");
    }

    fn on_env_message(&self, message: EnvMessage) {
        match message {
            EnvMessage::BlockOp {
                run,
                opcode,
                args,
                token,
            } => self.on_block_op(run, opcode, args, token),
            EnvMessage::EndOfThread { run } => self.on_end_of_thread(run),
            EnvMessage::Error {
                run,
                message,
                position,
            } => self.on_script_error(run, message, position),
            EnvMessage::Ready { token } | EnvMessage::ThreadsRegistered { token } => {
                self.resolve_host_call(token, Ok(()));
            }
            EnvMessage::CompileError {
                token,
                message,
                position,
            } => {
                tracing::warn!(message = %message, ?position, "environment rejected scripts");
                self.resolve_host_call(token, Err(RuntimeError::Compile { message, position }));
            }
            EnvMessage::Status { status } => {
                tracing::info!(?status, "environment status");
                self.shared.env_status.send_replace(status);
                self.shared
                    .events
                    .publish(RuntimeEvent::EnvironmentStatus(status));
            }
        }
    }

    fn resolve_host_call(&self, token: Token, reply: Result<()>) {
        if !self.shared.host_calls.resolve(token, reply) {
            tracing::warn!(token = %token, "reply for a request that is no longer pending");
        }
    }

    fn on_channel_closed(&self) {
        let err = self.channel_failure();
        tracing::error!(error = %err, "environment channel closed");
        self.shared
            .host_calls
            .resolve_all(|| Err(RuntimeError::Channel(err.clone())));

        // No end_of_thread can arrive any more; release everyone waiting on one.
        let mut state = self.shared.state.lock();
        for (_, thread) in state.live_runs.drain() {
            thread.interrupt();
            thread.mark_finished();
        }
        self.shared.live.send_replace(0);
    }

    fn on_block_op(&self, run: RunId, opcode: String, args: Args, token: Token) {
        let thread = self.shared.state.lock().live_runs.get(&run).cloned();
        let Some(thread) = thread else {
            tracing::warn!(run = %run, opcode = %opcode, "block_op from an unknown run");
            self.reply(token, CallOutcome::Interrupted);
            return;
        };
        let runtime = self.clone();
        tokio::spawn(async move {
            let outcome = runtime.run_block_op(&thread, opcode, args).await;
            runtime.reply(token, outcome);
        });
    }

    fn reply(&self, token: Token, outcome: CallOutcome) {
        if let Err(err) = self
            .shared
            .sender
            .send(HostMessage::ResultValue { token, outcome })
        {
            tracing::error!(token = %token, error = %err, "could not deliver block result");
        }
    }

    async fn run_block_op(&self, thread: &Arc<Thread>, opcode: String, args: Args) -> CallOutcome {
        if thread.status() == ThreadStatus::Yield {
            self.wait_for_tick(thread).await;
        }
        if !thread.transition(ThreadStatus::Idle, ThreadStatus::PromiseWait) {
            thread.transition(ThreadStatus::Running, ThreadStatus::PromiseWait);
        }

        let runtime = self.clone();
        let caller = thread.clone();
        let name = opcode.clone();
        let outcome = thread
            .execute_primitive(&args, self.tick_interval(), move |args| {
                let runtime = runtime.clone();
                let caller = caller.clone();
                let opcode = name.clone();
                async move { runtime.invoke(&caller, &opcode, args).await }
            })
            .await;

        thread.transition(ThreadStatus::Running, ThreadStatus::Idle);
        tracing::debug!(
            thread = %thread.id(),
            run = %thread.run(),
            opcode = %opcode,
            ?outcome,
            "block_op resolved"
        );
        outcome
    }

    async fn wait_for_tick(&self, thread: &Thread) {
        let mut ticks = self.shared.tick.subscribe();
        while thread.status() == ThreadStatus::Yield {
            tokio::select! {
                changed = ticks.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = thread.cancellation().cancelled() => return,
            }
        }
    }

    fn on_end_of_thread(&self, run: RunId) {
        let thread = {
            let mut state = self.shared.state.lock();
            let thread = state.live_runs.remove(&run);
            self.shared.live.send_replace(state.live_runs.len());
            thread
        };
        match thread {
            Some(thread) => {
                thread.mark_finished();
                tracing::debug!(thread = %thread.id(), run = %run, "thread finished");
                self.shared.events.publish(RuntimeEvent::ThreadFinished {
                    thread: thread.id(),
                    run,
                });
            }
            None => tracing::warn!(run = %run, "end_of_thread for an unknown run"),
        }
    }

    fn on_script_error(&self, run: RunId, message: String, position: Option<usize>) {
        let mut state = self.shared.state.lock();
        let Some(thread) = state.live_runs.get(&run).cloned() else {
            tracing::warn!(run = %run, message = %message, "fault from an unknown run");
            return;
        };
        tracing::warn!(
            thread = %thread.id(),
            run = %run,
            target = %thread.target(),
            ?position,
            message = %message,
            "script fault"
        );
        let fault = ScriptFault {
            thread: thread.id(),
            run,
            target: thread.target(),
            position,
            message,
            recorded_at: chrono::Utc::now(),
        };
        state.faults.push(fault.clone());
        self.shared.events.publish(RuntimeEvent::ScriptFault(fault));
    }

    // ------------------------------------------------------------------
    // Primitive dispatch
    // ------------------------------------------------------------------

    async fn invoke(
        &self,
        thread: &Arc<Thread>,
        opcode: &str,
        args: Args,
    ) -> PrimitiveResult<Value> {
        let primitive = self
            .shared
            .primitives
            .get(opcode)
            .cloned()
            .ok_or_else(|| PrimitiveError::UnknownOpcode(opcode.to_string()))?;
        let target = self
            .get_target_by_id(thread.target())
            .ok_or_else(|| PrimitiveError::TargetNotFound(thread.target().to_string()))?;
        let value = primitive(args, BlockUtility::new(self.clone(), thread.clone(), target)).await?;
        self.request_redraw();
        Ok(value)
    }

    /// Run one primitive against a target on behalf of the host.
    ///
    /// The call gets a detached thread of its own, so multi-tick primitives
    /// still complete before this returns.
    pub async fn exec_block_primitive(
        &self,
        target: TargetId,
        opcode: &str,
        args: Args,
    ) -> PrimitiveResult<Value> {
        let thread = Arc::new(Thread::new(
            target,
            ScriptId(0),
            HatTrigger {
                opcode: opcode.to_string(),
                option: None,
            },
            true,
        ));
        loop {
            let value = self.invoke(&thread, opcode, args.clone()).await?;
            if thread.is_interrupted() || !thread.status().waits_for_tick() {
                // Host calls may run without the ticker.
                self.flush_redraw();
                return Ok(value);
            }
            thread.set_status(ThreadStatus::Running);
            tokio::time::sleep(self.tick_interval()).await;
        }
    }

    /// Ask for a redraw at the end of the current tick
    pub fn request_redraw(&self) {
        self.shared.redraw.store(true, Ordering::Relaxed);
    }

    fn flush_redraw(&self) {
        if self.shared.redraw.swap(false, Ordering::Relaxed) {
            self.shared.events.publish(RuntimeEvent::Redraw);
        }
    }

    // ------------------------------------------------------------------
    // Hat dispatch
    // ------------------------------------------------------------------

    /// Start (or restart) the threads matching `request`.
    ///
    /// Unknown hats are a no-op. Returns the threads started or restarted.
    pub fn start_hats(&self, request: HatRequest) -> Vec<Arc<Thread>> {
        let Some(metadata) = self.shared.primitives.hats().get(&request.opcode) else {
            tracing::debug!(hat = %request.opcode, "ignoring unknown hat");
            return Vec::new();
        };
        let mut state = self.shared.state.lock();
        self.dispatch_locked(&mut state, metadata, &request, |_, _| true)
    }

    fn dispatch_locked(
        &self,
        state: &mut SchedulerState,
        metadata: HatMetadata,
        request: &HatRequest,
        accept: impl FnMut(&Script, &Target) -> bool,
    ) -> Vec<Arc<Thread>> {
        let out = hats::dispatch(metadata, request, &state.targets, &mut state.threads, accept);
        if out.is_empty() {
            return Vec::new();
        }
        if !out.replaced.is_empty() {
            self.send_locked(HostMessage::StopThreads {
                scope: StopScope::Runs(out.replaced.clone()),
            });
        }
        self.launch_locked(state, &request.opcode, request.option(), &out.started);
        out.started
    }

    /// Hand new runs to the environment. Call with the scheduler lock held.
    fn launch_locked(
        &self,
        state: &mut SchedulerState,
        hat: &str,
        option: Option<String>,
        threads: &[Arc<Thread>],
    ) {
        let runs: Vec<ThreadRun> = threads
            .iter()
            .map(|thread| {
                state.live_runs.insert(thread.run(), thread.clone());
                ThreadRun {
                    run: thread.run(),
                    thread: thread.id(),
                    script: thread.script(),
                    target: thread.target(),
                }
            })
            .collect();

        let message = HostMessage::StartThreads {
            hat: hat.to_string(),
            option,
            runs,
        };
        match self.shared.sender.send(message) {
            Ok(()) => {
                tracing::debug!(hat = %hat, count = threads.len(), "threads started");
                self.shared.events.publish(RuntimeEvent::ThreadsStarted {
                    hat: hat.to_string(),
                    threads: threads.iter().map(|thread| thread.id()).collect(),
                });
            }
            Err(err) => {
                tracing::error!(hat = %hat, error = %err, "could not start threads");
                for thread in threads {
                    state.live_runs.remove(&thread.run());
                    thread.interrupt();
                    thread.mark_finished();
                }
            }
        }
        self.shared.live.send_replace(state.live_runs.len());
    }

    fn send_locked(&self, message: HostMessage) {
        let kind = message.kind();
        if let Err(err) = self.shared.sender.send(message) {
            tracing::error!(kind, error = %err, "could not reach environment");
        }
    }

    /// Green flag: stop everything, reset edge-activated hats, start flag scripts.
    pub fn green_flag(&self) -> Vec<Arc<Thread>> {
        self.stop_all();
        for target in self.shared.state.lock().targets.iter() {
            target.clear_edge_values();
        }
        self.start_hats(HatRequest::new(blocks::event::WHEN_FLAG_CLICKED))
    }

    /// Key press: starts scripts for the key and for `any`
    pub fn key_pressed(&self, key: &str) -> Vec<Arc<Thread>> {
        let mut started = self.start_hats(
            HatRequest::new(blocks::event::WHEN_KEY_PRESSED).field("KEY_OPTION", key),
        );
        started.extend(self.start_hats(
            HatRequest::new(blocks::event::WHEN_KEY_PRESSED).field("KEY_OPTION", "any"),
        ));
        started
    }

    /// Sprite click on a single target
    pub fn sprite_clicked(&self, target: TargetId) -> Vec<Arc<Thread>> {
        self.start_hats(HatRequest::new(blocks::event::WHEN_THIS_SPRITE_CLICKED).on_target(target))
    }

    /// Broadcast a message from the host
    pub fn broadcast(&self, name: &str) -> Vec<Arc<Thread>> {
        self.start_hats(
            HatRequest::new(blocks::event::WHEN_BROADCAST_RECEIVED).field("BROADCAST_OPTION", name),
        )
    }

    /// Start a stack-click run of a script, or stop it if it is already running.
    ///
    /// Returns the started thread, or `None` when the call stopped a run.
    pub fn toggle_script(
        &self,
        target: TargetId,
        script: ScriptId,
        update_monitor: bool,
    ) -> Result<Option<Arc<Thread>>> {
        let mut state = self.shared.state.lock();
        let owner = state
            .targets
            .get(target)
            .cloned()
            .ok_or_else(|| RuntimeError::TargetNotFound(target.to_string()))?;
        let script = owner
            .sprite()
            .script(script)
            .cloned()
            .ok_or_else(|| RuntimeError::ScriptNotFound(script.to_string()))?;
        let edge = self
            .shared
            .primitives
            .hats()
            .get(&script.hat)
            .is_some_and(|meta| meta.edge_activated);

        // Edge-activated hat runs may coexist with a stack click of the same script.
        let running = state
            .threads
            .iter()
            .find(|thread| {
                thread.target() == target
                    && thread.script() == script.id
                    && !thread.is_done()
                    && !(edge && !thread.is_stack_click())
            })
            .cloned();
        if let Some(running) = running {
            state
                .threads
                .remove_where(|thread| thread.id() == running.id());
            self.interrupt_locked(&[running]);
            return Ok(None);
        }

        let mut thread = Thread::new(
            target,
            script.id,
            HatTrigger {
                opcode: script.hat.clone(),
                option: script.option().map(str::to_string),
            },
            true,
        );
        if update_monitor {
            thread = thread.with_monitor();
        }
        let thread = Arc::new(thread);
        state.threads.push(thread.clone());
        self.launch_locked(&mut state, &script.hat, None, std::slice::from_ref(&thread));
        Ok(Some(thread))
    }

    // ------------------------------------------------------------------
    // Stopping
    // ------------------------------------------------------------------

    /// Interrupt threads and tell the environment. Call with the scheduler lock held.
    fn interrupt_locked(&self, threads: &[Arc<Thread>]) {
        let mut runs = Vec::with_capacity(threads.len());
        for thread in threads {
            thread.interrupt();
            if !thread.has_finished() {
                runs.push(thread.run());
            }
        }
        if !runs.is_empty() {
            self.send_locked(HostMessage::StopThreads {
                scope: StopScope::Runs(runs),
            });
        }
    }

    /// Stop every thread, dispose every clone, reset the timer.
    pub fn stop_all(&self) {
        self.shared.events.publish(RuntimeEvent::ProjectStopAll);
        let removed = {
            let mut state = self.shared.state.lock();
            let removed = state.targets.dispose_where(|target| !target.is_original());
            for _ in &removed {
                state.clones.release();
            }
            let threads = state.threads.drain();
            for thread in &threads {
                thread.interrupt();
            }
            self.send_locked(HostMessage::StopThreads {
                scope: StopScope::All,
            });
            tracing::info!(
                threads = threads.len(),
                clones = removed.len(),
                "stopped all threads"
            );
            removed
        };
        for target in removed {
            self.shared
                .events
                .publish(RuntimeEvent::TargetRemoved(target.id()));
        }
        self.reset_timer();
    }

    /// Stop a target's threads, optionally sparing one
    pub fn stop_for_target(&self, target: TargetId, except: Option<ThreadId>) {
        let mut state = self.shared.state.lock();
        let stopped = state
            .threads
            .remove_where(|thread| thread.target() == target && Some(thread.id()) != except);
        self.interrupt_locked(&stopped);
    }

    /// Stop one thread
    pub fn stop_thread(&self, thread: &Arc<Thread>) {
        let mut state = self.shared.state.lock();
        state
            .threads
            .remove_where(|other| other.id() == thread.id() && other.run() == thread.run());
        self.interrupt_locked(std::slice::from_ref(thread));
    }

    // ------------------------------------------------------------------
    // Targets and clones
    // ------------------------------------------------------------------

    /// Append a target in execution order
    pub fn add_target(&self, target: Arc<Target>) -> TargetId {
        let id = target.id();
        self.shared.state.lock().targets.add(target);
        self.shared.events.publish(RuntimeEvent::TargetCreated(id));
        id
    }

    /// Remove a target, stop its threads and run its disposal. Idempotent.
    pub fn dispose_target(&self, id: TargetId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(target) = state.targets.dispose(id) else {
            return false;
        };
        if !target.is_original() {
            state.clones.release();
        }
        let stopped = state.threads.remove_where(|thread| thread.target() == id);
        self.interrupt_locked(&stopped);
        drop(state);
        tracing::debug!(target = %id, sprite = %target.name(), "target disposed");
        self.shared.events.publish(RuntimeEvent::TargetRemoved(id));
        true
    }

    /// Clone a target. Silently refused at the clone ceiling or for the stage.
    pub fn create_clone(&self, source: TargetId) -> Option<Arc<Target>> {
        let mut state = self.shared.state.lock();
        let source = state.targets.get(source)?.clone();
        if source.is_stage() {
            return None;
        }
        if !state.clones.acquire() {
            tracing::debug!(sprite = %source.name(), "clone limit reached");
            return None;
        }
        let clone = Arc::new(source.make_clone());
        state.targets.insert_behind(clone.clone(), source.id());
        self.shared
            .events
            .publish(RuntimeEvent::TargetCreated(clone.id()));

        let request = HatRequest::new(blocks::control::START_AS_CLONE).on_target(clone.id());
        if let Some(metadata) = self.shared.primitives.hats().get(&request.opcode) {
            self.dispatch_locked(&mut state, metadata, &request, |_, _| true);
        }
        Some(clone)
    }

    /// Dispose a clone. Originals are left alone.
    pub fn delete_clone(&self, id: TargetId) -> bool {
        let is_clone = self
            .get_target_by_id(id)
            .is_some_and(|target| !target.is_original());
        is_clone && self.dispose_target(id)
    }

    /// Whether another clone may be created
    pub fn clones_available(&self) -> bool {
        self.shared.state.lock().clones.available()
    }

    /// Number of live clones
    pub fn clone_count(&self) -> usize {
        self.shared.state.lock().clones.count()
    }

    /// Look up a target
    pub fn get_target_by_id(&self, id: TargetId) -> Option<Arc<Target>> {
        self.shared.state.lock().targets.get(id).cloned()
    }

    /// The stage target
    pub fn get_target_for_stage(&self) -> Option<Arc<Target>> {
        self.shared.state.lock().targets.stage().cloned()
    }

    /// First non-stage target sharing the sprite name; this may be a clone.
    pub fn get_sprite_target_by_name(&self, name: &str) -> Option<Arc<Target>> {
        self.shared.state.lock().targets.sprite_by_name(name).cloned()
    }

    /// Snapshot of the targets in execution order
    pub fn targets(&self) -> Vec<Arc<Target>> {
        self.shared.state.lock().targets.iter().cloned().collect()
    }

    /// Number of targets, clones included
    pub fn target_count(&self) -> usize {
        self.shared.state.lock().targets.len()
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    /// Look up a resident thread
    pub fn get_thread_by_id(&self, id: ThreadId) -> Option<Arc<Thread>> {
        self.shared.state.lock().threads.get(id).cloned()
    }

    /// Resident threads of one target, in execution order
    pub fn threads_for_target(&self, target: TargetId) -> Vec<Arc<Thread>> {
        self.shared
            .state
            .lock()
            .threads
            .iter()
            .filter(|thread| thread.target() == target)
            .cloned()
            .collect()
    }

    /// Ids of resident threads, in execution order
    pub fn thread_ids(&self) -> Vec<ThreadId> {
        self.shared
            .state
            .lock()
            .threads
            .iter()
            .map(|thread| thread.id())
            .collect()
    }

    /// Number of resident threads
    pub fn thread_count(&self) -> usize {
        self.shared.state.lock().threads.len()
    }

    /// Wait for the environment to finish the given threads.
    ///
    /// On timeout the channel is poisoned and a `Timeout` error is returned.
    pub async fn wait_for(&self, threads: &[Arc<Thread>], timeout: Duration) -> Result<()> {
        let all = futures::future::join_all(threads.iter().map(|thread| thread.finished()));
        match tokio::time::timeout(timeout, all).await {
            Ok(_) => Ok(()),
            Err(_) => Err(self.run_timeout(timeout)),
        }
    }

    /// Wait until no run is outstanding, bounded by `run_timeout_ms`.
    pub async fn wait_until_idle(&self) -> Result<()> {
        let timeout = Duration::from_millis(self.shared.config.run_timeout_ms);
        let mut live = self.shared.live.subscribe();
        match tokio::time::timeout(timeout, live.wait_for(|count| *count == 0)).await {
            Ok(_) => Ok(()),
            Err(_) => Err(self.run_timeout(timeout)),
        }
    }

    fn run_timeout(&self, timeout: Duration) -> RuntimeError {
        let err = ChannelError::Timeout {
            operation: "run",
            timeout_ms: timeout.as_millis() as u64,
        };
        self.shared.sender.poison(err.clone());
        err.into()
    }

    /// Faults recorded so far
    pub fn script_faults(&self) -> Vec<ScriptFault> {
        self.shared.state.lock().faults.clone()
    }

    /// Forget recorded faults
    pub fn clear_faults(&self) {
        self.shared.state.lock().faults.clear();
    }

    // ------------------------------------------------------------------
    // Ticking
    // ------------------------------------------------------------------

    /// One scheduler pass.
    ///
    /// Evaluates edge-activated hats, resumes yielded threads, reaps finished
    /// threads and flushes a pending redraw.
    pub fn step(&self) -> TickStats {
        let began = Instant::now();
        let edge_hats: Vec<_> = self
            .shared
            .primitives
            .hats()
            .edge_predicates()
            .map(|(opcode, predicate)| (opcode.to_string(), predicate.clone()))
            .collect();

        let reaped = {
            let mut state = self.shared.state.lock();
            for (opcode, predicate) in &edge_hats {
                let request = HatRequest::new(opcode.clone());
                self.dispatch_locked(&mut state, HatMetadata::EDGE, &request, |script, target| {
                    let value = predicate(script, target, self);
                    let previous = target.update_edge_value(script.id, value);
                    value && previous != Some(true)
                });
            }
            for thread in state.threads.iter() {
                thread.transition(ThreadStatus::Yield, ThreadStatus::Running);
            }
            state.threads.reap().len()
        };

        self.flush_redraw();

        let mut stats = TickStats::default();
        self.shared.tick.send_modify(|tick| {
            tick.ticks += 1;
            tick.reaped = reaped;
            tick.last_step = began.elapsed();
            stats = *tick;
        });
        stats
    }

    /// Statistics of the last scheduler pass
    pub fn tick_stats(&self) -> TickStats {
        *self.shared.tick.borrow()
    }

    /// Start the background ticker. Calling it again is a no-op.
    pub fn start(&self) {
        if self.shared.ticking.swap(true, Ordering::SeqCst) {
            return;
        }
        let runtime = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(runtime.tick_interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(hz = runtime.shared.config.tick_rate_hz, "ticker started");
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        runtime.step();
                    }
                    _ = runtime.shared.shutdown.cancelled() => break,
                }
            }
            tracing::info!("ticker stopped");
        });
    }

    /// Stop everything and shut down the ticker and dispatcher
    pub fn quit(&self) {
        self.stop_all();
        self.shared.shutdown.cancel();
    }

    // ------------------------------------------------------------------
    // Timer and IO
    // ------------------------------------------------------------------

    /// Seconds since the project timer was last reset
    pub fn timer_seconds(&self) -> f64 {
        self.shared.timer.lock().seconds()
    }

    /// Reset the project timer
    pub fn reset_timer(&self) {
        self.shared.timer.lock().reset();
    }

    /// Milliseconds since the runtime was created; never reset.
    pub fn clock_ms(&self) -> f64 {
        self.shared.epoch.elapsed().as_secs_f64() * 1000.0
    }

    /// Publish a sensed value (e.g. `loudness`) for hats to read
    pub fn set_io_value(&self, key: &str, value: Value) {
        self.shared.io.lock().insert(key.to_string(), value);
    }

    /// Read a sensed value
    pub fn io_value(&self, key: &str) -> Option<Value> {
        self.shared.io.lock().get(key).cloned()
    }
}
