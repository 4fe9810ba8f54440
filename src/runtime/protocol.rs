//! Wire schema between the scheduler and the script-execution environment.
//!
//! Messages travel as newline-delimited JSON, tagged by `type`. The same
//! types are passed directly over in-process channels, so an environment
//! living in another process only needs the line codec at the bottom of
//! this module.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use super::error::{ChannelError, ChannelResult};
use super::target::{ScriptId, TargetId};
use super::thread::{RunId, ThreadId};

/// Argument map passed to a primitive
pub type Args = serde_json::Map<String, Value>;

/// Hat opcode to the scripts it triggers
pub type TriggerMap = BTreeMap<String, Vec<ScriptId>>;

/// Correlates one request with its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tok-{}", self.0)
    }
}

/// Resolution of one block operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// The primitive completed with a value
    Value(Value),
    /// The calling thread was stopped; the caller must unwind
    Interrupted,
    /// The primitive failed; the caller raises a script fault
    Fault(String),
}

impl CallOutcome {
    /// Null value, used when a tick does not advance the thread
    pub fn null() -> Self {
        CallOutcome::Value(Value::Null)
    }

    /// True for [`CallOutcome::Interrupted`]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, CallOutcome::Interrupted)
    }
}

/// Configuration handed to the environment on `init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Protocol version spoken by the host
    pub protocol_version: String,
    /// Scheduler tick interval, for environments that pace themselves
    pub tick_interval_ms: u64,
    /// Verbose environment logging
    #[serde(default)]
    pub debug: bool,
}

/// Loadable body of one script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptBody {
    /// Script the body belongs to
    pub script: ScriptId,
    /// Generated source for the environment
    pub source: String,
}

/// One thread run the environment should start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadRun {
    /// Run identifier used on every message of this run
    pub run: RunId,
    /// Stable thread identity (kept across restarts)
    pub thread: ThreadId,
    /// Script to execute
    pub script: ScriptId,
    /// Target the script acts on
    pub target: TargetId,
}

/// Which runs a `stop_threads` message names
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopScope {
    /// Every run the environment knows about
    All,
    /// Only the listed runs
    Runs(Vec<RunId>),
}

impl StopScope {
    /// Whether the scope names the given run
    pub fn contains(&self, run: RunId) -> bool {
        match self {
            StopScope::All => true,
            StopScope::Runs(runs) => runs.contains(&run),
        }
    }
}

/// Environment lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStatus {
    /// Not yet initialised
    Uninitialized,
    /// Loading its interpreter
    Loading,
    /// Ready to accept work
    Ready,
    /// Thread bodies are registered
    Registered,
    /// A stop-all request was processed
    Stopped,
}

/// Host to environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    /// Initialise the environment
    Init {
        /// Reply correlator
        token: Token,
        /// Environment configuration
        config: EnvConfig,
    },
    /// Load thread bodies, replacing any earlier registration
    RegisterThreads {
        /// Reply correlator
        token: Token,
        /// Script bodies
        bodies: Vec<ScriptBody>,
        /// Hat opcode to scripts
        trigger_map: TriggerMap,
    },
    /// Start the listed runs
    StartThreads {
        /// Triggering hat
        hat: String,
        /// Hat option (e.g. broadcast name), if any
        #[serde(default, skip_serializing_if = "Option::is_none")]
        option: Option<String>,
        /// Runs chosen by the dispatcher
        runs: Vec<ThreadRun>,
    },
    /// Interrupt runs
    StopThreads {
        /// Runs to stop
        scope: StopScope,
    },
    /// Resolve a pending block operation
    ResultValue {
        /// Token of the `block_op` being answered
        token: Token,
        /// Outcome of the call
        outcome: CallOutcome,
    },
}

impl HostMessage {
    /// Short message name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            HostMessage::Init { .. } => "init",
            HostMessage::RegisterThreads { .. } => "register_threads",
            HostMessage::StartThreads { .. } => "start_threads",
            HostMessage::StopThreads { .. } => "stop_threads",
            HostMessage::ResultValue { .. } => "result_value",
        }
    }
}

/// Environment to host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvMessage {
    /// Request execution of one primitive
    BlockOp {
        /// Calling run
        run: RunId,
        /// Primitive opcode
        opcode: String,
        /// Primitive arguments
        #[serde(default)]
        args: Args,
        /// Reply correlator
        token: Token,
    },
    /// The run finished, normally or by unwinding
    EndOfThread {
        /// Finished run
        run: RunId,
    },
    /// Uncaught fault inside a run's body
    Error {
        /// Faulting run
        run: RunId,
        /// Fault message
        message: String,
        /// Statement position, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    /// Reply to `init`
    Ready {
        /// Token of the `init` request
        token: Token,
    },
    /// Reply to a successful `register_threads`
    ThreadsRegistered {
        /// Token of the `register_threads` request
        token: Token,
    },
    /// Reply to a failed `register_threads`
    CompileError {
        /// Token of the `register_threads` request
        token: Token,
        /// Compiler message
        message: String,
        /// Statement position, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
    /// Lifecycle notification
    Status {
        /// New environment status
        status: EnvStatus,
    },
}

impl EnvMessage {
    /// Short message name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            EnvMessage::BlockOp { .. } => "block_op",
            EnvMessage::EndOfThread { .. } => "end_of_thread",
            EnvMessage::Error { .. } => "error",
            EnvMessage::Ready { .. } => "ready",
            EnvMessage::ThreadsRegistered { .. } => "threads_registered",
            EnvMessage::CompileError { .. } => "compile_error",
            EnvMessage::Status { .. } => "status",
        }
    }
}

/// Encode one message as a single NDJSON line (without the trailing newline).
pub fn encode_line<T: Serialize>(message: &T) -> ChannelResult<String> {
    serde_json::to_string(message).map_err(|err| ChannelError::Malformed(err.to_string()))
}

/// Decode one NDJSON line.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> ChannelResult<T> {
    serde_json::from_str(line.trim()).map_err(|err| ChannelError::Malformed(err.to_string()))
}
