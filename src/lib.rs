//! Patch VM – a cooperative scheduler for sprite scripts
//!
//! This crate runs many independent, cooperatively scheduled scripts
//! ("threads"), each bound to a target (a sprite instance or one of its
//! clones). Script statements execute inside an isolated environment that
//! is reached only through a token-correlated message channel:
//! - A thread status machine with yield, tick-yield and promise-wait states
//! - A request/reply protocol with many outstanding calls and cooperative interruption
//! - Hat dispatch with restart, skip and edge-activated policies
//! - A bounded clone lifecycle (at most 300 live clones)
//! - An in-process environment and an NDJSON bridge for out-of-process ones

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Scheduler, threads, targets and the environment bridge
pub mod runtime;

// Re-export key types for convenience
pub use runtime::error::{ChannelError, PrimitiveError, RuntimeError};
pub use runtime::hats::{HatMetadata, HatRequest};
pub use runtime::target::{Script, Sprite, Target, TargetId};
pub use runtime::thread::{Thread, ThreadId, ThreadStatus};
pub use runtime::{Runtime, RuntimeConfig};

/// Current version of the Patch VM
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version spoken on the environment channel
pub const PROTOCOL_VERSION: &str = "1.0.0";
