//! Token-correlated RPC channel between the scheduler and an environment.
//!
//! A channel is a pair of unbounded queues carrying [`HostMessage`] and
//! [`EnvMessage`]. Either side correlates replies through a
//! [`PendingCalls`] table: one single-fire resolver per token, resolved
//! exactly once. Fatal failures (timeouts, malformed lines) poison the
//! channel so later sends fail fast instead of hanging.

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use super::error::{ChannelError, ChannelResult};
use super::protocol::{EnvMessage, HostMessage, Token, decode_line, encode_line};
use super::thread::RunId;

struct PendingCall<R> {
    owner: Option<RunId>,
    resolver: oneshot::Sender<R>,
}

/// Table of outstanding calls keyed by token.
///
/// Tokens come from a monotonically increasing counter and are never reused
/// for the lifetime of the table.
pub struct PendingCalls<R> {
    next_token: AtomicU64,
    calls: Mutex<HashMap<Token, PendingCall<R>>>,
}

impl<R> Default for PendingCalls<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> PendingCalls<R> {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Open a call, optionally owned by a thread run.
    pub fn open(&self, owner: Option<RunId>) -> (Token, oneshot::Receiver<R>) {
        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        let (resolver, receiver) = oneshot::channel();
        let previous = self
            .calls
            .lock()
            .insert(token, PendingCall { owner, resolver });
        debug_assert!(previous.is_none(), "token {} reused", token);
        (token, receiver)
    }

    /// Resolve a call. Returns false if the token is unknown or already resolved.
    pub fn resolve(&self, token: Token, value: R) -> bool {
        let call = self.calls.lock().remove(&token);
        match call {
            Some(call) => {
                // The waiter may have given up (timeout); the call still counts as consumed.
                let _ = call.resolver.send(value);
                true
            }
            None => false,
        }
    }

    /// Drop a call without resolving it.
    pub fn cancel(&self, token: Token) -> bool {
        self.calls.lock().remove(&token).is_some()
    }

    /// Resolve every call owned by `run`. Returns how many were resolved.
    pub fn resolve_owned_by(&self, run: RunId, mut value: impl FnMut() -> R) -> usize {
        let drained: Vec<PendingCall<R>> = {
            let mut calls = self.calls.lock();
            let tokens: Vec<Token> = calls
                .iter()
                .filter(|(_, call)| call.owner == Some(run))
                .map(|(token, _)| *token)
                .collect();
            tokens
                .into_iter()
                .filter_map(|token| calls.remove(&token))
                .collect()
        };
        let count = drained.len();
        for call in drained {
            let _ = call.resolver.send(value());
        }
        count
    }

    /// Resolve every outstanding call.
    pub fn resolve_all(&self, mut value: impl FnMut() -> R) -> usize {
        let drained: Vec<PendingCall<R>> = self.calls.lock().drain().map(|(_, c)| c).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.resolver.send(value());
        }
        count
    }

    /// Whether a token is still outstanding
    pub fn is_pending(&self, token: Token) -> bool {
        self.calls.lock().contains_key(&token)
    }

    /// Number of outstanding calls
    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    /// True when nothing is outstanding
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// First fatal failure observed on a channel, shared by both ends.
#[derive(Clone, Default)]
pub struct ChannelFault(Arc<Mutex<Option<ChannelError>>>);

impl ChannelFault {
    /// Record a failure; the first one wins.
    pub fn poison(&self, err: ChannelError) {
        let mut slot = self.0.lock();
        if slot.is_none() {
            tracing::error!(error = %err, "rpc channel poisoned");
            *slot = Some(err);
        }
    }

    /// The recorded failure, if any
    pub fn get(&self) -> Option<ChannelError> {
        self.0.lock().clone()
    }

    fn check(&self) -> ChannelResult<()> {
        match self.get() {
            Some(err) => Err(ChannelError::Poisoned(err.to_string())),
            None => Ok(()),
        }
    }
}

/// Sending half on the host side
#[derive(Clone)]
pub struct HostSender {
    tx: mpsc::UnboundedSender<HostMessage>,
    fault: ChannelFault,
}

impl HostSender {
    /// Send a message to the environment
    pub fn send(&self, message: HostMessage) -> ChannelResult<()> {
        self.fault.check()?;
        tracing::trace!(kind = message.kind(), "host -> env");
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }

    /// Mark the channel as failed
    pub fn poison(&self, err: ChannelError) {
        self.fault.poison(err);
    }

    /// The failure that poisoned the channel, if any
    pub fn fault(&self) -> Option<ChannelError> {
        self.fault.get()
    }
}

/// Sending half on the environment side
#[derive(Clone)]
pub struct EnvSender {
    tx: mpsc::UnboundedSender<EnvMessage>,
    fault: ChannelFault,
}

impl EnvSender {
    /// Send a message to the host
    pub fn send(&self, message: EnvMessage) -> ChannelResult<()> {
        self.fault.check()?;
        tracing::trace!(kind = message.kind(), "env -> host");
        self.tx.send(message).map_err(|_| ChannelError::Closed)
    }
}

/// Host side of a channel
pub struct HostEnd {
    /// Outgoing messages
    pub sender: HostSender,
    /// Incoming messages
    pub receiver: mpsc::UnboundedReceiver<EnvMessage>,
}

/// Environment side of a channel
pub struct EnvEnd {
    /// Outgoing messages
    pub sender: EnvSender,
    /// Incoming messages
    pub receiver: mpsc::UnboundedReceiver<HostMessage>,
}

/// Create a connected in-process channel.
pub fn channel_pair() -> (HostEnd, EnvEnd) {
    let fault = ChannelFault::default();
    let (host_tx, env_rx) = mpsc::unbounded_channel();
    let (env_tx, host_rx) = mpsc::unbounded_channel();
    (
        HostEnd {
            sender: HostSender {
                tx: host_tx,
                fault: fault.clone(),
            },
            receiver: host_rx,
        },
        EnvEnd {
            sender: EnvSender { tx: env_tx, fault },
            receiver: env_rx,
        },
    )
}

/// Connect the host to an environment speaking NDJSON over a byte stream.
///
/// A line that fails to decode poisons the channel and closes the host's
/// receiver.
pub fn connect_lines<R, W>(reader: R, writer: W) -> HostEnd
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (host, env) = channel_pair();
    let fault = env.sender.fault.clone();
    tokio::spawn(read_lines::<EnvMessage, _>(reader, env.sender.tx, fault.clone()));
    tokio::spawn(write_lines::<HostMessage, _>(writer, env.receiver, fault));
    host
}

/// Serve an environment over an NDJSON byte stream (the environment-process side).
pub fn serve_lines<R, W>(reader: R, writer: W) -> EnvEnd
where
    R: AsyncBufRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (host, env) = channel_pair();
    let fault = host.sender.fault.clone();
    tokio::spawn(read_lines::<HostMessage, _>(reader, host.sender.tx, fault.clone()));
    tokio::spawn(write_lines::<EnvMessage, _>(writer, host.receiver, fault));
    env
}

async fn read_lines<T, R>(reader: R, tx: mpsc::UnboundedSender<T>, fault: ChannelFault)
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode_line::<T>(&line) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        fault.poison(err);
                        break;
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                fault.poison(ChannelError::Malformed(err.to_string()));
                break;
            }
        }
    }
}

async fn write_lines<T, W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<T>, fault: ChannelFault)
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(err) => {
                fault.poison(err);
                break;
            }
        };
        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if written.is_err() {
            tracing::debug!("line writer closed");
            break;
        }
    }
}
