//! In-process script-execution environment
//!
//! [`LocalEnvironment`] speaks the same message schema as an out-of-process
//! environment, so the scheduler cannot tell them apart. A script body is a
//! JSON list of statements:
//!
//! ```json
//! [
//!   {"op": "call", "opcode": "motion_movesteps", "args": {"STEPS": 10}},
//!   {"op": "repeat", "times": 3, "body": [{"op": "call", "opcode": "motion_turnright", "args": {"DEGREES": 15}}]},
//!   {"op": "raise", "message": "boom"}
//! ]
//! ```
//!
//! Every call becomes a `block_op` round trip. Interruption is checked
//! before and after each call; an interrupted call unwinds the whole body.

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::channel::{EnvEnd, EnvSender, PendingCalls};
use super::protocol::{
    Args, CallOutcome, EnvMessage, EnvStatus, HostMessage, ScriptBody, StopScope, ThreadRun,
};
use super::target::ScriptId;
use super::thread::RunId;

/// One statement of a local script body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    /// Invoke a primitive on the host
    Call {
        /// Primitive opcode
        opcode: String,
        /// Primitive arguments
        #[serde(default)]
        args: Args,
    },
    /// Run `body` `times` times
    Repeat {
        /// Iteration count
        times: u32,
        /// Loop body
        body: Vec<Statement>,
    },
    /// Fault the thread
    Raise {
        /// Fault message
        message: String,
    },
}

/// Parse a script body
pub fn compile(body: &ScriptBody) -> Result<Vec<Statement>, (String, Option<usize>)> {
    serde_json::from_str(&body.source)
        .map_err(|err| (format!("{}: {}", body.script, err), Some(err.line())))
}

enum Unwind {
    Interrupted,
    Fault { message: String, position: usize },
}

type Bodies = Arc<RwLock<HashMap<ScriptId, Arc<Vec<Statement>>>>>;

/// Environment that interprets statement lists inside the host process
pub struct LocalEnvironment {
    end: EnvEnd,
    bodies: Bodies,
    calls: Arc<PendingCalls<CallOutcome>>,
    runs: Arc<Mutex<HashMap<RunId, CancellationToken>>>,
}

impl LocalEnvironment {
    /// Wrap the environment side of a channel
    pub fn new(end: EnvEnd) -> Self {
        Self {
            end,
            bodies: Arc::default(),
            calls: Arc::new(PendingCalls::new()),
            runs: Arc::default(),
        }
    }

    /// Serve host messages until the host goes away.
    pub async fn run(mut self) {
        tracing::info!("local environment started");
        while let Some(message) = self.end.receiver.recv().await {
            tracing::debug!(kind = message.kind(), "environment received");
            self.handle(message);
        }
        for (_, cancel) in self.runs.lock().drain() {
            cancel.cancel();
        }
        self.calls.resolve_all(|| CallOutcome::Interrupted);
        tracing::info!("local environment stopped");
    }

    fn send(&self, message: EnvMessage) {
        if let Err(err) = self.end.sender.send(message) {
            tracing::warn!(error = %err, "environment could not reach host");
        }
    }

    fn handle(&mut self, message: HostMessage) {
        match message {
            HostMessage::Init { token, config } => {
                tracing::debug!(protocol = %config.protocol_version, "initialising");
                self.send(EnvMessage::Status {
                    status: EnvStatus::Loading,
                });
                self.send(EnvMessage::Ready { token });
                self.send(EnvMessage::Status {
                    status: EnvStatus::Ready,
                });
            }
            HostMessage::RegisterThreads { token, bodies, .. } => {
                let mut compiled = HashMap::with_capacity(bodies.len());
                for body in &bodies {
                    match compile(body) {
                        Ok(statements) => {
                            compiled.insert(body.script, Arc::new(statements));
                        }
                        Err((message, position)) => {
                            self.send(EnvMessage::CompileError {
                                token,
                                message,
                                position,
                            });
                            return;
                        }
                    }
                }
                *self.bodies.write() = compiled;
                self.send(EnvMessage::ThreadsRegistered { token });
                self.send(EnvMessage::Status {
                    status: EnvStatus::Registered,
                });
            }
            HostMessage::StartThreads { hat, runs, .. } => {
                tracing::debug!(hat = %hat, count = runs.len(), "starting threads");
                for run in runs {
                    self.start(run);
                }
            }
            HostMessage::StopThreads { scope } => self.stop(&scope),
            HostMessage::ResultValue { token, outcome } => {
                if !self.calls.resolve(token, outcome) {
                    tracing::debug!(token = %token, "reply for a call that is no longer pending");
                }
            }
        }
    }

    fn start(&self, run: ThreadRun) {
        let body = self.bodies.read().get(&run.script).cloned();
        let Some(body) = body else {
            self.send(EnvMessage::Error {
                run: run.run,
                message: format!("{} is not registered", run.script),
                position: None,
            });
            self.send(EnvMessage::EndOfThread { run: run.run });
            return;
        };

        let cancel = CancellationToken::new();
        self.runs.lock().insert(run.run, cancel.clone());
        let ctx = RunContext {
            run: run.run,
            cancel,
            calls: self.calls.clone(),
            sender: self.end.sender.clone(),
        };
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let mut position = 0;
            let result = ctx.exec(&body, &mut position).await;
            runs.lock().remove(&ctx.run);
            match result {
                Ok(()) => {}
                Err(Unwind::Interrupted) => {
                    tracing::debug!(run = %ctx.run, "run unwound after interrupt");
                }
                Err(Unwind::Fault { message, position }) => {
                    let _ = ctx.sender.send(EnvMessage::Error {
                        run: ctx.run,
                        message,
                        position: Some(position),
                    });
                }
            }
            let _ = ctx.sender.send(EnvMessage::EndOfThread { run: ctx.run });
        });
    }

    fn stop(&self, scope: &StopScope) {
        let stopped: Vec<(RunId, CancellationToken)> = {
            let runs = self.runs.lock();
            runs.iter()
                .filter(|(run, _)| scope.contains(**run))
                .map(|(run, cancel)| (*run, cancel.clone()))
                .collect()
        };
        for (run, cancel) in &stopped {
            cancel.cancel();
            self.calls.resolve_owned_by(*run, || CallOutcome::Interrupted);
        }
        tracing::debug!(count = stopped.len(), "stopped runs");
        if *scope == StopScope::All {
            self.send(EnvMessage::Status {
                status: EnvStatus::Stopped,
            });
        }
    }
}

struct RunContext {
    run: RunId,
    cancel: CancellationToken,
    calls: Arc<PendingCalls<CallOutcome>>,
    sender: EnvSender,
}

impl RunContext {
    fn exec<'a>(
        &'a self,
        statements: &'a [Statement],
        position: &'a mut usize,
    ) -> BoxFuture<'a, Result<(), Unwind>> {
        async move {
            for statement in statements {
                let here = *position;
                *position += 1;
                match statement {
                    Statement::Call { opcode, args } => self.call(opcode, args, here).await?,
                    Statement::Repeat { times, body } => {
                        for _ in 0..*times {
                            self.exec(body, position).await?;
                        }
                    }
                    Statement::Raise { message } => {
                        return Err(Unwind::Fault {
                            message: message.clone(),
                            position: here,
                        });
                    }
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn call(&self, opcode: &str, args: &Args, position: usize) -> Result<(), Unwind> {
        if self.cancel.is_cancelled() {
            return Err(Unwind::Interrupted);
        }
        let (token, reply) = self.calls.open(Some(self.run));
        // A stop that raced with `open` may have missed this call.
        if self.cancel.is_cancelled() {
            self.calls.cancel(token);
            return Err(Unwind::Interrupted);
        }
        let sent = self.sender.send(EnvMessage::BlockOp {
            run: self.run,
            opcode: opcode.to_string(),
            args: args.clone(),
            token,
        });
        if sent.is_err() {
            self.calls.cancel(token);
            return Err(Unwind::Interrupted);
        }

        let outcome = reply.await.unwrap_or(CallOutcome::Interrupted);
        if self.cancel.is_cancelled() {
            return Err(Unwind::Interrupted);
        }
        match outcome {
            CallOutcome::Value(_) => Ok(()),
            CallOutcome::Interrupted => Err(Unwind::Interrupted),
            CallOutcome::Fault(message) => Err(Unwind::Fault { message, position }),
        }
    }
}
