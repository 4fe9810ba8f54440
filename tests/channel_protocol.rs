use patchvm::runtime::channel::{EnvEnd, channel_pair, connect_lines, serve_lines};
use patchvm::runtime::environment::LocalEnvironment;
use patchvm::runtime::events::RuntimeEvent;
use patchvm::runtime::protocol::{CallOutcome, EnvMessage, HostMessage, StopScope, Token};
use patchvm::runtime::thread::RunId;
use patchvm::{ChannelError, Runtime, RuntimeConfig, RuntimeError, Script, Sprite, Target};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;

fn flag_sprite(source: &str) -> Arc<Target> {
    Arc::new(Target::new(Arc::new(
        Sprite::new("Cat").with_script(Script::new("event_whenflagclicked", source)),
    )))
}

/// Receive host messages until one matches, failing after a second.
async fn expect_host(env: &mut EnvEnd, mut want: impl FnMut(&HostMessage) -> bool) -> HostMessage {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(1), env.receiver.recv())
            .await
            .expect("timed out waiting for host message")
            .expect("host went away");
        if want(&message) {
            return message;
        }
    }
}

/// Drain whatever the host sends within `window`.
async fn drain(env: &mut EnvEnd, window: Duration) -> Vec<HostMessage> {
    let mut out = Vec::new();
    while let Ok(Some(message)) = tokio::time::timeout(window, env.receiver.recv()).await {
        out.push(message);
    }
    out
}

async fn started_run(env: &mut EnvEnd) -> RunId {
    match expect_host(env, |m| matches!(m, HostMessage::StartThreads { .. })).await {
        HostMessage::StartThreads { runs, .. } => runs[0].run,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn init_timeout_poisons_the_channel() {
    let (host, _env) = channel_pair();
    let config = RuntimeConfig {
        init_timeout_ms: 50,
        ..RuntimeConfig::default()
    };
    let runtime = Runtime::new(config, host);

    let err = runtime.init().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Channel(ChannelError::Timeout {
            operation: "init",
            timeout_ms: 50
        })
    ));
    assert!(err.is_channel_fatal());
    assert!(runtime.channel_fault().is_some());

    let again = runtime.init().await.unwrap_err();
    assert!(matches!(again, RuntimeError::Channel(ChannelError::Poisoned(_))));
}

#[tokio::test]
async fn init_reply_is_matched_by_token() {
    let (host, mut env) = channel_pair();
    let runtime = Runtime::new(RuntimeConfig::default(), host);

    let init = tokio::spawn({
        let runtime = runtime.clone();
        async move { runtime.init().await }
    });
    let token = match expect_host(&mut env, |m| matches!(m, HostMessage::Init { .. })).await {
        HostMessage::Init { token, config } => {
            assert_eq!(config.protocol_version, patchvm::PROTOCOL_VERSION);
            token
        }
        _ => unreachable!(),
    };

    // A reply to some other request is ignored.
    env.sender
        .send(EnvMessage::Ready {
            token: Token(token.0 + 1000),
        })
        .unwrap();
    env.sender.send(EnvMessage::Ready { token }).unwrap();

    init.await.unwrap().unwrap();
    assert!(runtime.channel_fault().is_none());
}

#[tokio::test]
async fn stopped_call_is_interrupted_exactly_once() {
    let (host, mut env) = channel_pair();
    let cat = flag_sprite("[]");
    let runtime = Runtime::new(RuntimeConfig::default(), host);
    runtime.add_target(cat.clone());
    let mut events = runtime.subscribe();

    let threads = runtime.start_hats(patchvm::HatRequest::new("event_whenflagclicked"));
    let run = started_run(&mut env).await;
    assert_eq!(run, threads[0].run());

    env.sender
        .send(EnvMessage::BlockOp {
            run,
            opcode: "control_wait".into(),
            args: json!({"DURATION": 10}).as_object().cloned().unwrap(),
            token: Token(1),
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    runtime.stop_all();

    let messages = drain(&mut env, Duration::from_millis(100)).await;
    let interrupted = messages
        .iter()
        .filter(|m| {
            matches!(
                m,
                HostMessage::ResultValue {
                    token: Token(1),
                    outcome: CallOutcome::Interrupted
                }
            )
        })
        .count();
    assert_eq!(interrupted, 1);
    assert!(messages.contains(&HostMessage::StopThreads {
        scope: StopScope::All
    }));

    // Calls from the stopped run are refused without touching the target.
    env.sender
        .send(EnvMessage::BlockOp {
            run,
            opcode: "motion_movesteps".into(),
            args: json!({"STEPS": 10}).as_object().cloned().unwrap(),
            token: Token(2),
        })
        .unwrap();
    assert_eq!(
        expect_host(&mut env, |m| matches!(m, HostMessage::ResultValue { .. })).await,
        HostMessage::ResultValue {
            token: Token(2),
            outcome: CallOutcome::Interrupted
        }
    );
    assert_eq!(cat.state().x, 0.0);

    env.sender.send(EnvMessage::EndOfThread { run }).unwrap();
    env.sender.send(EnvMessage::EndOfThread { run }).unwrap();
    runtime.wait_until_idle().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(threads[0].has_finished());

    let mut finished = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, RuntimeEvent::ThreadFinished { .. }) {
            finished += 1;
        }
    }
    assert_eq!(finished, 1);
}

#[tokio::test]
async fn unknown_opcode_is_reported_as_fault() {
    let (host, mut env) = channel_pair();
    let runtime = Runtime::new(RuntimeConfig::default(), host);
    runtime.add_target(flag_sprite("[]"));

    runtime.green_flag();
    let run = started_run(&mut env).await;
    env.sender
        .send(EnvMessage::BlockOp {
            run,
            opcode: "pen_clear".into(),
            args: Default::default(),
            token: Token(9),
        })
        .unwrap();

    match expect_host(&mut env, |m| matches!(m, HostMessage::ResultValue { .. })).await {
        HostMessage::ResultValue {
            token: Token(9),
            outcome: CallOutcome::Fault(message),
        } => assert_eq!(message, "Unknown opcode 'pen_clear'"),
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn closed_environment_releases_waiters() {
    let (host, mut env) = channel_pair();
    let runtime = Runtime::new(RuntimeConfig::default(), host);
    runtime.add_target(flag_sprite("[]"));

    let threads = runtime.green_flag();
    started_run(&mut env).await;
    drop(env);

    runtime.wait_for(&threads, Duration::from_secs(1)).await.unwrap();
    assert!(threads[0].is_interrupted());
    assert!(matches!(
        runtime.init().await,
        Err(RuntimeError::Channel(ChannelError::Closed))
    ));
}

#[tokio::test]
async fn scripts_run_over_an_ndjson_stream() {
    let (host_io, env_io) = tokio::io::duplex(64 * 1024);
    let (host_read, host_write) = tokio::io::split(host_io);
    let (env_read, env_write) = tokio::io::split(env_io);

    let env = serve_lines(BufReader::new(env_read), env_write);
    tokio::spawn(LocalEnvironment::new(env).run());
    let host = connect_lines(BufReader::new(host_read), host_write);

    let cat = flag_sprite(
        &json!([
            {"op": "call", "opcode": "motion_gotoxy", "args": {"X": 5, "Y": 5}},
            {"op": "repeat", "times": 2, "body": [
                {"op": "call", "opcode": "motion_changexby", "args": {"DX": 10}}
            ]}
        ])
        .to_string(),
    );
    let runtime = Runtime::new(RuntimeConfig::default(), host);
    runtime.add_target(cat.clone());
    runtime.load().await.unwrap();

    let threads = runtime.green_flag();
    runtime.wait_for(&threads, Duration::from_secs(5)).await.unwrap();

    let state = cat.state();
    assert_eq!((state.x, state.y), (25.0, 5.0));
    assert!(runtime.script_faults().is_empty());
}
