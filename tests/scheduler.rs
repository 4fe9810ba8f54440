use patchvm::runtime::events::RuntimeEvent;
use patchvm::runtime::hats::HatRequest;
use patchvm::{Runtime, RuntimeConfig, RuntimeError, Script, Sprite, Target, ThreadStatus};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn call(opcode: &str, args: Value) -> Value {
    json!({"op": "call", "opcode": opcode, "args": args})
}

fn script(hat: &str, body: Value) -> Script {
    Script::new(hat, body.to_string())
}

fn sprite(name: &str, scripts: Vec<Script>) -> Arc<Target> {
    let mut sprite = Sprite::new(name);
    for script in scripts {
        sprite = sprite.with_script(script);
    }
    Arc::new(Target::new(Arc::new(sprite)))
}

async fn loaded(targets: &[Arc<Target>]) -> Runtime {
    let runtime = Runtime::with_local_environment(RuntimeConfig::default());
    for target in targets {
        runtime.add_target(target.clone());
    }
    runtime.load().await.unwrap();
    runtime
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn stop_this_script_skips_remaining_statements() {
    let cat = sprite(
        "Cat",
        vec![script(
            "event_whenflagclicked",
            json!([
                call("motion_movesteps", json!({"STEPS": 10})),
                call("control_stop", json!({"STOP_OPTION": "this script"})),
                call("motion_movesteps", json!({"STEPS": 10})),
            ]),
        )],
    );
    let runtime = loaded(&[cat.clone()]).await;

    let threads = runtime.green_flag();
    assert_eq!(threads.len(), 1);
    runtime.wait_for(&threads, WAIT).await.unwrap();

    assert_eq!(cat.state().x, 10.0);
    assert!(threads[0].is_interrupted());
}

#[tokio::test]
async fn restarting_hat_keeps_thread_identity_and_position() {
    let long_wait = json!([call("control_wait", json!({"DURATION": 10}))]);
    let a = sprite("A", vec![script("event_whenflagclicked", long_wait.clone())]);
    let b = sprite("B", vec![script("event_whenflagclicked", long_wait)]);
    let runtime = loaded(&[a, b]).await;

    let first = runtime.start_hats(HatRequest::new("event_whenflagclicked"));
    let ids = runtime.thread_ids();
    let second = runtime.start_hats(HatRequest::new("event_whenflagclicked"));

    assert_eq!(ids.len(), 2);
    assert_eq!(runtime.thread_ids(), ids);
    for (old, new) in first.iter().zip(&second) {
        assert_eq!(old.id(), new.id());
        assert_ne!(old.run(), new.run());
        assert!(old.is_interrupted());
    }

    runtime.stop_all();
    assert_eq!(runtime.thread_count(), 0);
    runtime.wait_until_idle().await.unwrap();
}

#[tokio::test]
async fn non_restarting_hat_does_not_duplicate_a_running_thread() {
    let cat = sprite(
        "Cat",
        vec![
            script("event_whenkeypressed", json!([call("control_wait", json!({"DURATION": 10}))]))
                .with_field("KEY_OPTION", "space"),
        ],
    );
    let runtime = loaded(&[cat]).await;

    assert_eq!(runtime.key_pressed("space").len(), 1);
    assert!(runtime.key_pressed("SPACE").is_empty());
    assert_eq!(runtime.thread_count(), 1);

    runtime.stop_all();
    runtime.wait_until_idle().await.unwrap();
}

#[tokio::test]
async fn two_key_hats_both_move_the_target() {
    let step = json!([call("motion_movesteps", json!({"STEPS": 10}))]);
    let cat = sprite(
        "Cat",
        vec![
            script("event_whenkeypressed", step.clone()).with_field("KEY_OPTION", "a"),
            script("event_whenkeypressed", step).with_field("KEY_OPTION", "b"),
        ],
    );
    let runtime = loaded(&[cat.clone()]).await;

    let mut threads = runtime.key_pressed("A");
    threads.extend(runtime.key_pressed("B"));
    assert_eq!(threads.len(), 2);
    runtime.wait_for(&threads, WAIT).await.unwrap();

    assert_eq!(cat.state().x, 20.0);
}

#[tokio::test]
async fn stop_all_mid_run_keeps_only_completed_moves() {
    let body = json!([
        call("motion_movesteps", json!({"STEPS": 10})),
        call("control_wait", json!({"DURATION": 10})),
        call("motion_movesteps", json!({"STEPS": 10})),
    ]);
    let a = sprite("A", vec![script("event_whenflagclicked", body.clone())]);
    let b = sprite("B", vec![script("event_whenflagclicked", body)]);
    let runtime = loaded(&[a.clone(), b.clone()]).await;

    runtime.green_flag();
    eventually("both targets to move", || a.state().x == 10.0 && b.state().x == 10.0).await;

    runtime.stop_all();
    assert_eq!(runtime.thread_count(), 0);
    runtime.wait_until_idle().await.unwrap();

    assert_eq!(a.state().x, 10.0);
    assert_eq!(b.state().x, 10.0);
}

#[tokio::test]
async fn clone_block_starts_clone_hat_on_the_clone_only() {
    let cat = sprite(
        "Cat",
        vec![
            script(
                "event_whenflagclicked",
                json!([call("control_create_clone_of", json!({"CLONE_OPTION": "_myself_"}))]),
            ),
            script(
                "control_start_as_clone",
                json!([call("motion_movesteps", json!({"STEPS": 10}))]),
            ),
        ],
    );
    let runtime = loaded(&[cat.clone()]).await;

    runtime.green_flag();
    eventually("the clone to exist", || runtime.clone_count() == 1).await;
    runtime.wait_until_idle().await.unwrap();

    let targets = runtime.targets();
    assert_eq!(targets.len(), 2);
    // The clone sits directly behind its source.
    assert!(!targets[0].is_original());
    assert_eq!(targets[0].state().x, 10.0);
    assert_eq!(cat.state().x, 0.0);
}

#[tokio::test]
async fn delete_this_clone_disposes_and_frees_the_slot() {
    let cat = sprite(
        "Cat",
        vec![script(
            "control_start_as_clone",
            json!([
                call("control_delete_this_clone", json!({})),
                call("motion_movesteps", json!({"STEPS": 10})),
            ]),
        )],
    );
    let runtime = loaded(&[cat.clone()]).await;

    let clone = runtime.create_clone(cat.id()).unwrap();
    eventually("the clone to delete itself", || runtime.clone_count() == 0).await;
    runtime.wait_until_idle().await.unwrap();

    assert!(clone.is_disposed());
    assert_eq!(clone.state().x, 0.0);
    assert_eq!(runtime.target_count(), 1);
    assert!(!runtime.delete_clone(cat.id()));
}

#[tokio::test]
async fn unknown_opcode_faults_only_its_own_thread() {
    let cat = sprite(
        "Cat",
        vec![
            script("event_whenflagclicked", json!([call("looks_sayforsecs", json!({}))])),
            script(
                "event_whenflagclicked",
                json!([call("motion_movesteps", json!({"STEPS": 10}))]),
            ),
        ],
    );
    let runtime = loaded(&[cat.clone()]).await;
    let mut events = runtime.subscribe();

    let threads = runtime.green_flag();
    runtime.wait_for(&threads, WAIT).await.unwrap();

    assert_eq!(cat.state().x, 10.0);
    let faults = runtime.script_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].thread, threads[0].id());
    assert_eq!(faults[0].position, Some(0));
    assert!(faults[0].message.contains("Unknown opcode 'looks_sayforsecs'"));

    let mut seen = false;
    while let Ok(event) = events.try_recv() {
        seen |= matches!(event, RuntimeEvent::ScriptFault(_));
    }
    assert!(seen);

    runtime.clear_faults();
    assert!(runtime.script_faults().is_empty());
}

#[tokio::test]
async fn raised_fault_is_recorded_with_position() {
    let cat = sprite(
        "Cat",
        vec![script(
            "event_whenflagclicked",
            json!([
                call("motion_movesteps", json!({"STEPS": 5})),
                {"op": "raise", "message": "boom"},
                call("motion_movesteps", json!({"STEPS": 5})),
            ]),
        )],
    );
    let runtime = loaded(&[cat.clone()]).await;

    let threads = runtime.green_flag();
    runtime.wait_for(&threads, WAIT).await.unwrap();

    assert_eq!(cat.state().x, 5.0);
    let faults = runtime.script_faults();
    assert_eq!(faults[0].message, "boom");
    assert_eq!(faults[0].position, Some(1));
}

#[tokio::test]
async fn edge_activated_hat_fires_on_rising_edge_only() {
    let cat = sprite(
        "Cat",
        vec![
            script(
                "event_whengreaterthan",
                json!([call("motion_movesteps", json!({"STEPS": 10}))]),
            )
            .with_field("WHENGREATERTHANMENU", "LOUDNESS")
            .with_field("VALUE", "10"),
        ],
    );
    let runtime = loaded(&[cat.clone()]).await;

    runtime.set_io_value("loudness", json!(5));
    runtime.step();
    assert_eq!(runtime.thread_count(), 0);

    runtime.set_io_value("loudness", json!(20));
    runtime.step();
    assert_eq!(runtime.thread_count(), 1);
    runtime.wait_until_idle().await.unwrap();
    assert_eq!(cat.state().x, 10.0);

    // Still above the threshold: no new edge.
    runtime.step();
    runtime.wait_until_idle().await.unwrap();
    assert_eq!(runtime.thread_count(), 0);
    assert_eq!(cat.state().x, 10.0);

    runtime.set_io_value("loudness", json!(0));
    runtime.step();
    runtime.set_io_value("loudness", json!(30));
    runtime.step();
    runtime.wait_until_idle().await.unwrap();
    assert_eq!(cat.state().x, 20.0);
}

#[tokio::test]
async fn broadcast_and_wait_returns_after_receivers_finish() {
    let sender = sprite(
        "Sender",
        vec![script(
            "event_whenflagclicked",
            json!([
                call("event_broadcastandwait", json!({"BROADCAST_OPTION": "go"})),
                call("motion_movesteps", json!({"STEPS": 1})),
            ]),
        )],
    );
    let receiver = sprite(
        "Receiver",
        vec![
            script(
                "event_whenbroadcastreceived",
                json!([
                    call("control_wait", json!({"DURATION": 0.05})),
                    call("motion_setx", json!({"X": 100})),
                ]),
            )
            .with_field("BROADCAST_OPTION", "Go"),
        ],
    );
    let runtime = loaded(&[sender.clone(), receiver.clone()]).await;

    let threads = runtime.green_flag();
    assert_eq!(threads.len(), 1);
    runtime.wait_for(&threads, WAIT).await.unwrap();

    assert_eq!(sender.state().x, 1.0);
    assert_eq!(receiver.state().x, 100.0);
}

#[tokio::test]
async fn ticker_reaps_finished_threads() {
    let cat = sprite(
        "Cat",
        vec![script(
            "event_whenflagclicked",
            json!([
                {"op": "repeat", "times": 3, "body": [call("motion_changexby", json!({"DX": 2}))]},
            ]),
        )],
    );
    let runtime = loaded(&[cat.clone()]).await;
    runtime.start();

    let threads = runtime.green_flag();
    runtime.wait_for(&threads, WAIT).await.unwrap();
    assert_eq!(cat.state().x, 6.0);

    eventually("the finished thread to be reaped", || runtime.thread_count() == 0).await;
    assert!(runtime.tick_stats().ticks > 0);
    runtime.quit();
}

#[tokio::test]
async fn toggle_script_runs_alongside_hat_thread() {
    let flag = script(
        "event_whenflagclicked",
        json!([call("control_wait", json!({"DURATION": 10}))]),
    );
    let script_id = flag.id;
    let cat = sprite("Cat", vec![flag]);
    let runtime = loaded(&[cat.clone()]).await;

    let clicked = runtime.toggle_script(cat.id(), script_id, false).unwrap().unwrap();
    assert!(clicked.is_stack_click());

    // Toggling a running script stops it.
    assert!(runtime.toggle_script(cat.id(), script_id, false).unwrap().is_none());
    assert!(clicked.is_interrupted());
    assert_eq!(runtime.thread_count(), 0);

    runtime.green_flag();
    assert_eq!(runtime.threads_for_target(cat.id()).len(), 1);

    let err = runtime
        .toggle_script(cat.id(), patchvm::runtime::target::ScriptId(u64::MAX), false)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ScriptNotFound(_)));

    runtime.stop_all();
    runtime.wait_until_idle().await.unwrap();
}

#[tokio::test]
async fn glide_occupies_several_ticks_then_lands() {
    let cat = sprite("Cat", vec![]);
    let runtime = loaded(&[cat.clone()]).await;

    let started = tokio::time::Instant::now();
    runtime
        .exec_block_primitive(
            cat.id(),
            "motion_glidesecstoxy",
            json!({"SECS": 0.05, "X": 100, "Y": 50})
                .as_object()
                .cloned()
                .unwrap(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(50));
    let state = cat.state();
    assert_eq!((state.x, state.y), (100.0, 50.0));
}

#[tokio::test]
async fn host_primitive_call_publishes_redraw_without_ticker() {
    let cat = sprite("Cat", vec![]);
    let runtime = loaded(&[cat.clone()]).await;
    let mut events = runtime.subscribe();

    runtime
        .exec_block_primitive(
            cat.id(),
            "motion_setx",
            json!({"X": 30}).as_object().cloned().unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(cat.state().x, 30.0);
    let mut redraws = 0;
    while let Ok(event) = events.try_recv() {
        if event == RuntimeEvent::Redraw {
            redraws += 1;
        }
    }
    assert_eq!(redraws, 1);
    assert_eq!(runtime.tick_stats().ticks, 0);
}

#[tokio::test]
async fn thread_status_is_idle_between_calls() {
    let cat = sprite(
        "Cat",
        vec![script(
            "event_whenflagclicked",
            json!([
                call("motion_movesteps", json!({"STEPS": 10})),
                call("control_wait", json!({"DURATION": 10})),
            ]),
        )],
    );
    let runtime = loaded(&[cat.clone()]).await;

    let threads = runtime.green_flag();
    eventually("the wait to begin", || threads[0].status() == ThreadStatus::YieldTick).await;
    assert_eq!(runtime.get_thread_by_id(threads[0].id()).unwrap().run(), threads[0].run());

    runtime.stop_all();
    runtime.wait_until_idle().await.unwrap();
    assert_eq!(threads[0].status(), ThreadStatus::Done);
}

#[tokio::test]
async fn compile_error_surfaces_from_registration() {
    let cat = sprite("Cat", vec![Script::new("event_whenflagclicked", "not json")]);
    let runtime = Runtime::with_local_environment(RuntimeConfig::default());
    runtime.add_target(cat);

    let err = runtime.load().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Compile { .. }));
    assert!(!err.is_channel_fatal());
}
