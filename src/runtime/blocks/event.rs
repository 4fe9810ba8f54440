//! Event blocks: hats and broadcasts

use serde_json::Value;
use std::sync::Arc;

use crate::runtime::Runtime;
use crate::runtime::error::PrimitiveResult;
use crate::runtime::hats::{HatMetadata, HatRequest};
use crate::runtime::primitives::{BlockPackage, BlockUtility, PrimitiveTable, string_arg};
use crate::runtime::protocol::Args;
use crate::runtime::target::{Script, Target};

/// Hat started by the green flag
pub const WHEN_FLAG_CLICKED: &str = "event_whenflagclicked";
/// Hat started by a key press
pub const WHEN_KEY_PRESSED: &str = "event_whenkeypressed";
/// Hat started by clicking a sprite
pub const WHEN_THIS_SPRITE_CLICKED: &str = "event_whenthisspriteclicked";
/// Hat started by a broadcast
pub const WHEN_BROADCAST_RECEIVED: &str = "event_whenbroadcastreceived";

/// `event_*` opcodes
pub struct EventBlocks;

impl BlockPackage for EventBlocks {
    fn name(&self) -> &'static str {
        "event"
    }

    fn register(&self, table: &mut PrimitiveTable) {
        table.register("event_broadcast", broadcast);
        table.register("event_broadcastandwait", broadcast_and_wait);

        table.register_hat(WHEN_FLAG_CLICKED, HatMetadata::RESTART);
        table.register_hat(WHEN_KEY_PRESSED, HatMetadata::SKIP);
        table.register_hat(WHEN_THIS_SPRITE_CLICKED, HatMetadata::RESTART);
        table.register_hat(WHEN_BROADCAST_RECEIVED, HatMetadata::RESTART);
        table.register_edge_hat("event_whengreaterthan", Arc::new(when_greater_than));
    }
}

fn broadcast_request(args: &Args) -> PrimitiveResult<HatRequest> {
    let name = string_arg(args, "BROADCAST_OPTION")?;
    Ok(HatRequest::new(WHEN_BROADCAST_RECEIVED).field("BROADCAST_OPTION", name))
}

async fn broadcast(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    util.start_hats(broadcast_request(&args)?);
    Ok(Value::Null)
}

async fn broadcast_and_wait(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let started = util.start_hats(broadcast_request(&args)?);
    util.wait_for_threads(&started).await;
    Ok(Value::Null)
}

/// `WHENGREATERTHANMENU` selects the sensed value, `VALUE` the threshold.
fn when_greater_than(script: &Script, _target: &Target, runtime: &Runtime) -> bool {
    let threshold = script
        .fields
        .get("VALUE")
        .and_then(|value| value.trim().parse::<f64>().ok())
        .unwrap_or(0.0);
    let sensed = match script.fields.get("WHENGREATERTHANMENU") {
        Some(menu) if menu.eq_ignore_ascii_case("timer") => runtime.timer_seconds(),
        Some(menu) => runtime
            .io_value(&menu.to_lowercase())
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0),
        None => return false,
    };
    sensed > threshold
}
