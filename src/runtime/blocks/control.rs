//! Control blocks: waits, stops, and clones

use serde_json::Value;

use crate::runtime::error::{PrimitiveError, PrimitiveResult};
use crate::runtime::hats::HatMetadata;
use crate::runtime::primitives::{
    BlockPackage, BlockUtility, PrimitiveTable, number_arg, string_arg,
};
use crate::runtime::protocol::Args;

/// Hat fired on a freshly created clone
pub const START_AS_CLONE: &str = "control_start_as_clone";

/// `control_*` opcodes
pub struct ControlBlocks;

impl BlockPackage for ControlBlocks {
    fn name(&self) -> &'static str {
        "control"
    }

    fn register(&self, table: &mut PrimitiveTable) {
        table.register("control_wait", wait);
        table.register("control_stop", stop);
        table.register("control_create_clone_of", create_clone_of);
        table.register("control_delete_this_clone", delete_this_clone);
        table.register_hat(START_AS_CLONE, HatMetadata::SKIP);
    }
}

async fn wait(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let seconds = number_arg(&args, "DURATION")?;
    util.timed(seconds);
    Ok(Value::Null)
}

async fn stop(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let option = string_arg(&args, "STOP_OPTION")?;
    match option.to_lowercase().as_str() {
        "all" => util.stop_all(),
        "this" | "this script" => util.stop_this_script(),
        "other" | "other scripts in sprite" | "other scripts in stage" => {
            util.stop_other_target_threads()
        }
        _ => {
            return Err(PrimitiveError::InvalidArgument {
                name: "STOP_OPTION".into(),
                detail: format!("unknown stop option '{}'", option),
            });
        }
    }
    Ok(Value::Null)
}

async fn create_clone_of(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let name = string_arg(&args, "CLONE_OPTION")?;
    if util.create_clone(&name).is_none() {
        tracing::debug!(source = %name, "clone not created");
    }
    Ok(Value::Null)
}

async fn delete_this_clone(_args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    util.delete_this_clone();
    Ok(Value::Null)
}
