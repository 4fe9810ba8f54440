//! Motion blocks

use serde_json::{Value, json};

use crate::runtime::error::PrimitiveResult;
use crate::runtime::primitives::{BlockPackage, BlockUtility, PrimitiveTable, number_arg};
use crate::runtime::protocol::Args;

/// `motion_*` opcodes
pub struct MotionBlocks;

impl BlockPackage for MotionBlocks {
    fn name(&self) -> &'static str {
        "motion"
    }

    fn register(&self, table: &mut PrimitiveTable) {
        table.register("motion_movesteps", move_steps);
        table.register("motion_gotoxy", go_to_xy);
        table.register("motion_changexby", change_x_by);
        table.register("motion_setx", set_x);
        table.register("motion_turnright", turn_right);
        table.register("motion_glidesecstoxy", glide_to_xy);
    }
}

/// Wrap a heading into [-179, 181)
fn wrap_direction(direction: f64) -> f64 {
    (direction + 179.0).rem_euclid(360.0) - 179.0
}

async fn move_steps(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let steps = number_arg(&args, "STEPS")?;
    util.target().with_state(|state| {
        let radians = (90.0 - state.direction).to_radians();
        state.x += steps * radians.cos();
        state.y += steps * radians.sin();
    });
    Ok(Value::Null)
}

async fn go_to_xy(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let x = number_arg(&args, "X")?;
    let y = number_arg(&args, "Y")?;
    util.target().with_state(|state| {
        state.x = x;
        state.y = y;
    });
    Ok(Value::Null)
}

async fn change_x_by(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let dx = number_arg(&args, "DX")?;
    util.target().with_state(|state| state.x += dx);
    Ok(Value::Null)
}

async fn set_x(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let x = number_arg(&args, "X")?;
    util.target().with_state(|state| state.x = x);
    Ok(Value::Null)
}

async fn turn_right(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let degrees = number_arg(&args, "DEGREES")?;
    util.target()
        .with_state(|state| state.direction = wrap_direction(state.direction + degrees));
    Ok(Value::Null)
}

/// Multi-tick: stays in `YieldTick` until the glide duration has elapsed.
async fn glide_to_xy(args: Args, util: BlockUtility) -> PrimitiveResult<Value> {
    let seconds = number_arg(&args, "SECS")?;
    let end_x = number_arg(&args, "X")?;
    let end_y = number_arg(&args, "Y")?;

    let origin = util.target().state();
    let start_x = util
        .frame_value("glide_start_x", || json!(origin.x))
        .as_f64()
        .unwrap_or(origin.x);
    let start_y = util
        .frame_value("glide_start_y", || json!(origin.y))
        .as_f64()
        .unwrap_or(origin.y);

    let progress = util.timed(seconds);
    util.target().with_state(|state| {
        state.x = start_x + (end_x - start_x) * progress;
        state.y = start_y + (end_y - start_y) * progress;
    });
    Ok(Value::Null)
}
