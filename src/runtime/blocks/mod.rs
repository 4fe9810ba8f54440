//! Built-in block packages

pub mod control;
pub mod event;
pub mod motion;

use super::primitives::{BlockPackage, PrimitiveTable};

pub use control::ControlBlocks;
pub use event::EventBlocks;
pub use motion::MotionBlocks;

/// Table holding every built-in package
pub fn builtin_table() -> PrimitiveTable {
    let packages: [&dyn BlockPackage; 3] = [&ControlBlocks, &EventBlocks, &MotionBlocks];
    PrimitiveTable::from_packages(&packages)
}
