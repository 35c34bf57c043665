//! Stage graph: construction, validation, and the checkpointing executor.

pub mod builder;
pub mod executor;

pub use builder::{EdgeCondition, GraphBuilder, NodeDef, ReviewLoop, StageGraph};
pub use executor::{GraphExecutor, RunOutcome};
