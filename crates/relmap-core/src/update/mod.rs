//! Update pipeline: pending entries to modification commands, batches and results.

mod batch;
mod command;
mod executor;

pub use batch::{BatchPreparer, ModificationCommandBatch};
pub use command::{
    ColumnModification, CommandShape, EntityEntry, EntityState, ModificationCommand,
    ModificationOperation, ParameterNameGenerator, PropertyEntry, ResultSetMapping,
};
pub use executor::BatchExecutor;
