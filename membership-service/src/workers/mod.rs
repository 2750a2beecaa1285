pub mod pool;
pub mod reconciliation;

pub use pool::PropagationPool;
pub use reconciliation::{CycleReport, ReconciliationWorker};
