pub mod collection;
pub mod worker;

pub use collection::WorkerPool;
pub use worker::{Worker, WorkerStatus};
