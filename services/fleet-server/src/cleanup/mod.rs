//! Background purge of expired store keys.

mod worker;

pub use worker::{CleanupWorker, CleanupWorkerConfig};
