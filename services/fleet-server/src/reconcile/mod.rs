//! Reconciliation: the periodic loop and lifecycle transition handling.

mod lifecycle;
mod periodic;

pub use lifecycle::{
    IngestOutcome, LifecycleIngest, LifecycleNotification, LifecycleReconciler,
    EXPECTED_STATE_DOWN, TEST_NOTIFICATION_EVENT,
};
pub use periodic::{Ec2Sync, Keepalive, PeriodicJob, ReconciliationLoop, TickReport};
