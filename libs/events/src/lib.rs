//! # fleet-events
//!
//! Wire types shared by the fleetd HTTP surface, the job queue, and the
//! workers.
//!
//! ## Job Envelope
//!
//! Every queued job travels inside a [`JobEnvelope`], a sidekiq-compatible
//! JSON wrapper carrying:
//! - the job class and target queue
//! - a caller-supplied `jid` (frequently a domain id, not unique)
//! - the `retry` flag that governs redelivery after a failure
//! - `enqueued_at` as fractional unix seconds
//!
//! ## Job Kinds
//!
//! Job kinds are fixed at compile time through the [`Job`] trait:
//! - `InstanceBuild` on `instance-builds`
//! - `InstanceTermination` on `instance-terminations`
//! - `InstanceLifecycleTransition` on `instance-lifecycle-transitions`
//! - `AutoscalingGroupBuild` on `autoscaling-group-builds`
//! - `SnsSubscriptionConfirmation` on `sns-messages`

mod envelope;
mod error;
mod types;

pub use envelope::*;
pub use error::EventError;
pub use types::*;
