//! Job envelope - the common wrapper for all queued jobs.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::EventError;

/// A job kind known at compile time.
///
/// The class names the handler contract and the queue names where producers
/// push it. Payloads must round-trip through JSON unchanged.
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Job class recorded in the envelope.
    const CLASS: &'static str;

    /// Queue the job is pushed onto.
    const QUEUE: &'static str;

    /// Caller-supplied job id, usually the id of the entity the job acts on.
    fn job_id(&self) -> String;
}

/// The job envelope.
///
/// Wire-compatible with sidekiq-style workers: `args` is a list even though
/// fleetd always enqueues exactly one argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope<T> {
    /// Job class (see [`Job::CLASS`]).
    pub class: String,

    /// Job arguments.
    pub args: Vec<T>,

    /// Queue this envelope was pushed onto.
    pub queue: String,

    /// Caller-supplied id. Not unique.
    #[serde(rename = "jid")]
    pub job_id: String,

    /// Whether a failed run is redelivered.
    pub retry: bool,

    /// Unix seconds with sub-second precision.
    pub enqueued_at: f64,

    /// Number of redeliveries so far.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Current time as fractional unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

impl<T: Job> JobEnvelope<T> {
    /// Wraps a job payload, stamped now, with retries enabled.
    pub fn for_job(job: T) -> Self {
        Self {
            class: T::CLASS.to_string(),
            job_id: job.job_id(),
            args: vec![job],
            queue: T::QUEUE.to_string(),
            retry: true,
            enqueued_at: unix_now(),
            retry_count: 0,
        }
    }
}

impl<T> JobEnvelope<T> {
    /// Sets the retry flag.
    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }

    /// Returns the first argument, if any.
    pub fn first_arg(&self) -> Option<&T> {
        self.args.first()
    }

    /// Consumes the envelope and returns its first argument.
    pub fn into_arg(self) -> Result<T, EventError> {
        let job_id = self.job_id;
        self.args
            .into_iter()
            .next()
            .ok_or(EventError::MissingArgument { job_id })
    }
}

impl<T: Clone> JobEnvelope<T> {
    /// Copy of this envelope for redelivery: same payload and id, bumped
    /// retry count, fresh timestamp.
    pub fn redelivery(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            enqueued_at: unix_now(),
            ..self.clone()
        }
    }
}

impl<T: Serialize> JobEnvelope<T> {
    /// Serializes the envelope to the JSON stored on a queue.
    pub fn to_payload(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Converts typed arguments to untyped JSON values.
    pub fn into_raw(self) -> Result<RawEnvelope, EventError> {
        let args = self
            .args
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(JobEnvelope {
            class: self.class,
            args,
            queue: self.queue,
            job_id: self.job_id,
            retry: self.retry,
            enqueued_at: self.enqueued_at,
            retry_count: self.retry_count,
        })
    }
}

/// Envelope whose arguments have not been decoded yet.
pub type RawEnvelope = JobEnvelope<serde_json::Value>;

impl RawEnvelope {
    /// Parses a queue payload.
    pub fn from_payload(payload: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Decodes the first argument as a typed job.
    pub fn decode_arg<U: DeserializeOwned>(&self) -> Result<U, EventError> {
        let arg = self.first_arg().ok_or_else(|| EventError::MissingArgument {
            job_id: self.job_id.clone(),
        })?;
        Ok(U::deserialize(arg)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceLifecycleTransition, Transition};

    fn transition() -> InstanceLifecycleTransition {
        InstanceLifecycleTransition {
            instance_id: "i-001".to_string(),
            transition: Transition::Launching,
        }
    }

    #[test]
    fn test_for_job_fills_metadata() {
        let env = JobEnvelope::for_job(transition());
        assert_eq!(env.class, InstanceLifecycleTransition::CLASS);
        assert_eq!(env.queue, "instance-lifecycle-transitions");
        assert_eq!(env.job_id, "i-001");
        assert!(env.retry);
        assert_eq!(env.retry_count, 0);
        assert!(env.enqueued_at > 1_600_000_000.0);
    }

    #[test]
    fn test_payload_uses_jid_and_omits_zero_retry_count() {
        let payload = JobEnvelope::for_job(transition()).to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["jid"], "i-001");
        assert!(value.get("retry_count").is_none());
        assert_eq!(value["args"][0]["transition"], "launching");
    }

    #[test]
    fn test_raw_decode() {
        let payload = JobEnvelope::for_job(transition()).to_payload().unwrap();
        let raw = RawEnvelope::from_payload(&payload).unwrap();
        let job: InstanceLifecycleTransition = raw.decode_arg().unwrap();
        assert_eq!(job, transition());
    }

    #[test]
    fn test_decode_without_args_fails() {
        let raw: RawEnvelope = serde_json::from_str(
            r#"{"class":"X","args":[],"queue":"q","jid":"j","retry":false,"enqueued_at":1.5}"#,
        )
        .unwrap();
        let err = raw.decode_arg::<InstanceLifecycleTransition>().unwrap_err();
        assert!(matches!(err, EventError::MissingArgument { .. }));
    }

    #[test]
    fn test_redelivery_bumps_count_only() {
        let env = JobEnvelope::for_job(transition());
        let again = env.redelivery().redelivery();
        assert_eq!(again.retry_count, 2);
        assert_eq!(again.args, env.args);
        assert_eq!(again.job_id, env.job_id);
    }
}
