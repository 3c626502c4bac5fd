//! In-memory provider for development and testing.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use fleet_events::{Image, Instance};
use tracing::info;

use super::{
    CloudProvider, CompleteLifecycleActionRequest, CreateGroupRequest, LifecycleHookRequest,
    MetricAlarmRequest, ProviderError, RunInstancesRequest, ScalingPolicyRequest, Tags,
};

#[derive(Default)]
struct FakeState {
    instances: Option<Vec<Instance>>,
    images: Option<Vec<Image>>,
    next_id: u64,
    calls: Vec<&'static str>,
    failures: HashMap<&'static str, VecDeque<ProviderError>>,
    launched: Vec<RunInstancesRequest>,
    launch_tokens: HashMap<String, Vec<String>>,
    tagged: Vec<(Vec<String>, Tags)>,
    terminated: Vec<String>,
    groups: Vec<CreateGroupRequest>,
    policies: Vec<ScalingPolicyRequest>,
    alarms: Vec<MetricAlarmRequest>,
    hooks: Vec<LifecycleHookRequest>,
    completed: Vec<CompleteLifecycleActionRequest>,
}

/// Provider that keeps everything in memory and records each call.
///
/// Failures can be scripted per operation with [`FakeProvider::fail_next`].
/// Operation names match the trait method names.
#[derive(Default)]
pub struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    /// Create a new fake provider with an empty fleet.
    pub fn new() -> Self {
        let provider = Self::default();
        {
            let mut state = provider.lock();
            state.instances = Some(Vec::new());
            state.images = Some(Vec::new());
        }
        provider
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the reported fleet. `None` means no snapshot is available.
    pub fn set_instances(&self, instances: Option<Vec<Instance>>) {
        self.lock().instances = instances;
    }

    /// Replace the reported images. `None` means no snapshot is available.
    pub fn set_images(&self, images: Option<Vec<Image>>) {
        self.lock().images = images;
    }

    /// Make the next call to `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: &'static str, err: ProviderError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// Every operation invoked, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| **c == op).count()
    }

    pub fn launched(&self) -> Vec<RunInstancesRequest> {
        self.lock().launched.clone()
    }

    pub fn tagged(&self) -> Vec<(Vec<String>, Tags)> {
        self.lock().tagged.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    pub fn groups(&self) -> Vec<CreateGroupRequest> {
        self.lock().groups.clone()
    }

    pub fn policies(&self) -> Vec<ScalingPolicyRequest> {
        self.lock().policies.clone()
    }

    pub fn alarms(&self) -> Vec<MetricAlarmRequest> {
        self.lock().alarms.clone()
    }

    pub fn hooks(&self) -> Vec<LifecycleHookRequest> {
        self.lock().hooks.clone()
    }

    pub fn completed(&self) -> Vec<CompleteLifecycleActionRequest> {
        self.lock().completed.clone()
    }

    /// Records the call and pops a scripted failure if one is queued.
    fn enter(&self, op: &'static str) -> Result<MutexGuard<'_, FakeState>, ProviderError> {
        let mut state = self.lock();
        state.calls.push(op);
        if let Some(err) = state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        Ok(state)
    }
}

fn next_id(state: &mut FakeState, prefix: &str) -> String {
    state.next_id += 1;
    format!("{prefix}-{:08x}", state.next_id)
}

#[async_trait]
impl CloudProvider for FakeProvider {
    async fn describe_instances(&self) -> Result<Option<Vec<Instance>>, ProviderError> {
        Ok(self.enter("describe_instances")?.instances.clone())
    }

    async fn describe_images(&self) -> Result<Option<Vec<Image>>, ProviderError> {
        Ok(self.enter("describe_images")?.images.clone())
    }

    async fn run_instances(
        &self,
        request: &RunInstancesRequest,
    ) -> Result<Vec<String>, ProviderError> {
        let mut state = self.enter("run_instances")?;
        if let Some(ids) = state.launch_tokens.get(&request.client_token) {
            info!(count = ids.len(), "[FAKE] Repeated launch token, returning earlier instances");
            return Ok(ids.clone());
        }
        let ids: Vec<String> = (0..request.count)
            .map(|_| next_id(&mut state, "i"))
            .collect();
        for id in &ids {
            let instance = Instance {
                id: id.clone(),
                instance_type: request.instance_type.clone(),
                image_id: request.image_id.clone(),
                ..Default::default()
            };
            state.instances.get_or_insert_with(Vec::new).push(instance);
        }
        state.launched.push(request.clone());
        if !request.client_token.is_empty() {
            state
                .launch_tokens
                .insert(request.client_token.clone(), ids.clone());
        }
        info!(count = ids.len(), "[FAKE] Launched instances");
        Ok(ids)
    }

    async fn create_tags(&self, resource_ids: &[String], tags: &Tags) -> Result<(), ProviderError> {
        let mut state = self.enter("create_tags")?;
        if let Some(instances) = state.instances.as_mut() {
            for instance in instances.iter_mut().filter(|i| resource_ids.contains(&i.id)) {
                for (k, v) in tags {
                    match k.as_str() {
                        "Name" => instance.name = v.clone(),
                        "role" => instance.role = v.clone(),
                        "site" => instance.site = v.clone(),
                        "env" => instance.env = v.clone(),
                        "queue" => instance.queue = v.clone(),
                        _ => {}
                    }
                }
            }
        }
        state.tagged.push((resource_ids.to_vec(), tags.clone()));
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), ProviderError> {
        let mut state = self.enter("terminate_instances")?;
        if let Some(instances) = state.instances.as_mut() {
            instances.retain(|i| !instance_ids.contains(&i.id));
        }
        state.terminated.extend(instance_ids.iter().cloned());
        info!(count = instance_ids.len(), "[FAKE] Terminated instances");
        Ok(())
    }

    async fn create_security_group(
        &self,
        _name: &str,
        _description: &str,
    ) -> Result<String, ProviderError> {
        let mut state = self.enter("create_security_group")?;
        Ok(next_id(&mut state, "sg"))
    }

    async fn create_autoscaling_group(
        &self,
        request: &CreateGroupRequest,
    ) -> Result<(), ProviderError> {
        self.enter("create_autoscaling_group")?
            .groups
            .push(request.clone());
        Ok(())
    }

    async fn put_scaling_policy(
        &self,
        request: &ScalingPolicyRequest,
    ) -> Result<String, ProviderError> {
        let mut state = self.enter("put_scaling_policy")?;
        state.policies.push(request.clone());
        Ok(format!(
            "arn:fake:autoscaling:policy/{}/{}",
            request.group_name, request.policy_name
        ))
    }

    async fn put_metric_alarm(&self, request: &MetricAlarmRequest) -> Result<(), ProviderError> {
        self.enter("put_metric_alarm")?.alarms.push(request.clone());
        Ok(())
    }

    async fn put_lifecycle_hook(
        &self,
        request: &LifecycleHookRequest,
    ) -> Result<(), ProviderError> {
        self.enter("put_lifecycle_hook")?.hooks.push(request.clone());
        Ok(())
    }

    async fn complete_lifecycle_action(
        &self,
        request: &CompleteLifecycleActionRequest,
    ) -> Result<(), ProviderError> {
        self.enter("complete_lifecycle_action")?
            .completed
            .push(request.clone());
        Ok(())
    }
}
