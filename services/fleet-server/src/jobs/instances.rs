//! Instance build and termination jobs.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use fleet_events::{InstanceBuild, InstanceTermination, RawEnvelope};
use fleet_reconcile::render_template;
use tracing::{debug, info, instrument, warn};

use crate::db::{generate_secret, BootstrapStore, FleetCache, Filter, InstanceProgressStore};
use crate::notify::{notify_best_effort, Notifier};
use crate::provider::{CloudProvider, RunInstancesRequest, Tags};
use crate::workers::{HandlerError, JobHandler};

/// Default init script. `{instance_build_url}` and `{auth}` let the script
/// report progress back to fleetd.
pub const DEFAULT_INIT_SCRIPT_TEMPLATE: &str = r#"#!/usr/bin/env bash
set -o errexit
set -o pipefail

report() {
  curl -fsSL -X PATCH -u '{auth}' \
    -H 'Content-Type: application/json' \
    -d "{\"state\":\"$1\"}" '{instance_build_url}'
}

report started
echo 'bootstrapping {role} for {site}/{env}/{queue}'
report finished
"#;

/// User data handed to the provider: fetch and run the init script.
const USER_DATA_TEMPLATE: &str = r#"#!/usr/bin/env bash
curl -fsSL -u '{auth}' '{init_script_url}' | bash
"#;

/// Renders init scripts and user data for a build.
#[derive(Debug, Clone)]
pub struct BootstrapRenderer {
    public_url: String,
    template: String,
}

impl BootstrapRenderer {
    pub fn new(public_url: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            template: template.into(),
        }
    }

    fn vars<'a>(&self, build: &'a InstanceBuild, secret: &str) -> BTreeMap<&'a str, String> {
        let id = build.id.to_string();
        let mut vars = BTreeMap::new();
        vars.insert("build_id", id.clone());
        vars.insert("auth", format!("{id}:{secret}"));
        vars.insert("public_url", self.public_url.clone());
        vars.insert(
            "instance_build_url",
            format!("{}/instance-builds/{id}", self.public_url),
        );
        vars.insert(
            "init_script_url",
            format!("{}/init-scripts/{id}", self.public_url),
        );
        vars.insert("role", build.role.clone());
        vars.insert("site", build.site.clone());
        vars.insert("env", build.env.clone());
        vars.insert("queue", build.queue.clone());
        vars
    }

    /// The init script served at `/init-scripts/{build_id}`.
    pub fn init_script(&self, build: &InstanceBuild, secret: &str) -> String {
        render_template(&self.template, &self.vars(build, secret))
    }

    /// Base64 user data pointing the instance at its init script.
    pub fn user_data(&self, build: &InstanceBuild, secret: &str) -> String {
        STANDARD.encode(render_template(USER_DATA_TEMPLATE, &self.vars(build, secret)))
    }
}

/// Instance name from a build's template.
pub fn instance_name(build: &InstanceBuild, instance_id: &str) -> String {
    let mut vars = BTreeMap::new();
    vars.insert("role", build.role.clone());
    vars.insert("site", build.site.clone());
    vars.insert("env", build.env.clone());
    vars.insert("queue", build.queue.clone());
    vars.insert("instance_id", instance_id.to_string());
    vars.insert(
        "instance_short",
        instance_id.trim_start_matches("i-").to_string(),
    );
    vars.insert("build_short", build.id.short());
    render_template(&build.name_template, &vars)
}

/// Provisions the instances of an [`InstanceBuild`].
///
/// Each step's result is recorded before the next starts, so a redelivered
/// build reuses its security group, secret and instances.
pub struct InstanceBuilder {
    provider: Arc<dyn CloudProvider>,
    cache: FleetCache,
    bootstrap: BootstrapStore,
    progress: InstanceProgressStore,
    notifier: Arc<dyn Notifier>,
    renderer: BootstrapRenderer,
}

impl InstanceBuilder {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        cache: FleetCache,
        bootstrap: BootstrapStore,
        progress: InstanceProgressStore,
        notifier: Arc<dyn Notifier>,
        renderer: BootstrapRenderer,
    ) -> Self {
        Self {
            provider,
            cache,
            bootstrap,
            progress,
            notifier,
            renderer,
        }
    }

    /// Newest active cached image for `role`.
    async fn resolve_image(&self, role: &str) -> Result<String, HandlerError> {
        let mut filter = Filter::new();
        filter.insert("role".to_string(), role.to_string());
        filter.insert("active".to_string(), "true".to_string());

        let images = self.cache.fetch_images(&filter).await?;
        images
            .into_iter()
            .max_by(|a, b| a.name.cmp(&b.name))
            .map(|image| image.id)
            .ok_or_else(|| HandlerError::Fatal(format!("no active image for role '{role}'")))
    }

    #[instrument(skip(self, build), fields(build_id = %build.id))]
    pub async fn build(&self, build: &InstanceBuild) -> Result<Vec<String>, HandlerError> {
        let progress = self.progress.load(&build.id).await?;

        // Resolved before any provider call so a build without an image creates nothing.
        let image_id = match (&progress.launched, build.ami.is_empty()) {
            (Some(_), _) => String::new(),
            (None, true) => self.resolve_image(&build.role).await?,
            (None, false) => build.ami.clone(),
        };

        let group_id = match progress.security_group {
            Some(group_id) => group_id,
            None => {
                let group_name = format!(
                    "{}-{}-{}-{}-{}",
                    build.role,
                    build.site,
                    build.env,
                    build.queue,
                    build.id.short()
                );
                let group_id = self
                    .provider
                    .create_security_group(&group_name, &format!("fleetd build {}", build.id))
                    .await?;
                self.progress
                    .record_security_group(&build.id, &group_id)
                    .await?;
                group_id
            }
        };

        let secret = match progress.secret {
            Some(secret) => secret,
            None => {
                let secret = generate_secret();
                self.progress.record_secret(&build.id, &secret).await?;
                secret
            }
        };

        // Once instances exist the bootstrap record is theirs to finish or expire.
        if progress.launched.is_none() {
            let script = self.renderer.init_script(build, &secret);
            self.bootstrap.store(&build.id, &secret, &script).await?;
        }

        if !build.boot_instance {
            info!("Bootstrap prepared, not booting instances");
            return Ok(Vec::new());
        }

        let instance_ids = match progress.launched {
            Some(ids) => {
                debug!(count = ids.len(), "Instances already launched, resuming");
                ids
            }
            None => {
                let ids = self
                    .provider
                    .run_instances(&RunInstancesRequest {
                        image_id: image_id.clone(),
                        instance_type: build.instance_type.clone(),
                        count: build.count,
                        security_group_ids: vec![group_id],
                        user_data: self.renderer.user_data(build, &secret),
                        client_token: build.id.to_string(),
                    })
                    .await?;
                self.progress.record_launched(&build.id, &ids).await?;
                info!(count = ids.len(), image_id = %image_id, "Instances launched");
                ids
            }
        };

        let mut names = Vec::with_capacity(instance_ids.len());
        for instance_id in &instance_ids {
            let name = instance_name(build, instance_id);
            let mut tags = Tags::new();
            tags.insert("Name".to_string(), name.clone());
            tags.insert("role".to_string(), build.role.clone());
            tags.insert("site".to_string(), build.site.clone());
            tags.insert("env".to_string(), build.env.clone());
            tags.insert("queue".to_string(), build.queue.clone());
            self.provider
                .create_tags(std::slice::from_ref(instance_id), &tags)
                .await?;
            names.push(name);
        }

        if !progress.notified {
            notify_best_effort(
                self.notifier.as_ref(),
                &build.slack_channel,
                &format!(
                    "Started {} instance(s) for build {} ({}/{}/{}): {}",
                    instance_ids.len(),
                    build.id,
                    build.site,
                    build.env,
                    build.queue,
                    names.join(", ")
                ),
            )
            .await;
            self.progress.record_notified(&build.id).await?;
        }

        Ok(instance_ids)
    }
}

#[async_trait]
impl JobHandler for InstanceBuilder {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let build: InstanceBuild = envelope.decode_arg()?;
        self.build(&build).await.map(|_| ())
    }
}

/// Terminates a single instance and drops it from the cache.
pub struct InstanceTerminator {
    provider: Arc<dyn CloudProvider>,
    cache: FleetCache,
    notifier: Arc<dyn Notifier>,
}

impl InstanceTerminator {
    pub fn new(
        provider: Arc<dyn CloudProvider>,
        cache: FleetCache,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provider,
            cache,
            notifier,
        }
    }

    #[instrument(skip(self, job), fields(instance_id = %job.instance_id))]
    pub async fn terminate(&self, job: &InstanceTermination) -> Result<(), HandlerError> {
        let ids = [job.instance_id.clone()];
        match self.provider.terminate_instances(&ids).await {
            Ok(()) => info!("Instance terminated"),
            Err(e) if e.is_domain() => warn!(error = %e, "Instance already gone"),
            Err(e) => return Err(e.into()),
        }

        self.cache.remove_instance(&job.instance_id).await?;

        notify_best_effort(
            self.notifier.as_ref(),
            &job.slack_channel,
            &format!("Terminated instance {}", job.instance_id),
        )
        .await;
        Ok(())
    }
}

#[async_trait]
impl JobHandler for InstanceTerminator {
    async fn handle(&self, envelope: &RawEnvelope) -> Result<(), HandlerError> {
        let job: InstanceTermination = envelope.decode_arg()?;
        self.terminate(&job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::notify::RecordingNotifier;
    use crate::provider::{FakeProvider, ProviderError};
    use chrono::Utc;
    use fleet_events::{BuildState, Image, Instance, DEFAULT_INSTANCE_NAME_TEMPLATE};
    use fleet_id::InstanceBuildId;
    use std::time::Duration;

    fn build(ami: &str) -> InstanceBuild {
        let now = Utc::now();
        InstanceBuild {
            id: InstanceBuildId::new(),
            site: "org".to_string(),
            env: "prod".to_string(),
            ami: ami.to_string(),
            instance_type: "c5.large".to_string(),
            count: 2,
            queue: "docker".to_string(),
            role: "worker".to_string(),
            state: BuildState::Pending,
            slack_channel: "#builds".to_string(),
            name_template: DEFAULT_INSTANCE_NAME_TEMPLATE.to_string(),
            boot_instance: true,
            created_at: now,
            updated_at: now,
        }
    }

    struct Fixture {
        db: Database,
        provider: Arc<FakeProvider>,
        notifier: Arc<RecordingNotifier>,
        builder: InstanceBuilder,
    }

    fn fixture() -> Fixture {
        let db = Database::in_memory();
        let provider = Arc::new(FakeProvider::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let builder = InstanceBuilder::new(
            provider.clone(),
            db.fleet_cache(),
            db.bootstrap(),
            db.instance_progress(),
            notifier.clone(),
            BootstrapRenderer::new("https://fleet.example.com/", DEFAULT_INIT_SCRIPT_TEMPLATE),
        );
        Fixture {
            db,
            provider,
            notifier,
            builder,
        }
    }

    #[test]
    fn test_instance_name_from_template() {
        let b = build("ami-1");
        assert_eq!(
            instance_name(&b, "i-0abc"),
            "worker-org-prod-docker-0abc"
        );
    }

    #[test]
    fn test_init_script_embeds_credentials_and_url() {
        let b = build("ami-1");
        let renderer =
            BootstrapRenderer::new("https://fleet.example.com", DEFAULT_INIT_SCRIPT_TEMPLATE);
        let script = renderer.init_script(&b, "s3cret");

        assert!(script.contains(&format!("'{}:s3cret'", b.id)));
        assert!(script.contains(&format!(
            "https://fleet.example.com/instance-builds/{}",
            b.id
        )));
        assert!(script.contains("worker for org/prod/docker"));
    }

    #[tokio::test]
    async fn test_build_launches_tags_and_stores_bootstrap() {
        let f = fixture();
        let b = build("ami-explicit");

        let ids = f.builder.build(&b).await.unwrap();
        assert_eq!(ids.len(), 2);

        let launched = f.provider.launched();
        assert_eq!(launched.len(), 1);
        assert_eq!(launched[0].image_id, "ami-explicit");
        assert_eq!(launched[0].count, 2);
        let user_data = String::from_utf8(STANDARD.decode(&launched[0].user_data).unwrap()).unwrap();
        assert!(user_data.contains(&format!("/init-scripts/{}", b.id)));

        let tagged = f.provider.tagged();
        assert_eq!(tagged.len(), 2);
        assert_eq!(tagged[0].1["role"], "worker");

        let secret = f.db.bootstrap().secret(&b.id).await.unwrap().unwrap();
        let script = f.db.bootstrap().script(&b.id).await.unwrap().unwrap();
        assert!(script.contains(&secret));

        assert_eq!(f.notifier.messages().len(), 1);
        assert_eq!(f.notifier.messages()[0].0, "#builds");
    }

    #[tokio::test]
    async fn test_redelivered_build_reuses_earlier_steps() {
        let f = fixture();
        let b = build("ami-1");
        f.provider
            .fail_next("create_tags", ProviderError::Transport("reset".into()));

        assert!(f.builder.build(&b).await.is_err());
        let secret = f.db.bootstrap().secret(&b.id).await.unwrap().unwrap();
        let first_launch = f.provider.launched();
        assert_eq!(first_launch.len(), 1);

        let ids = f.builder.build(&b).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(f.provider.call_count("create_security_group"), 1);
        assert_eq!(f.provider.call_count("run_instances"), 1);
        assert_eq!(
            f.db.bootstrap().secret(&b.id).await.unwrap().as_deref(),
            Some(secret.as_str())
        );
        let user_data =
            String::from_utf8(STANDARD.decode(&first_launch[0].user_data).unwrap()).unwrap();
        assert!(user_data.contains(&secret));
        assert_eq!(f.provider.tagged().len(), 2);
        assert_eq!(f.notifier.messages().len(), 1);

        // A further redelivery after success changes nothing.
        f.builder.build(&b).await.unwrap();
        assert_eq!(f.provider.call_count("run_instances"), 1);
        assert_eq!(f.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_launch_record_is_covered_by_client_token() {
        let f = fixture();
        let b = build("ami-1");

        let first = f.builder.build(&b).await.unwrap();
        assert_eq!(f.provider.launched()[0].client_token, b.id.to_string());

        // Progress lost between the launch and its record.
        f.db.kv()
            .transact(vec![crate::db::KvOp::hdel(
                format!("instance_build_progress:{}", b.id),
                "launched",
            )])
            .await
            .unwrap();
        let second = f.builder.build(&b).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.provider.launched().len(), 1);
    }

    #[tokio::test]
    async fn test_build_resolves_latest_active_image() {
        let f = fixture();
        let image = |id: &str, name: &str, active: bool| Image {
            id: id.to_string(),
            role: "worker".to_string(),
            active,
            name: name.to_string(),
            state: "available".to_string(),
        };
        f.db.fleet_cache()
            .store_images(
                &[
                    image("ami-old", "worker-2024-01", true),
                    image("ami-new", "worker-2024-06", true),
                    image("ami-off", "worker-2024-09", false),
                ],
                Duration::from_secs(600),
            )
            .await
            .unwrap();

        f.builder.build(&build("")).await.unwrap();
        assert_eq!(f.provider.launched()[0].image_id, "ami-new");
    }

    #[tokio::test]
    async fn test_build_without_image_fails() {
        let f = fixture();
        let err = f.builder.build(&build("")).await.unwrap_err();
        assert!(matches!(err, HandlerError::Fatal(_)));
        assert!(f.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_build_without_boot_only_prepares_bootstrap() {
        let f = fixture();
        let mut b = build("ami-1");
        b.boot_instance = false;

        assert!(f.builder.build(&b).await.unwrap().is_empty());
        assert!(f.provider.launched().is_empty());
        assert!(f.db.bootstrap().secret(&b.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_removes_from_cache() {
        let f = fixture();
        let instance = Instance {
            id: "i-1".to_string(),
            ..Default::default()
        };
        f.db.fleet_cache()
            .store_instances(&[instance], Duration::from_secs(600))
            .await
            .unwrap();
        f.provider
            .fail_next("terminate_instances", ProviderError::not_found("gone"));

        let terminator =
            InstanceTerminator::new(f.provider.clone(), f.db.fleet_cache(), f.notifier.clone());
        terminator
            .terminate(&InstanceTermination {
                instance_id: "i-1".to_string(),
                slack_channel: String::new(),
            })
            .await
            .unwrap();

        assert!(f.db.fleet_cache().get_instance("i-1").await.unwrap().is_none());
        assert_eq!(f.notifier.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_terminate_transient_failure_propagates() {
        let f = fixture();
        f.provider
            .fail_next("terminate_instances", ProviderError::Transport("reset".into()));
        let terminator =
            InstanceTerminator::new(f.provider.clone(), f.db.fleet_cache(), f.notifier.clone());

        let err = terminator
            .terminate(&InstanceTermination {
                instance_id: "i-1".to_string(),
                slack_channel: String::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Provider(_)));
    }
}
