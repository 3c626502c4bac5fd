use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_reconcile::DEFAULT_RECONCILE_INTERVAL;

use crate::db::{StoreConfig, DEFAULT_MAX_RETRIES, DEFAULT_TTL};
use crate::jobs::DEFAULT_INIT_SCRIPT_TEMPLATE;

/// Queues served when `FLEET_QUEUES` is unset.
pub const DEFAULT_QUEUES: &str = "instance-builds:2,instance-terminations:2,\
instance-lifecycle-transitions:4,autoscaling-group-builds:1,sns-messages:1";

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Gateway base URL. `None` selects the in-memory fake.
    pub url: Option<String>,
    pub region: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// `None` disables notifications.
    pub webhook_url: Option<String>,
    pub channel: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Externally reachable base URL, used in init scripts and keepalive.
    pub public_url: String,
    pub log_level: String,
    pub dev_mode: bool,
    pub auth_token: String,
    pub store: StoreConfig,
    /// Queue name to consumer count.
    pub queues: BTreeMap<String, usize>,
    pub sync_interval: Duration,
    pub provider: ProviderConfig,
    pub slack: SlackConfig,
    pub init_script_template: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr: SocketAddr = var("FLEET_LISTEN_ADDR")
            .unwrap_or_else(|| "127.0.0.1:9292".to_string())
            .parse()
            .context("invalid FLEET_LISTEN_ADDR")?;

        let public_url = var("FLEET_PUBLIC_URL")
            .unwrap_or_else(|| format!("http://{listen_addr}"))
            .trim_end_matches('/')
            .to_string();

        let log_level = var("FLEET_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let dev_mode = var("FLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let Some(auth_token) = var("FLEET_AUTH_TOKEN") else {
            bail!("FLEET_AUTH_TOKEN must be set");
        };

        let default_ttl = match var("FLEET_CACHE_TTL_SECS") {
            Some(v) => parse_positive_secs("FLEET_CACHE_TTL_SECS", &v)?,
            None => DEFAULT_TTL,
        };
        let max_retries = match var("FLEET_MAX_RETRIES") {
            Some(v) => v.parse().context("invalid FLEET_MAX_RETRIES")?,
            None => DEFAULT_MAX_RETRIES,
        };
        let store = StoreConfig {
            url: var("FLEET_STORE_URL").unwrap_or_else(|| "memory://".to_string()),
            default_ttl,
            max_retries,
            ..StoreConfig::default()
        };

        let queues = parse_queues(
            &var("FLEET_QUEUES").unwrap_or_else(|| DEFAULT_QUEUES.to_string()),
        )?;

        let sync_interval = match var("FLEET_SYNC_INTERVAL_SECS") {
            Some(v) => parse_positive_secs("FLEET_SYNC_INTERVAL_SECS", &v)?,
            None => DEFAULT_RECONCILE_INTERVAL,
        };

        let provider = ProviderConfig {
            url: var("FLEET_PROVIDER_URL"),
            region: var("FLEET_PROVIDER_REGION").unwrap_or_else(|| "us-east-1".to_string()),
            token: var("FLEET_PROVIDER_TOKEN"),
        };

        let slack = SlackConfig {
            webhook_url: var("FLEET_SLACK_WEBHOOK_URL"),
            channel: var("FLEET_SLACK_CHANNEL").unwrap_or_default(),
        };

        // FLEET_INIT_SCRIPT_TEMPLATE names a file holding the template.
        let init_script_template = match var("FLEET_INIT_SCRIPT_TEMPLATE") {
            Some(path) => std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read init script template {path}"))?,
            None => DEFAULT_INIT_SCRIPT_TEMPLATE.to_string(),
        };

        Ok(Self {
            listen_addr,
            public_url,
            log_level,
            dev_mode,
            auth_token,
            store,
            queues,
            sync_interval,
            provider,
            slack,
            init_script_template,
        })
    }
}

/// Parses `name:concurrency,name:concurrency`. A bare name gets one consumer.
pub fn parse_queues(value: &str) -> Result<BTreeMap<String, usize>> {
    let mut queues = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (name, concurrency) = match entry.split_once(':') {
            Some((name, n)) => {
                let n: usize = n
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid concurrency in queue entry '{entry}'"))?;
                (name.trim(), n)
            }
            None => (entry, 1),
        };
        if name.is_empty() {
            bail!("empty queue name in '{entry}'");
        }
        if concurrency == 0 {
            bail!("queue '{name}' needs at least one consumer");
        }
        queues.insert(name.to_string(), concurrency);
    }
    Ok(queues)
}

/// Whole seconds, at least one.
fn parse_positive_secs(name: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("invalid {name}"))?;
    if secs == 0 {
        bail!("{name} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}
