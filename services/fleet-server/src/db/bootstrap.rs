//! Bootstrap secrets and init-script payloads.
//!
//! A booting instance fetches its init script with a per-build secret as the
//! Basic password. Secrets live in the `init_script_auths` hash (build id to
//! secret), scripts in `init_script:<build id>`. Both expire after the
//! configured TTL and are wiped early once the build reports `finished`.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use fleet_id::InstanceBuildId;
use rand::Rng;

use super::{KvOp, KvStore, StoreError};

/// Hash of build id to bootstrap secret.
pub const AUTHS_KEY: &str = "init_script_auths";

const SCRIPT_FIELD: &str = "script";

/// Secret bytes (32 bytes = 256 bits of entropy).
const SECRET_BYTES: usize = 32;

fn script_key(build_id: &InstanceBuildId) -> String {
    format!("init_script:{build_id}")
}

/// Generate a fresh bootstrap secret.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Handle to bootstrap secrets and scripts.
#[derive(Clone)]
pub struct BootstrapStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

impl BootstrapStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    /// Stores the secret and rendered script for a build, both expiring
    /// after the configured TTL.
    pub async fn store(
        &self,
        build_id: &InstanceBuildId,
        secret: &str,
        script: &str,
    ) -> Result<(), StoreError> {
        let script_key = script_key(build_id);
        self.kv
            .transact(vec![
                KvOp::hset(AUTHS_KEY, vec![(build_id.to_string(), secret.to_string())]),
                KvOp::expire(AUTHS_KEY, self.ttl),
                KvOp::hset(
                    script_key.clone(),
                    vec![(SCRIPT_FIELD.to_string(), script.to_string())],
                ),
                KvOp::expire(script_key, self.ttl),
            ])
            .await
    }

    /// The live secret for a build.
    pub async fn secret(&self, build_id: &InstanceBuildId) -> Result<Option<String>, StoreError> {
        self.kv.hget(AUTHS_KEY, &build_id.to_string()).await
    }

    /// The live init script for a build.
    pub async fn script(&self, build_id: &InstanceBuildId) -> Result<Option<String>, StoreError> {
        self.kv.hget(&script_key(build_id), SCRIPT_FIELD).await
    }

    /// Removes both secret and script.
    pub async fn wipe(&self, build_id: &InstanceBuildId) -> Result<(), StoreError> {
        self.kv
            .transact(vec![
                KvOp::hdel(AUTHS_KEY, build_id.to_string()),
                KvOp::del(script_key(build_id)),
            ])
            .await
    }
}
