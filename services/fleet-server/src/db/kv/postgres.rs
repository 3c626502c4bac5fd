//! Postgres-backed key-value store.
//!
//! Keys live in `kv_keys` with their kind and optional expiry; members,
//! fields and list items hang off it with `ON DELETE CASCADE`, so dropping a
//! key row drops its contents. Rows past `expires_at` are ignored by every
//! read and replaced on write; the cleanup worker purges them for good.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use tokio::time::Instant;

use super::{conflict, required_kind, wrong_type, KeyKind, KvOp, KvStore};
use crate::db::StoreError;

/// How often a blocked `brpop` re-checks its list.
const BRPOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Key-value store over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Makes sure `key` holds `kind`, creating it if absent or expired.
    async fn ensure_kind(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        kind: KeyKind,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_keys WHERE key = $1 AND expires_at <= now()")
            .bind(key)
            .execute(&mut **tx)
            .await?;

        sqlx::query("INSERT INTO kv_keys (key, kind) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
            .bind(key)
            .bind(kind.as_str())
            .execute(&mut **tx)
            .await?;

        let actual: String = sqlx::query_scalar("SELECT kind FROM kv_keys WHERE key = $1 FOR UPDATE")
            .bind(key)
            .fetch_one(&mut **tx)
            .await?;

        match KeyKind::parse(&actual) {
            Some(actual) if actual == kind => Ok(()),
            Some(actual) => Err(wrong_type(key, kind, actual)),
            None => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("unknown key kind '{actual}'"),
            }),
        }
    }

    /// Drops the key row when its collection has been emptied.
    async fn drop_if_empty(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        kind: KeyKind,
    ) -> Result<(), StoreError> {
        let table = match kind {
            KeyKind::Set => "kv_set_members",
            KeyKind::Hash => "kv_hash_fields",
            KeyKind::List => "kv_list_items",
        };
        let sql = format!(
            "DELETE FROM kv_keys WHERE key = $1 AND NOT EXISTS (SELECT 1 FROM {table} WHERE key = $1)"
        );
        sqlx::query(&sql).bind(key).execute(&mut **tx).await?;
        Ok(())
    }

    /// Locks the guarded field and compares it with `expected`.
    async fn check(
        tx: &mut Transaction<'_, Postgres>,
        key: &str,
        field: &str,
        expected: Option<&str>,
    ) -> Result<(), StoreError> {
        let current: Option<String> = sqlx::query_scalar(
            r#"
            SELECT f.value
            FROM kv_hash_fields f
            JOIN kv_keys k ON k.key = f.key
            WHERE f.key = $1
              AND f.field = $2
              AND (k.expires_at IS NULL OR k.expires_at > now())
            FOR UPDATE OF f
            "#,
        )
        .bind(key)
        .bind(field)
        .fetch_optional(&mut **tx)
        .await?;

        if current.as_deref() == expected {
            Ok(())
        } else {
            Err(conflict(key, field))
        }
    }

    async fn apply(tx: &mut Transaction<'_, Postgres>, op: KvOp) -> Result<(), StoreError> {
        if let Some(kind) = required_kind(&op) {
            Self::ensure_kind(tx, op.key(), kind).await?;
        }

        match op {
            KvOp::Del { key } => {
                sqlx::query("DELETE FROM kv_keys WHERE key = $1")
                    .bind(&key)
                    .execute(&mut **tx)
                    .await?;
            }
            KvOp::SAdd { key, members } => {
                for member in members {
                    sqlx::query(
                        "INSERT INTO kv_set_members (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                    )
                    .bind(&key)
                    .bind(member)
                    .execute(&mut **tx)
                    .await?;
                }
            }
            KvOp::SRem { key, members } => {
                sqlx::query("DELETE FROM kv_set_members WHERE key = $1 AND member = ANY($2)")
                    .bind(&key)
                    .bind(&members)
                    .execute(&mut **tx)
                    .await?;
                Self::drop_if_empty(tx, &key, KeyKind::Set).await?;
            }
            KvOp::HSet { key, fields } => {
                for (field, value) in fields {
                    sqlx::query(
                        r#"
                        INSERT INTO kv_hash_fields (key, field, value)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value
                        "#,
                    )
                    .bind(&key)
                    .bind(field)
                    .bind(value)
                    .execute(&mut **tx)
                    .await?;
                }
            }
            KvOp::HDel { key, fields } => {
                sqlx::query("DELETE FROM kv_hash_fields WHERE key = $1 AND field = ANY($2)")
                    .bind(&key)
                    .bind(&fields)
                    .execute(&mut **tx)
                    .await?;
                Self::drop_if_empty(tx, &key, KeyKind::Hash).await?;
            }
            KvOp::LPush { key, value } => {
                sqlx::query("INSERT INTO kv_list_items (key, value) VALUES ($1, $2)")
                    .bind(&key)
                    .bind(value)
                    .execute(&mut **tx)
                    .await?;
            }
            KvOp::HCheck { .. } => {}
            KvOp::Expire { key, ttl } => {
                sqlx::query(
                    r#"
                    UPDATE kv_keys
                    SET expires_at = now() + make_interval(secs => $2)
                    WHERE key = $1
                      AND (expires_at IS NULL OR expires_at > now())
                    "#,
                )
                .bind(&key)
                .bind(ttl.as_secs_f64())
                .execute(&mut **tx)
                .await?;
            }
        }
        Ok(())
    }

    /// Live kind of `key`, if any.
    async fn live_kind(&self, key: &str) -> Result<Option<KeyKind>, StoreError> {
        let kind: Option<String> = sqlx::query_scalar(
            "SELECT kind FROM kv_keys WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(kind.as_deref().and_then(KeyKind::parse))
    }

    async fn expect_kind(&self, key: &str, kind: KeyKind) -> Result<bool, StoreError> {
        match self.live_kind(key).await? {
            None => Ok(false),
            Some(actual) if actual == kind => Ok(true),
            Some(actual) => Err(wrong_type(key, kind, actual)),
        }
    }

    async fn try_pop(&self, key: &str) -> Result<Option<String>, StoreError> {
        if !self.expect_kind(key, KeyKind::List).await? {
            return Ok(None);
        }

        let mut tx = self.pool.begin().await?;
        let popped: Option<String> = sqlx::query_scalar(
            r#"
            DELETE FROM kv_list_items
            WHERE id = (
                SELECT i.id
                FROM kv_list_items i
                JOIN kv_keys k ON k.key = i.key
                WHERE i.key = $1
                  AND (k.expires_at IS NULL OR k.expires_at > now())
                ORDER BY i.id
                LIMIT 1
                FOR UPDATE OF i SKIP LOCKED
            )
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;

        if popped.is_some() {
            Self::drop_if_empty(&mut tx, key, KeyKind::List).await?;
        }
        tx.commit().await?;
        Ok(popped)
    }
}

#[async_trait]
impl KvStore for PgStore {
    async fn transact(&self, ops: Vec<KvOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for op in &ops {
            if let KvOp::HCheck {
                key,
                field,
                expected,
            } = op
            {
                Self::check(&mut tx, key, field, expected.as_deref()).await?;
            }
        }
        for op in ops {
            // Returning early drops `tx`, which rolls the batch back.
            Self::apply(&mut tx, op).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        if !self.expect_kind(key, KeyKind::Set).await? {
            return Ok(Vec::new());
        }
        let members = sqlx::query_scalar(
            "SELECT member FROM kv_set_members WHERE key = $1 ORDER BY member",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        if !self.expect_kind(key, KeyKind::Set).await? {
            return Ok(false);
        }
        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM kv_set_members WHERE key = $1 AND member = $2")
                .bind(key)
                .bind(member)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        if !self.expect_kind(key, KeyKind::Hash).await? {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT field, value FROM kv_hash_fields WHERE key = $1",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        if !self.expect_kind(key, KeyKind::Hash).await? {
            return Ok(None);
        }
        let value =
            sqlx::query_scalar("SELECT value FROM kv_hash_fields WHERE key = $1 AND field = $2")
                .bind(key)
                .bind(field)
                .fetch_optional(&self.pool)
                .await?;
        Ok(value)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        if !self.expect_kind(key, KeyKind::List).await? {
            return Ok(0);
        }
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM kv_list_items WHERE key = $1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    async fn brpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop(key).await? {
                return Ok(Some(value));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(BRPOP_POLL_INTERVAL)).await;
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM kv_keys WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
