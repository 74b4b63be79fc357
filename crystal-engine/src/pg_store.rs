use std::collections::BTreeMap;

use async_trait::async_trait;
use crystal_core::config::CoreConfig;
use crystal_core::db::DatabasePool;
use crystal_core::CoreResult;
use sqlx::{Postgres, Transaction};
use tracing::info;

use crate::store::{PolicyStore, StoreError, StoreOp};

/// Durable [`PolicyStore`] on Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: DatabasePool,
}

impl PgStore {
    /// Connects using `DATABASE_URL` from the configuration and runs migrations.
    pub async fn from_config(config: &CoreConfig) -> CoreResult<Self> {
        let pool = DatabasePool::connect(config).await?;
        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: DatabasePool) -> CoreResult<Self> {
        sqlx::migrate!("./migrations").run(pool.inner()).await?;
        info!("policy store migrations applied");
        Ok(Self { pool })
    }
}

async fn execute(tx: &mut Transaction<'_, Postgres>, op: StoreOp) -> Result<(), sqlx::Error> {
    match op {
        StoreOp::Set { key, value } => {
            clear_key(tx, &key).await?;
            sqlx::query("INSERT INTO crystal_scalars (key, value) VALUES ($1, $2)")
                .bind(&key)
                .bind(&value)
                .execute(&mut **tx)
                .await?;
        }
        StoreOp::Delete { key } => clear_key(tx, &key).await?,
        StoreOp::HSet { key, field, value } => {
            sqlx::query(
                r#"
                INSERT INTO crystal_hashes (key, field, value) VALUES ($1, $2, $3)
                ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value
                "#,
            )
            .bind(&key)
            .bind(&field)
            .bind(&value)
            .execute(&mut **tx)
            .await?;
        }
        StoreOp::HDel { key, field } => {
            sqlx::query("DELETE FROM crystal_hashes WHERE key = $1 AND field = $2")
                .bind(&key)
                .bind(&field)
                .execute(&mut **tx)
                .await?;
        }
        StoreOp::RPush { key, values } => {
            for value in values {
                sqlx::query("INSERT INTO crystal_lists (key, value) VALUES ($1, $2)")
                    .bind(&key)
                    .bind(&value)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        StoreOp::LRem { key, value } => {
            sqlx::query(
                r#"
                DELETE FROM crystal_lists WHERE id = (
                    SELECT id FROM crystal_lists WHERE key = $1 AND value = $2
                    ORDER BY id LIMIT 1
                )
                "#,
            )
            .bind(&key)
            .bind(&value)
            .execute(&mut **tx)
            .await?;
        }
    }
    Ok(())
}

async fn increment(tx: &mut Transaction<'_, Postgres>, key: &str) -> Result<u64, StoreError> {
    let raw = sqlx::query_scalar::<_, String>(
        r#"
        INSERT INTO crystal_scalars (key, value) VALUES ($1, '1')
        ON CONFLICT (key) DO UPDATE
            SET value = (crystal_scalars.value::BIGINT + 1)::TEXT
        RETURNING value
        "#,
    )
    .bind(key)
    .fetch_one(&mut **tx)
    .await?;

    raw.parse().map_err(|_| StoreError::NotACounter {
        key: key.to_string(),
    })
}

async fn clear_key(tx: &mut Transaction<'_, Postgres>, key: &str) -> Result<(), sqlx::Error> {
    for statement in [
        "DELETE FROM crystal_scalars WHERE key = $1",
        "DELETE FROM crystal_hashes WHERE key = $1",
        "DELETE FROM crystal_lists WHERE key = $1",
    ] {
        sqlx::query(statement).bind(key).execute(&mut **tx).await?;
    }
    Ok(())
}

#[async_trait]
impl PolicyStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM crystal_scalars WHERE key = $1")
            .bind(key)
            .fetch_optional(self.pool.inner())
            .await?;
        Ok(value)
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.inner().begin().await?;
        let next = increment(&mut tx, key).await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn incr_reserving(&self, counter: &str, reservations: &str) -> Result<u64, StoreError> {
        let mut tx = self.pool.inner().begin().await?;
        let next = increment(&mut tx, counter).await?;
        sqlx::query(
            r#"
            INSERT INTO crystal_hashes (key, field, value) VALUES ($1, $2, '')
            ON CONFLICT (key, field) DO NOTHING
            "#,
        )
        .bind(reservations)
        .bind(next.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(next)
    }

    async fn reset_counter_if_vacant(&self, counter: &str, prefixes: &[&str]) -> Result<bool, StoreError> {
        let mut tx = self.pool.inner().begin().await?;

        // Waits for in-flight allocations; the next statement then sees their reservations.
        let locked = sqlx::query_scalar::<_, String>(
            "SELECT value FROM crystal_scalars WHERE key = $1 FOR UPDATE",
        )
        .bind(counter)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        let prefixes: Vec<String> = prefixes.iter().map(|prefix| prefix.to_string()).collect();
        let occupied = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM crystal_scalars WHERE key ^@ ANY($1))
                OR EXISTS (SELECT 1 FROM crystal_hashes WHERE key ^@ ANY($1))
                OR EXISTS (SELECT 1 FROM crystal_lists WHERE key ^@ ANY($1))
            "#,
        )
        .bind(&prefixes)
        .fetch_one(&mut *tx)
        .await?;
        if occupied {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE crystal_scalars SET value = '0' WHERE key = $1")
            .bind(counter)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn hupdate(&self, key: &str, field: &str, value: &str) -> Result<bool, StoreError> {
        let updated = sqlx::query("UPDATE crystal_hashes SET value = $3 WHERE key = $1 AND field = $2")
            .bind(key)
            .bind(field)
            .bind(value)
            .execute(self.pool.inner())
            .await?;
        Ok(updated.rows_affected() > 0)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT value FROM crystal_hashes WHERE key = $1 AND field = $2",
        )
        .bind(key)
        .bind(field)
        .fetch_optional(self.pool.inner())
        .await?;
        Ok(value)
    }

    async fn hgetall(&self, key: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT field, value FROM crystal_hashes WHERE key = $1",
        )
        .bind(key)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn lrange(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let values = sqlx::query_scalar::<_, String>(
            "SELECT value FROM crystal_lists WHERE key = $1 ORDER BY id",
        )
        .bind(key)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(values)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (SELECT 1 FROM crystal_scalars WHERE key = $1)
                OR EXISTS (SELECT 1 FROM crystal_hashes WHERE key = $1)
                OR EXISTS (SELECT 1 FROM crystal_lists WHERE key = $1)
            "#,
        )
        .bind(key)
        .fetch_one(self.pool.inner())
        .await?;
        Ok(found)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let keys = sqlx::query_scalar::<_, String>(
            r#"
            SELECT key FROM crystal_scalars WHERE starts_with(key, $1)
            UNION
            SELECT key FROM crystal_hashes WHERE starts_with(key, $1)
            UNION
            SELECT key FROM crystal_lists WHERE starts_with(key, $1)
            ORDER BY key
            "#,
        )
        .bind(prefix)
        .fetch_all(self.pool.inner())
        .await?;
        Ok(keys)
    }

    async fn apply(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.inner().begin().await?;
        for op in ops {
            execute(&mut tx, op).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
