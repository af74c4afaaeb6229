use super::SignalStore;
use crate::error::PipelineError;
use crate::models::{Direction, Horizon, Signal, SignalStatus, Target};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::collections::BTreeSet;
use uuid::Uuid;

const SIGNAL_COLUMNS: &str = r#"
    id, instrument, direction, entry, stop_loss, targets::text AS targets,
    confluence_score, risk_pct, agreeing_horizons, basis_horizon,
    status, target_index, hit_targets, published_at, expires_at, updated_at
"#;

/// Postgres-backed signal store (`signals` table, see `migrations/`)
pub struct PostgresSignalStore {
    pool: PgPool,
}

impl PostgresSignalStore {
    /// Connect and run pending migrations
    pub async fn new(database_url: &str) -> Result<Self, PipelineError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres signal store");

        Ok(Self { pool })
    }

    async fn query_signals(
        &self,
        filter: &str,
        bind: impl FnOnce(
            sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
        ) -> sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Signal>, PipelineError> {
        let sql = format!("SELECT {} FROM signals WHERE {}", SIGNAL_COLUMNS, filter);
        let rows = bind(sqlx::query(&sql)).fetch_all(&self.pool).await?;
        rows.iter().map(signal_from_row).collect()
    }
}

fn to_decimal(value: f64, field: &str) -> Result<Decimal, PipelineError> {
    Decimal::from_f64_retain(value)
        .ok_or_else(|| PipelineError::Persistence(format!("{} {} is not representable", field, value)))
}

fn to_f64(value: Decimal, field: &str) -> Result<f64, PipelineError> {
    value
        .to_f64()
        .ok_or_else(|| PipelineError::Persistence(format!("{} {} out of range", field, value)))
}

fn signal_from_row(row: &PgRow) -> Result<Signal, PipelineError> {
    let direction: String = row.try_get("direction")?;
    let entry: Decimal = row.try_get("entry")?;
    let stop_loss: Decimal = row.try_get("stop_loss")?;
    let targets: String = row.try_get("targets")?;
    let agreeing: Vec<String> = row.try_get("agreeing_horizons")?;
    let basis: String = row.try_get("basis_horizon")?;
    let status: String = row.try_get("status")?;
    let target_index: Option<i32> = row.try_get("target_index")?;
    let hit_targets: Vec<i32> = row.try_get("hit_targets")?;

    let status = SignalStatus::from_parts(&status, target_index.map(|k| k as usize))
        .map_err(PipelineError::Persistence)?;

    Ok(Signal {
        id: row.try_get("id")?,
        instrument: row.try_get("instrument")?,
        direction: direction
            .parse::<Direction>()
            .map_err(PipelineError::Persistence)?,
        entry: to_f64(entry, "entry")?,
        stop_loss: to_f64(stop_loss, "stop_loss")?,
        targets: serde_json::from_str::<Vec<Target>>(&targets)?,
        confluence_score: row.try_get("confluence_score")?,
        risk_pct: row.try_get("risk_pct")?,
        agreeing_horizons: agreeing
            .iter()
            .map(|h| h.parse::<Horizon>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(PipelineError::Persistence)?,
        basis_horizon: basis.parse().map_err(PipelineError::Persistence)?,
        status,
        hit_targets: hit_targets.into_iter().map(|k| k as usize).collect::<BTreeSet<_>>(),
        published_at: row.try_get("published_at")?,
        expires_at: row.try_get("expires_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl SignalStore for PostgresSignalStore {
    async fn put(&self, signal: &Signal) -> Result<(), PipelineError> {
        let targets = serde_json::to_string(&signal.targets)?;
        let agreeing: Vec<String> = signal
            .agreeing_horizons
            .iter()
            .map(|h| h.as_str().to_string())
            .collect();
        let hit_targets: Vec<i32> = signal.hit_targets.iter().map(|k| *k as i32).collect();

        sqlx::query(
            r#"
            INSERT INTO signals (
                id, instrument, direction, entry, stop_loss, targets,
                confluence_score, risk_pct, agreeing_horizons, basis_horizon,
                status, target_index, hit_targets, published_at, expires_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6::jsonb, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                target_index = EXCLUDED.target_index,
                hit_targets = EXCLUDED.hit_targets,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(signal.id)
        .bind(&signal.instrument)
        .bind(signal.direction.as_str())
        .bind(to_decimal(signal.entry, "entry")?)
        .bind(to_decimal(signal.stop_loss, "stop_loss")?)
        .bind(targets)
        .bind(signal.confluence_score)
        .bind(signal.risk_pct)
        .bind(agreeing)
        .bind(signal.basis_horizon.as_str())
        .bind(signal.status.as_str())
        .bind(signal.status.target_index().map(|k| k as i32))
        .bind(hit_targets)
        .bind(signal.published_at)
        .bind(signal.expires_at)
        .bind(signal.updated_at)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved signal {} for {} to Postgres ({})",
            signal.id,
            signal.instrument,
            signal.status
        );

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Signal>, PipelineError> {
        let mut signals = self.query_signals("id = $1", |q| q.bind(id)).await?;
        Ok(signals.pop())
    }

    async fn find_active(&self, instrument: &str) -> Result<Vec<Signal>, PipelineError> {
        let instrument = instrument.to_string();
        self.query_signals("instrument = $1 AND status = 'ACTIVE'", |q| q.bind(instrument))
            .await
    }

    async fn find_tracked(&self) -> Result<Vec<Signal>, PipelineError> {
        // TARGET_HIT on the last target is terminal
        let signals = self
            .query_signals("status IN ('ACTIVE', 'TARGET_HIT')", |q| q)
            .await?;
        Ok(signals.into_iter().filter(|s| s.is_tracked()).collect())
    }

    async fn find_expired(&self, now: DateTime<Utc>) -> Result<Vec<Signal>, PipelineError> {
        self.query_signals("expires_at < $1", |q| q.bind(now)).await
    }

    async fn delete_batch(&self, ids: &[Uuid]) -> Result<usize, PipelineError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM signals WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .execute(&self.pool)
            .await?;

        tracing::debug!("Deleted {} signals from Postgres", result.rows_affected());
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decimal_conversions() {
        let d = to_decimal(49_500.25, "entry").unwrap();
        assert_eq!(to_f64(d, "entry").unwrap(), 49_500.25);
        assert!(to_decimal(f64::NAN, "entry").is_err());
    }

    #[tokio::test]
    #[ignore] // Requires Postgres running (DATABASE_URL)
    async fn test_put_and_query_roundtrip() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL not set");
        let store = PostgresSignalStore::new(&url).await.expect("Failed to connect");

        let now = Utc::now();
        let mut signal = Signal {
            id: Uuid::new_v4(),
            instrument: "TEST_PG".to_string(),
            direction: Direction::Long,
            entry: 50_000.0,
            stop_loss: 49_500.0,
            targets: vec![Target { price: 51_000.0, probability: 0.6 }],
            confluence_score: 75.0,
            risk_pct: 1.0,
            agreeing_horizons: vec![Horizon::H1, Horizon::D1],
            basis_horizon: Horizon::D1,
            status: SignalStatus::Active,
            hit_targets: BTreeSet::new(),
            published_at: now,
            expires_at: now - chrono::Duration::minutes(1),
            updated_at: now,
        };

        store.put(&signal).await.unwrap();
        assert_eq!(store.find_active("TEST_PG").await.unwrap().len(), 1);

        signal.status = SignalStatus::Stopped;
        store.put(&signal).await.unwrap();
        assert!(store.find_active("TEST_PG").await.unwrap().is_empty());

        let expired = store.find_expired(now).await.unwrap();
        assert!(expired.iter().any(|s| s.id == signal.id));

        assert_eq!(store.delete_batch(&[signal.id]).await.unwrap(), 1);
        assert!(store.get(signal.id).await.unwrap().is_none());
    }
}
