//! Per-step progress queries.
//!
//! Timestamps are written through `COALESCE`, so the first write wins and a
//! step never moves backward.

use hive_core::db::unix_timestamp;
use sqlx::SqliteConnection;

use super::db::Database;
use super::models::{FeatureProgress, StepRecord};
use super::queries::fetch_feature;
use crate::error::{Result, StoreError};

impl Database {
    /// Record that work on a step began.
    pub async fn mark_step_started(&self, feature_id: i64, step_index: i64) -> Result<StepRecord> {
        let mut tx = self.begin_write().await?;

        let result = sqlx::query(
            r"
            UPDATE step_progress SET started_at = COALESCE(started_at, ?)
            WHERE feature_id = ? AND step_index = ?
            ",
        )
        .bind(unix_timestamp())
        .bind(feature_id)
        .bind(step_index)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(step_not_found(feature_id, step_index));
        }

        let step = fetch_step(&mut tx, feature_id, step_index).await?;
        tx.commit().await?;
        Ok(step)
    }

    /// Record that a step is done. A step that never started is started now.
    pub async fn mark_step_completed(
        &self,
        feature_id: i64,
        step_index: i64,
        notes: Option<&str>,
    ) -> Result<StepRecord> {
        let mut tx = self.begin_write().await?;
        let now = unix_timestamp();
        let notes = notes.filter(|n| !n.is_empty());

        let result = sqlx::query(
            r"
            UPDATE step_progress SET
                started_at = COALESCE(started_at, ?),
                completed_at = COALESCE(completed_at, ?),
                notes = COALESCE(?, notes)
            WHERE feature_id = ? AND step_index = ?
            ",
        )
        .bind(now)
        .bind(now)
        .bind(notes)
        .bind(feature_id)
        .bind(step_index)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(step_not_found(feature_id, step_index));
        }

        let step = fetch_step(&mut tx, feature_id, step_index).await?;
        tx.commit().await?;
        Ok(step)
    }

    /// Step-by-step progress of a feature.
    pub async fn progress(&self, feature_id: i64) -> Result<FeatureProgress> {
        let mut conn = self.pool().acquire().await?;
        let feature = fetch_feature(&mut conn, feature_id).await?;

        let steps = sqlx::query_as::<_, StepRecord>(
            "SELECT * FROM step_progress WHERE feature_id = ? ORDER BY step_index ASC",
        )
        .bind(feature_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(FeatureProgress::new(feature_id, feature.name, steps))
    }
}

async fn fetch_step(
    conn: &mut SqliteConnection,
    feature_id: i64,
    step_index: i64,
) -> Result<StepRecord> {
    sqlx::query_as::<_, StepRecord>(
        "SELECT * FROM step_progress WHERE feature_id = ? AND step_index = ?",
    )
    .bind(feature_id)
    .bind(step_index)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| step_not_found(feature_id, step_index))
}

fn step_not_found(feature_id: i64, step_index: i64) -> StoreError {
    StoreError::NotFound(format!("Step {step_index} of feature {feature_id}"))
}
