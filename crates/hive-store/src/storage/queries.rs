//! Claim protocol and backlog queries.
//!
//! Every mutation runs in one transaction whose first statement bumps the
//! `write_lock` row. That write takes the database's RESERVED lock before
//! any candidate row is read, so concurrent mutators (other pools, other
//! processes) queue on the busy timeout instead of racing between select
//! and update. The transaction rolls back when dropped on an error path.

use hive_core::db::unix_timestamp;
use sqlx::{Sqlite, SqliteConnection, Transaction};
use tracing::{debug, info};

use super::db::Database;
use super::models::{
    DeleteOutcome, ExistingFeature, Feature, FeatureRow, FeatureUpdate, LabelStats, NewFeature,
    SkipOutcome, Stats,
};
use crate::error::{Result, StoreError};

/// Upper bound for a regression sample.
pub const MAX_REGRESSION_SAMPLE: i64 = 10;

impl Database {
    /// Begin a transaction holding the store write lock.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'_, Sqlite>> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("UPDATE write_lock SET epoch = epoch + 1 WHERE id = 1")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    // =========================================================================
    // Claim protocol
    // =========================================================================

    /// Peek at the feature `for_owner` would get next, without claiming it.
    ///
    /// Uses the same candidate rule as [`claim_next`](Self::claim_next), so an
    /// anonymous claim (claimed without an owner) is never offered.
    pub async fn next_available(&self, for_owner: Option<&str>) -> Result<Option<Feature>> {
        let row = sqlx::query_as::<_, FeatureRow>(
            r"
            SELECT * FROM features
            WHERE completed = 0
              AND ((claimed = 0 AND owner IS NULL) OR owner = ?)
            ORDER BY priority ASC, id ASC
            LIMIT 1
            ",
        )
        .bind(for_owner)
        .fetch_optional(self.pool())
        .await?;

        row.map(Feature::try_from).transpose()
    }

    /// Atomically select and claim the next feature for `owner`.
    ///
    /// Candidates are incomplete features that are either free or already
    /// held by `owner`, so a restarted worker resumes its own item first.
    pub async fn claim_next(&self, owner: &str) -> Result<Feature> {
        let mut tx = self.begin_write().await?;
        let now = unix_timestamp();

        let id: Option<i64> = sqlx::query_scalar(
            r"
            UPDATE features SET claimed = 1, owner = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM features
                WHERE completed = 0
                  AND ((claimed = 0 AND owner IS NULL) OR owner = ?)
                ORDER BY priority ASC, id ASC
                LIMIT 1
            )
            RETURNING id
            ",
        )
        .bind(owner)
        .bind(now)
        .bind(owner)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = id else {
            debug!(owner, "No feature available to claim");
            return Err(StoreError::NotAvailable);
        };

        let feature = fetch_feature(&mut tx, id).await?;
        tx.commit().await?;

        info!(owner, feature_id = id, name = %feature.name, "Feature claimed");
        Ok(feature)
    }

    /// Claim a known feature.
    ///
    /// Without an owner the current holder (if any) is kept.
    pub async fn mark_claimed(&self, id: i64, owner: Option<&str>) -> Result<Feature> {
        let mut tx = self.begin_write().await?;
        let feature = fetch_feature(&mut tx, id).await?;

        if feature.completed {
            return Err(StoreError::Conflict(format!(
                "feature {id} is already completed"
            )));
        }
        if let (Some(requested), Some(holder)) = (owner, feature.owner.as_deref())
            && feature.claimed
            && requested != holder
        {
            return Err(StoreError::Conflict(format!(
                "feature {id} is already claimed by {holder}"
            )));
        }

        sqlx::query(
            "UPDATE features SET claimed = 1, owner = COALESCE(?, owner), updated_at = ? WHERE id = ?",
        )
        .bind(owner)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        let feature = fetch_feature(&mut tx, id).await?;
        tx.commit().await?;
        Ok(feature)
    }

    /// Return a feature to the queue.
    ///
    /// With an owner, the release is refused if someone else holds the claim.
    pub async fn release(&self, id: i64, owner: Option<&str>) -> Result<Feature> {
        let mut tx = self.begin_write().await?;
        let feature = fetch_feature(&mut tx, id).await?;

        if let (Some(requested), Some(holder)) = (owner, feature.owner.as_deref())
            && requested != holder
        {
            return Err(StoreError::Forbidden(format!(
                "feature {id} is held by {holder}, not {requested}"
            )));
        }

        sqlx::query("UPDATE features SET claimed = 0, owner = NULL, updated_at = ? WHERE id = ?")
            .bind(unix_timestamp())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        let feature = fetch_feature(&mut tx, id).await?;
        tx.commit().await?;

        info!(feature_id = id, owner = ?owner, "Feature released");
        Ok(feature)
    }

    /// Mark a feature done, regardless of who holds it.
    pub async fn complete(&self, id: i64) -> Result<Feature> {
        let mut tx = self.begin_write().await?;

        let result = sqlx::query(
            "UPDATE features SET completed = 1, claimed = 0, owner = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(unix_timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("Feature {id}")));
        }

        let feature = fetch_feature(&mut tx, id).await?;
        tx.commit().await?;

        info!(feature_id = id, name = %feature.name, "Feature completed");
        Ok(feature)
    }

    /// Move a feature to the tail of the queue and drop its claim.
    pub async fn skip(&self, id: i64) -> Result<SkipOutcome> {
        let mut tx = self.begin_write().await?;
        let feature = fetch_feature(&mut tx, id).await?;

        if feature.completed {
            return Err(StoreError::Conflict(format!(
                "cannot skip completed feature {id}"
            )));
        }

        let new_priority = next_priority(&mut tx).await?;
        sqlx::query(
            "UPDATE features SET priority = ?, claimed = 0, owner = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(new_priority)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(feature_id = id, old_priority = feature.priority, new_priority, "Feature skipped");
        Ok(SkipOutcome {
            id,
            name: feature.name,
            old_priority: feature.priority,
            new_priority,
        })
    }

    // =========================================================================
    // Creation and editing
    // =========================================================================

    /// Create a batch of features at sequential priorities after the current
    /// maximum. All or nothing.
    pub async fn create_batch(&self, items: &[NewFeature], label: Option<&str>) -> Result<usize> {
        if items.is_empty() {
            return Err(StoreError::Invalid("batch must not be empty".into()));
        }
        for (index, item) in items.iter().enumerate() {
            item.validate()
                .map_err(|e| StoreError::Invalid(format!("item {index}: {e}")))?;
        }

        let mut tx = self.begin_write().await?;
        let start = next_priority(&mut tx).await?;
        let now = unix_timestamp();

        for (offset, item) in (0_i64..).zip(items) {
            let priority = start + offset - item.kind.priority_boost();
            insert_feature(&mut tx, item, priority, label, now).await?;
        }

        tx.commit().await?;

        info!(count = items.len(), label = ?label, start_priority = start, "Features created");
        Ok(items.len())
    }

    /// Create one unlabelled feature after the current maximum priority.
    pub async fn create_one(&self, item: &NewFeature) -> Result<Feature> {
        item.validate()?;

        let mut tx = self.begin_write().await?;
        let priority = next_priority(&mut tx).await? - item.kind.priority_boost();
        let id = insert_feature(&mut tx, item, priority, None, unix_timestamp()).await?;
        let feature = fetch_feature(&mut tx, id).await?;
        tx.commit().await?;

        info!(feature_id = id, priority, "Feature created");
        Ok(feature)
    }

    /// Apply a partial update.
    ///
    /// The step count is fixed at creation; an update may reword steps but
    /// not add or remove them.
    pub async fn update(&self, id: i64, update: &FeatureUpdate) -> Result<Feature> {
        update.validate()?;

        let mut tx = self.begin_write().await?;
        let current = fetch_feature(&mut tx, id).await?;

        if update.is_empty() {
            return Ok(current);
        }

        let steps_json = match &update.steps {
            Some(steps) if steps.len() != current.steps.len() => {
                return Err(StoreError::Conflict(format!(
                    "feature {id} has {} steps, update has {}",
                    current.steps.len(),
                    steps.len()
                )));
            }
            Some(steps) => Some(encode_steps(steps)?),
            None => None,
        };

        sqlx::query(
            r"
            UPDATE features SET
                category = COALESCE(?, category),
                name = COALESCE(?, name),
                description = COALESCE(?, description),
                steps = COALESCE(?, steps),
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(update.category.as_deref())
        .bind(update.name.as_deref())
        .bind(update.description.as_deref())
        .bind(steps_json)
        .bind(unix_timestamp())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if let Some(steps) = &update.steps {
            for (index, text) in (0_i64..).zip(steps) {
                sqlx::query(
                    "UPDATE step_progress SET step_text = ? WHERE feature_id = ? AND step_index = ?",
                )
                .bind(text)
                .bind(id)
                .bind(index)
                .execute(&mut *tx)
                .await?;
            }
        }

        let feature = fetch_feature(&mut tx, id).await?;
        tx.commit().await?;
        Ok(feature)
    }

    /// Remove a feature and, by cascade, its step records.
    pub async fn delete(&self, id: i64) -> Result<DeleteOutcome> {
        let mut tx = self.begin_write().await?;
        let feature = fetch_feature(&mut tx, id).await?;

        sqlx::query("DELETE FROM features WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(feature_id = id, "Feature deleted");
        Ok(DeleteOutcome {
            name: feature.name,
            was_completed: feature.completed,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get a feature by ID.
    pub async fn get_feature(&self, id: i64) -> Result<Feature> {
        let mut conn = self.pool().acquire().await?;
        fetch_feature(&mut conn, id).await
    }

    /// All features in queue order.
    pub async fn list_features(&self) -> Result<Vec<Feature>> {
        sqlx::query_as::<_, FeatureRow>("SELECT * FROM features ORDER BY priority ASC, id ASC")
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(Feature::try_from)
            .collect()
    }

    pub async fn stats(&self) -> Result<Stats> {
        let (total, completed, claimed): (i64, i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(completed), 0), COALESCE(SUM(claimed), 0) FROM features",
        )
        .fetch_one(self.pool())
        .await?;

        Ok(Stats::new(total, completed, claimed))
    }

    /// Per-label counters, unlabelled group first.
    pub async fn labels(&self) -> Result<Vec<LabelStats>> {
        let labels = sqlx::query_as::<_, LabelStats>(
            r"
            SELECT
                label,
                COUNT(*) AS count,
                SUM(completed) AS completed,
                SUM(CASE WHEN completed = 0 AND claimed = 1 THEN 1 ELSE 0 END) AS claimed,
                SUM(CASE WHEN completed = 0 AND claimed = 0 THEN 1 ELSE 0 END) AS pending
            FROM features
            GROUP BY label
            ORDER BY label IS NOT NULL, label ASC
            ",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(labels)
    }

    pub async fn list_existing(&self) -> Result<Vec<ExistingFeature>> {
        let features = sqlx::query_as::<_, ExistingFeature>(
            "SELECT id, name, category, label, completed FROM features ORDER BY priority ASC, id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        Ok(features)
    }

    /// Random sample of completed features for regression checks.
    pub async fn sample_completed(&self, limit: i64) -> Result<Vec<Feature>> {
        if !(1..=MAX_REGRESSION_SAMPLE).contains(&limit) {
            return Err(StoreError::Invalid(format!(
                "limit must be between 1 and {MAX_REGRESSION_SAMPLE}"
            )));
        }

        sqlx::query_as::<_, FeatureRow>(
            "SELECT * FROM features WHERE completed = 1 ORDER BY RANDOM() LIMIT ?",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(Feature::try_from)
        .collect()
    }
}

pub(crate) async fn fetch_feature(conn: &mut SqliteConnection, id: i64) -> Result<Feature> {
    sqlx::query_as::<_, FeatureRow>("SELECT * FROM features WHERE id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("Feature {id}")))
        .and_then(Feature::try_from)
}

/// Priority one past the current maximum, or 1 for an empty backlog.
async fn next_priority(conn: &mut SqliteConnection) -> Result<i64> {
    let max: Option<i64> = sqlx::query_scalar("SELECT MAX(priority) FROM features")
        .fetch_one(conn)
        .await?;
    Ok(max.map_or(1, |m| m + 1))
}

async fn insert_feature(
    conn: &mut SqliteConnection,
    item: &NewFeature,
    priority: i64,
    label: Option<&str>,
    now: i64,
) -> Result<i64> {
    let id = sqlx::query(
        r"
        INSERT INTO features
            (priority, kind, category, name, description, steps, label, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
    )
    .bind(priority)
    .bind(item.kind.as_str())
    .bind(&item.category)
    .bind(&item.name)
    .bind(&item.description)
    .bind(encode_steps(&item.steps)?)
    .bind(label)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    for (index, text) in (0_i64..).zip(&item.steps) {
        sqlx::query("INSERT INTO step_progress (feature_id, step_index, step_text) VALUES (?, ?, ?)")
            .bind(id)
            .bind(index)
            .bind(text)
            .execute(&mut *conn)
            .await?;
    }

    Ok(id)
}

fn encode_steps(steps: &[String]) -> Result<String> {
    serde_json::to_string(steps).map_err(|e| StoreError::Invalid(format!("steps: {e}")))
}
