//! Repair tasks and votes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use rustbelt_types::{Task, TaskId, Vote};

use crate::error::DbError;
use crate::rows::{TaskRow, decode_all};

const TASK_COLUMNS: &str = "id, feature_id, region_id, status, cost_food, cost_equipment, cost_energy, \
                            cost_materials, duration_secs, repair_amount, priority_score, vote_score, \
                            created_at, completed_at";

/// New scores for an open task.
#[derive(Debug, Clone, PartialEq)]
pub struct PriorityUpdate {
    /// The task with its new scores.
    pub task: Task,
    /// Priority before the refresh.
    pub previous_priority: f64,
}

/// Operations on the `tasks` and `votes` tables.
pub struct TaskStore<'a> {
    pool: &'a PgPool,
}

impl<'a> TaskStore<'a> {
    /// Create a store bound to a connection pool.
    pub const fn new(pool: &'a PgPool) -> Self {
        Self { pool }
    }

    /// Tasks not yet done.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the query fails.
    pub async fn load_open(&self) -> Result<Vec<Task>, DbError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status <> 'done' ORDER BY created_at, id"
        ))
        .fetch_all(self.pool)
        .await?;
        Ok(decode_all(rows))
    }

    /// Insert new tasks, skipping any road that already has an open one.
    ///
    /// The partial unique index on open tasks makes this idempotent under
    /// concurrency: a conflicting row is dropped, not an error. Returns
    /// the IDs actually inserted.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the insert fails.
    pub async fn insert_new(&self, tasks: &[Task]) -> Result<Vec<TaskId>, DbError> {
        if tasks.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id.into_inner()).collect();
        let features: Vec<Uuid> = tasks.iter().map(|t| t.feature_id.into_inner()).collect();
        let regions: Vec<Uuid> = tasks.iter().map(|t| t.region_id.into_inner()).collect();
        let statuses: Vec<&str> = tasks.iter().map(|t| t.status.as_str()).collect();
        let food: Vec<i64> = tasks.iter().map(|t| t.costs.food).collect();
        let equipment: Vec<i64> = tasks.iter().map(|t| t.costs.equipment).collect();
        let energy: Vec<i64> = tasks.iter().map(|t| t.costs.energy).collect();
        let materials: Vec<i64> = tasks.iter().map(|t| t.costs.materials).collect();
        let durations: Vec<i64> = tasks.iter().map(|t| t.duration_secs).collect();
        let repair: Vec<f64> = tasks.iter().map(|t| t.repair_amount).collect();
        let priority: Vec<f64> = tasks.iter().map(|t| t.priority_score).collect();
        let created: Vec<DateTime<Utc>> = tasks.iter().map(|t| t.created_at).collect();

        let inserted: Vec<Uuid> = sqlx::query_scalar(
            r"INSERT INTO tasks
                  (id, feature_id, region_id, status, cost_food, cost_equipment, cost_energy, cost_materials,
                   duration_secs, repair_amount, priority_score, created_at)
              SELECT * FROM UNNEST(
                  $1::UUID[], $2::UUID[], $3::UUID[], $4::TEXT[], $5::BIGINT[], $6::BIGINT[], $7::BIGINT[],
                  $8::BIGINT[], $9::BIGINT[], $10::DOUBLE PRECISION[], $11::DOUBLE PRECISION[],
                  $12::TIMESTAMPTZ[])
              ON CONFLICT (feature_id) WHERE status <> 'done' DO NOTHING
              RETURNING id",
        )
        .bind(&ids)
        .bind(&features)
        .bind(&regions)
        .bind(&statuses)
        .bind(&food)
        .bind(&equipment)
        .bind(&energy)
        .bind(&materials)
        .bind(&durations)
        .bind(&repair)
        .bind(&priority)
        .bind(&created)
        .fetch_all(self.pool)
        .await?;

        tracing::debug!(offered = tasks.len(), inserted = inserted.len(), "repair tasks spawned");
        Ok(inserted.into_iter().map(TaskId::from).collect())
    }

    /// Recompute the scores of every open task.
    ///
    /// Open tasks are locked with `FOR UPDATE SKIP LOCKED` so a task being
    /// claimed by a crew right now keeps its scores until the next tick.
    /// `score` receives the task and its votes as `(weight, cast_at)` and
    /// returns `(vote_score, priority_score)`.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if any statement fails.
    pub async fn refresh_priorities<F>(&self, mut score: F) -> Result<Vec<PriorityUpdate>, DbError>
    where
        F: FnMut(&Task, &[(f64, DateTime<Utc>)]) -> Option<(f64, f64)> + Send,
    {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE status <> 'done' ORDER BY id FOR UPDATE SKIP LOCKED"
        ))
        .fetch_all(&mut *tx)
        .await?;
        let tasks: Vec<Task> = decode_all(rows);
        if tasks.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id.into_inner()).collect();
        let vote_rows: Vec<(Uuid, f64, DateTime<Utc>)> =
            sqlx::query_as("SELECT task_id, weight, created_at FROM votes WHERE task_id = ANY($1)")
                .bind(&ids)
                .fetch_all(&mut *tx)
                .await?;
        let mut votes: BTreeMap<TaskId, Vec<(f64, DateTime<Utc>)>> = BTreeMap::new();
        for (task_id, weight, cast_at) in vote_rows {
            votes.entry(TaskId::from(task_id)).or_default().push((weight, cast_at));
        }

        let updates: Vec<PriorityUpdate> = tasks
            .into_iter()
            .filter_map(|task| {
                let cast = votes.get(&task.id).map_or(&[][..], Vec::as_slice);
                let (vote_score, priority_score) = score(&task, cast)?;
                let previous_priority = task.priority_score;
                Some(PriorityUpdate {
                    task: Task {
                        vote_score,
                        priority_score,
                        ..task
                    },
                    previous_priority,
                })
            })
            .collect();

        let ids: Vec<Uuid> = updates.iter().map(|u| u.task.id.into_inner()).collect();
        let vote_scores: Vec<f64> = updates.iter().map(|u| u.task.vote_score).collect();
        let priorities: Vec<f64> = updates.iter().map(|u| u.task.priority_score).collect();
        sqlx::query(
            r"UPDATE tasks t SET vote_score = u.vote_score, priority_score = u.priority_score
              FROM UNNEST($1::UUID[], $2::DOUBLE PRECISION[], $3::DOUBLE PRECISION[])
                   AS u(id, vote_score, priority_score)
              WHERE t.id = u.id",
        )
        .bind(&ids)
        .bind(&vote_scores)
        .bind(&priorities)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(updates)
    }

    /// Insert or replace a voter's vote on an open task.
    ///
    /// Returns `false` if the task does not exist or is done; nothing is
    /// written in that case.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Postgres`] if the upsert fails.
    pub async fn upsert_vote(&self, vote: &Vote) -> Result<bool, DbError> {
        let result = sqlx::query(
            r"INSERT INTO votes (task_id, voter_id, weight, created_at)
              SELECT $1, $2, $3, $4
              WHERE EXISTS (SELECT 1 FROM tasks WHERE id = $1 AND status <> 'done')
              ON CONFLICT (task_id, voter_id)
              DO UPDATE SET weight = EXCLUDED.weight, created_at = EXCLUDED.created_at",
        )
        .bind(vote.task_id.into_inner())
        .bind(vote.voter_id.into_inner())
        .bind(vote.weight)
        .bind(vote.created_at)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
