use crate::models::{BuildId, BuildOutput, BuildRow, BuildStatus, BuildStepStatus};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashSet;

pub mod build_steps;
pub mod builds;
pub mod failures;

/// Everything the queue monitor asks of or tells the database. The Postgres
/// implementation below delegates to the per-table query functions; tests
/// use an in-memory implementation.
#[async_trait]
pub trait QueueDb: Send + Sync {
    /// Unfinished builds with `id > last_build_id`, ordered by id ascending.
    async fn queued_builds_after(&self, last_build_id: BuildId) -> Result<Vec<BuildRow>>;

    /// Ids of all currently unfinished builds (for the cancellation diff).
    async fn unfinished_build_ids(&self) -> Result<HashSet<BuildId>>;

    /// Terminal row for a build whose derivation disappeared from the store.
    async fn mark_build_aborted(&self, build_id: BuildId, error_msg: &str, now: i64)
    -> Result<()>;

    /// Terminal success row plus the recorded outputs.
    async fn mark_build_succeeded(
        &self,
        build_id: BuildId,
        output: &BuildOutput,
        is_cached: bool,
        start_time: i64,
        stop_time: i64,
    ) -> Result<()>;

    /// One transaction: the failed step row (stepnr 0), then the terminal
    /// build row. `isCachedBuild` is 0 only for Unsupported so a later
    /// machine registration can pick the build up again after a restart.
    async fn mark_build_failed(
        &self,
        build_id: BuildId,
        step_drv_path: &str,
        status: BuildStatus,
        step_status: BuildStepStatus,
        now: i64,
    ) -> Result<()>;

    /// Whether any of the given output paths failed before.
    async fn has_cached_failure(&self, output_paths: &[String]) -> Result<bool>;
}

pub struct PgQueueDb {
    pool: PgPool,
}

impl PgQueueDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueueDb for PgQueueDb {
    async fn queued_builds_after(&self, last_build_id: BuildId) -> Result<Vec<BuildRow>> {
        builds::get_queued_builds_after(&self.pool, last_build_id).await
    }

    async fn unfinished_build_ids(&self) -> Result<HashSet<BuildId>> {
        builds::get_unfinished_build_ids(&self.pool).await
    }

    async fn mark_build_aborted(
        &self,
        build_id: BuildId,
        error_msg: &str,
        now: i64,
    ) -> Result<()> {
        builds::mark_build_aborted(&self.pool, build_id, error_msg, now).await
    }

    async fn mark_build_succeeded(
        &self,
        build_id: BuildId,
        output: &BuildOutput,
        is_cached: bool,
        start_time: i64,
        stop_time: i64,
    ) -> Result<()> {
        builds::mark_build_succeeded(&self.pool, build_id, output, is_cached, start_time, stop_time)
            .await
    }

    async fn mark_build_failed(
        &self,
        build_id: BuildId,
        step_drv_path: &str,
        status: BuildStatus,
        step_status: BuildStepStatus,
        now: i64,
    ) -> Result<()> {
        builds::mark_build_failed(&self.pool, build_id, step_drv_path, status, step_status, now)
            .await
    }

    async fn has_cached_failure(&self, output_paths: &[String]) -> Result<bool> {
        failures::has_cached_failure(&self.pool, output_paths).await
    }
}
