use crate::models::{BuildId, BuildOutput, BuildRow, BuildStatus, BuildStepStatus};
use anyhow::Result;
use sqlx::PgPool;
use std::collections::HashSet;
use tracing::warn;

use super::build_steps::create_build_step;

pub async fn get_queued_builds_after(
    pool: &PgPool,
    last_build_id: BuildId,
) -> Result<Vec<BuildRow>> {
    let rows = sqlx::query_as::<_, BuildRow>(
        "
        SELECT id, project, jobset, job, drvpath, maxsilent, timeout
        FROM builds
        WHERE id > $1 AND finished = 0
        ORDER BY id
        ",
    )
    .bind(last_build_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn get_unfinished_build_ids(pool: &PgPool) -> Result<HashSet<BuildId>> {
    let ids: Vec<BuildId> = sqlx::query_scalar("SELECT id FROM builds WHERE finished = 0")
        .fetch_all(pool)
        .await?;

    Ok(ids.into_iter().collect())
}

pub async fn mark_build_aborted(
    pool: &PgPool,
    build_id: BuildId,
    error_msg: &str,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "
        UPDATE builds
        SET finished = 1, busy = 0, buildstatus = $2, starttime = $3, stoptime = $3,
            errormsg = $4
        WHERE id = $1 AND finished = 0
        ",
    )
    .bind(build_id)
    .bind(BuildStatus::Aborted.as_id())
    .bind(now)
    .bind(error_msg)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_build_succeeded(
    pool: &PgPool,
    build_id: BuildId,
    output: &BuildOutput,
    is_cached: bool,
    start_time: i64,
    stop_time: i64,
) -> Result<()> {
    let mut txn = pool.begin().await?;

    let updated = sqlx::query(
        "
        UPDATE builds
        SET finished = 1, busy = 0, buildstatus = $2, starttime = $3, stoptime = $4,
            iscachedbuild = $5
        WHERE id = $1 AND finished = 0
        ",
    )
    .bind(build_id)
    .bind(BuildStatus::Success.as_id())
    .bind(start_time)
    .bind(stop_time)
    .bind(i32::from(is_cached))
    .execute(&mut *txn)
    .await?;

    if updated.rows_affected() == 0 {
        // Someone else finished it first; nothing to record.
        warn!("build {} already finished, skipping success record", build_id);
        txn.commit().await?;
        return Ok(());
    }

    for out in &output.outputs {
        sqlx::query(
            "
            INSERT INTO buildoutputs (build, name, path)
            VALUES ($1, $2, $3)
            ON CONFLICT (build, name) DO NOTHING
            ",
        )
        .bind(build_id)
        .bind(&out.name)
        .bind(&out.path)
        .execute(&mut *txn)
        .await?;
    }

    txn.commit().await?;
    Ok(())
}

pub async fn mark_build_failed(
    pool: &PgPool,
    build_id: BuildId,
    step_drv_path: &str,
    status: BuildStatus,
    step_status: BuildStepStatus,
    now: i64,
) -> Result<()> {
    let mut txn = pool.begin().await?;

    create_build_step(&mut txn, build_id, 0, step_drv_path, "", step_status, now).await?;

    sqlx::query(
        "
        UPDATE builds
        SET finished = 1, busy = 0, buildstatus = $2, starttime = $3, stoptime = $3,
            iscachedbuild = $4
        WHERE id = $1 AND finished = 0
        ",
    )
    .bind(build_id)
    .bind(status.as_id())
    .bind(now)
    .bind(i32::from(status != BuildStatus::Unsupported))
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;
    Ok(())
}
