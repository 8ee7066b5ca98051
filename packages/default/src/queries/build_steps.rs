use crate::models::{BuildId, BuildStepStatus};
use anyhow::Result;
use sqlx::{Postgres, Transaction};

pub async fn create_build_step(
    txn: &mut Transaction<'_, Postgres>,
    build_id: BuildId,
    step_nr: i32,
    drv_path: &str,
    log_file: &str,
    status: BuildStepStatus,
    now: i64,
) -> Result<()> {
    sqlx::query(
        "
        INSERT INTO buildsteps (build, stepnr, type, drvpath, busy, status,
                                starttime, stoptime, logfile)
        VALUES ($1, $2, 0, $3, 0, $4, $5, $5, $6)
        ",
    )
    .bind(build_id)
    .bind(step_nr)
    .bind(drv_path)
    .bind(status.as_id())
    .bind(now)
    .bind(log_file)
    .execute(&mut **txn)
    .await?;

    Ok(())
}
