use crate::config::QuarryConfig;
use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

pub async fn get_db_pool() -> Result<PgPool> {
    let cfg = QuarryConfig::load()?;
    cfg.db_pool().await
}

/// Creates the queue tables if they are missing. The evaluator that inserts
/// queued builds shares this schema; the monitor only needs it to exist.
pub async fn init_db(pool: &PgPool) -> Result<()> {
    info!("======== INITIALIZING DATABASE ========");

    sqlx::raw_sql(
        "
        CREATE TABLE IF NOT EXISTS builds (
            id SERIAL PRIMARY KEY,
            finished INT NOT NULL DEFAULT 0,
            busy INT NOT NULL DEFAULT 0,
            project TEXT NOT NULL,
            jobset TEXT NOT NULL,
            job TEXT NOT NULL,
            drvpath TEXT NOT NULL,
            maxsilent INT NOT NULL DEFAULT 3600,
            timeout INT NOT NULL DEFAULT 36000,
            buildstatus INT,
            starttime BIGINT,
            stoptime BIGINT,
            iscachedbuild INT,
            errormsg TEXT
        );

        CREATE TABLE IF NOT EXISTS buildsteps (
            build INT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
            stepnr INT NOT NULL,
            type INT NOT NULL DEFAULT 0,
            drvpath TEXT,
            busy INT NOT NULL DEFAULT 0,
            status INT,
            errormsg TEXT,
            starttime BIGINT,
            stoptime BIGINT,
            logfile TEXT,
            PRIMARY KEY (build, stepnr)
        );

        CREATE TABLE IF NOT EXISTS buildoutputs (
            build INT NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            PRIMARY KEY (build, name)
        );

        CREATE TABLE IF NOT EXISTS failedpaths (
            path TEXT PRIMARY KEY
        );
        ",
    )
    .execute(pool)
    .await?;

    Ok(())
}
