use anyhow::Result;
use sqlx::PgPool;

/// Whether any of the given output paths is recorded in `failedpaths`. A hit
/// fails the depending build immediately instead of re-running a build that
/// is known to break.
pub async fn has_cached_failure(pool: &PgPool, output_paths: &[String]) -> Result<bool> {
    let failed: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM failedpaths WHERE path = ANY($1))")
            .bind(output_paths)
            .fetch_one(pool)
            .await?;

    Ok(failed)
}
