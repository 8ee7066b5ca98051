use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Stable integer key of a row in `builds`.
pub type BuildId = i32;

/// One queued build as read by the scanner.
#[derive(Debug, Clone, FromRow)]
pub struct BuildRow {
    pub id: BuildId,
    pub project: String,
    pub jobset: String,
    pub job: String,
    pub drvpath: String,
    pub maxsilent: i32,
    pub timeout: i32,
}

impl BuildRow {
    /// `project:jobset:job`, the human-readable job triple.
    pub fn full_job_name(&self) -> String {
        format!("{}:{}:{}", self.project, self.jobset, self.job)
    }
}

// The integers are written to the buildstatus column and are observable by
// everything else reading the database. Do not renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Success = 0,
    Failed = 1,
    DepFailed = 2,
    Aborted = 3,
    Unsupported = 4,
}

impl BuildStatus {
    pub fn as_id(&self) -> i32 {
        *self as i32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStepStatus {
    Failed = 1,
    Unsupported = 7,
}

impl BuildStepStatus {
    pub fn as_id(&self) -> i32 {
        *self as i32
    }
}

/// What a finished (here: cache-valid) build produced, as recorded in
/// `buildoutputs` by the success writer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildOutput {
    pub outputs: Vec<BuildOutputPath>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildOutputPath {
    pub name: String,
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_ids_are_stable() {
        assert_eq!(BuildStatus::Success.as_id(), 0);
        assert_eq!(BuildStatus::Failed.as_id(), 1);
        assert_eq!(BuildStatus::DepFailed.as_id(), 2);
        assert_eq!(BuildStatus::Aborted.as_id(), 3);
        assert_eq!(BuildStatus::Unsupported.as_id(), 4);

        assert_eq!(BuildStepStatus::Failed.as_id(), 1);
        assert_eq!(BuildStepStatus::Unsupported.as_id(), 7);
    }

    #[test]
    fn test_full_job_name() {
        let row = BuildRow {
            id: 7,
            project: "nixpkgs".into(),
            jobset: "trunk".into(),
            job: "hello.x86_64-linux".into(),
            drvpath: "/nix/store/abc-hello-2.12.drv".into(),
            maxsilent: 3600,
            timeout: 36000,
        };
        assert_eq!(row.full_job_name(), "nixpkgs:trunk:hello.x86_64-linux");
    }
}
