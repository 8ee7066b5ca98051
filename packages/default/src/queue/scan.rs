use super::State;
use super::build::Build;
use super::step::Step;
use crate::models::{BuildId, BuildStatus, BuildStepStatus};
use anyhow::{Context, Result};
use futures::future::BoxFuture;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info};

pub(crate) const GC_ABORT_MSG: &str = "derivation was garbage-collected prior to build";

/// Queued builds pulled from the database but not yet loaded, in insertion
/// order, keyed by root derivation path. A restart can enqueue the same
/// derivation more than once, so this is a multimap.
#[derive(Default)]
pub(crate) struct NewBuilds {
    entries: VecDeque<(String, Arc<Build>)>,
}

impl NewBuilds {
    pub fn push(&mut self, build: Arc<Build>) {
        self.entries.push_back((build.drv_path.clone(), build));
    }

    pub fn pop_front(&mut self) -> Option<Arc<Build>> {
        self.entries.pop_front().map(|(_, build)| build)
    }

    /// Removes and returns the first queued build rooted at `drv_path`.
    pub fn take(&mut self, drv_path: &str) -> Option<Arc<Build>> {
        let pos = self.entries.iter().position(|(path, _)| path == drv_path)?;
        self.entries.remove(pos).map(|(_, build)| build)
    }
}

/// Accumulators shared across one queue scan.
#[derive(Default)]
pub(crate) struct ScanState {
    pub new_builds: NewBuilds,
    /// Derivation paths established as fully valid during this scan.
    pub finished_drvs: HashSet<String>,
    /// Every step created during this scan, in creation order. Each build
    /// load works on the slice it appended.
    pub new_steps: Vec<Arc<Step>>,
    /// Steps that became runnable while loading the current build.
    pub new_runnable: Vec<Arc<Step>>,
    pub nr_added: u64,
}

impl State {
    /// One queue scan: pick up unfinished builds above the high-water mark,
    /// wire their step graphs, and hand newly runnable steps to the
    /// workers. `last_build_id` only ever grows here.
    pub async fn get_queued_builds(&self, last_build_id: &mut BuildId) -> Result<()> {
        info!("checking the queue for builds > {}...", last_build_id);

        // Grab the queued builds, but don't process them inside the query:
        // step creation can take arbitrarily long and must not sit inside a
        // database transaction.
        let rows = self.db.queued_builds_after(*last_build_id).await?;

        // The high-water mark moves only once the whole scan went through:
        // a build that fails to load stays below the mark and is picked up
        // again on the retry, while committed builds are skipped via the
        // index.
        let mut highest_id = *last_build_id;

        let mut scan = ScanState::default();
        {
            let builds = self.lock_builds();
            for row in rows {
                if let Some(only) = self.build_one {
                    if row.id != only {
                        continue;
                    }
                }
                if row.id > highest_id {
                    highest_id = row.id;
                }
                if builds.contains_key(&row.id) {
                    continue;
                }
                scan.new_builds.push(Build::from_row(&row));
            }
        }

        /* Instantiate build steps for each new build. The workers can start
           on the runnable steps of one build while the rest of the queue is
           still being processed. */
        while let Some(build) = scan.new_builds.pop_front() {
            scan.new_runnable.clear();
            scan.nr_added = 0;

            let build_id = build.id;
            self.load_build(build, &mut scan)
                .await
                .with_context(|| format!("while loading build {}", build_id))?;

            debug!(
                "got {} new runnable steps from {} new builds",
                scan.new_runnable.len(),
                scan.nr_added
            );
            for step in scan.new_runnable.drain(..) {
                self.make_runnable(step);
            }

            self.nr_builds_read.fetch_add(scan.nr_added, Ordering::Relaxed);
        }

        *last_build_id = highest_id;
        Ok(())
    }

    /// Loads one build: resolves its step graph, settles it immediately if
    /// it is cached, known-failed or unsupported, and otherwise commits it
    /// into the index.
    pub(crate) fn load_build<'a>(
        &'a self,
        build: Arc<Build>,
        scan: &'a mut ScanState,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            debug!("loading build {} ({})", build.id, build.full_job_name);
            scan.nr_added += 1;

            if !self.store.is_valid_path(&build.drv_path).await? {
                // The derivation was GC'ed between enqueue and processing.
                error!("aborting GC'ed build {}", build.id);
                if !build.finished_in_db() {
                    self.db
                        .mark_build_aborted(build.id, GC_ABORT_MSG, unix_now())
                        .await?;
                    build.set_finished_in_db();
                    self.nr_builds_done.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(());
            }

            let first_new_step = scan.new_steps.len();
            let root = self
                .create_step(build.drv_path.clone(), Some(build.clone()), None, &mut *scan)
                .await?;
            let new_steps: Vec<Arc<Step>> = scan.new_steps[first_new_step..].to_vec();

            /* Some of the new steps may be the top level of builds we
               haven't processed yet. Load those now: if build A depends on
               build B with top-level step X, B must be accounted to X
               before a worker can finish X, or B never hears about it. */
            for step in &new_steps {
                while let Some(other) = scan.new_builds.take(&step.drv_path) {
                    self.load_build(other, &mut *scan).await?;
                }
            }

            /* No step means every output is already valid: a cached
               build. */
            let Some(root) = root else {
                let drv = self.store.read_derivation(&build.drv_path).await?;
                let output = self.store.build_output(&drv).await?;

                let now = unix_now();
                self.db
                    .mark_build_succeeded(build.id, &output, true, now, now)
                    .await?;
                build.set_finished_in_db();
                self.nr_builds_done.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            };

            /* If any step previously failed or cannot run on any machine,
               settle the build now instead of handing it to the workers. */
            for step in &new_steps {
                let mut build_status = BuildStatus::Success;
                let mut step_status = BuildStepStatus::Failed;

                if self.db.has_cached_failure(&step.output_paths()).await? {
                    error!("marking build {} as cached failure", build.id);
                    build_status = if Arc::ptr_eq(step, &root) {
                        BuildStatus::Failed
                    } else {
                        BuildStatus::DepFailed
                    };
                }

                if build_status == BuildStatus::Success && !self.step_supported(step) {
                    error!("aborting unsupported build {}", build.id);
                    build_status = BuildStatus::Unsupported;
                    step_status = BuildStepStatus::Unsupported;
                }

                if build_status != BuildStatus::Success {
                    if !build.finished_in_db() {
                        self.db
                            .mark_build_failed(
                                build.id,
                                &step.drv_path,
                                build_status,
                                step_status,
                                unix_now(),
                            )
                            .await?;
                        build.set_finished_in_db();
                        self.nr_builds_done.fetch_add(1, Ordering::Relaxed);
                    }
                    // The steps created for this build decay once nothing
                    // holds them.
                    return Ok(());
                }
            }

            /* Commit. From here the build is discoverable by workers
               walking the graph. A build that finished concurrently is
               skipped, not re-inserted. */
            {
                let mut builds = self.lock_builds();
                if !build.finished_in_db() {
                    builds.insert(build.id, build.clone());
                }
                build.set_toplevel(root.clone());
            }

            debug!(
                "added build {} (top-level step {}, {} new steps)",
                build.id,
                root.drv_path,
                new_steps.len()
            );
            Ok(())
        })
    }

    fn step_supported(&self, step: &Step) -> bool {
        let Some(info) = step.info() else {
            return false;
        };
        let machines = self.machines.read().expect("machine registry lock poisoned");
        machines
            .iter()
            .any(|m| m.supports_step(&info.drv.platform, &info.required_system_features))
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
