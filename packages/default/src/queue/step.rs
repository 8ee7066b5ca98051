use super::State;
use super::build::Build;
use super::scan::ScanState;
use crate::store::Derivation;
use anyhow::{Result, ensure};
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::debug;

/// One node of the in-memory build DAG, uniquely keyed by derivation path.
/// Shared between every build that needs it.
pub struct Step {
    pub drv_path: String,
    info: OnceLock<StepInfo>,
    state: Mutex<StepState>,
}

/// Derivation metadata, filled in once after the step is published to the
/// index. Readers gate on `created`, so a missing info is never observed by
/// a schedulable step.
pub struct StepInfo {
    pub drv: Derivation,
    pub required_system_features: BTreeSet<String>,
    pub prefer_local_build: bool,
}

#[derive(Default)]
struct StepState {
    /// False until all dependency edges are wired. A step with
    /// `created == false` must never be treated as schedulable.
    created: bool,
    /// Outgoing edges; strong, they keep the subgraph alive.
    deps: Vec<Arc<Step>>,
    /// Incoming edges.
    rdeps: Vec<Weak<Step>>,
    /// Builds that need this step.
    builds: Vec<Weak<Build>>,
}

impl Step {
    fn new(drv_path: String) -> Arc<Self> {
        Arc::new(Self {
            drv_path,
            info: OnceLock::new(),
            state: Mutex::new(StepState::default()),
        })
    }

    pub fn info(&self) -> Option<&StepInfo> {
        self.info.get()
    }

    pub fn output_paths(&self) -> Vec<String> {
        self.info()
            .map(|i| i.drv.output_paths())
            .unwrap_or_default()
    }

    pub fn created(&self) -> bool {
        self.lock_state().created
    }

    /// Schedulable right now: fully wired and nothing left to wait for.
    pub fn runnable(&self) -> bool {
        let st = self.lock_state();
        st.created && st.deps.is_empty()
    }

    pub fn num_deps(&self) -> usize {
        self.lock_state().deps.len()
    }

    pub fn deps(&self) -> Vec<Arc<Step>> {
        self.lock_state().deps.clone()
    }

    /// Live builds needing this step.
    pub fn builds(&self) -> Vec<Arc<Build>> {
        self.lock_state()
            .builds
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// Live steps depending on this one.
    pub fn rdeps(&self) -> Vec<Arc<Step>> {
        self.lock_state()
            .rdeps
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StepState> {
        self.state.lock().expect("step state lock poisoned")
    }
}

impl State {
    /// Looks up or creates the shared step for `drv_path` and wires it to
    /// its referrers. Returns `None` when every output is already valid in
    /// the store (nothing to build). Newly created steps land in
    /// `scan.new_steps`; those without dependencies land in
    /// `scan.new_runnable` as well.
    pub(crate) fn create_step<'a>(
        &'a self,
        drv_path: String,
        referring_build: Option<Arc<Build>>,
        referring_step: Option<Arc<Step>>,
        scan: &'a mut ScanState,
    ) -> BoxFuture<'a, Result<Option<Arc<Step>>>> {
        Box::pin(async move {
            if scan.finished_drvs.contains(&drv_path) {
                return Ok(None);
            }

            /* Look up or create the step, and make it reachable from the
               referring build or step, in one critical section on the index.
               A step can then never become reachable from a new build after
               a worker has retired it from the index. */
            let step;
            let is_new;
            {
                let mut steps = self.lock_steps();

                let existing = steps.get(&drv_path).and_then(Weak::upgrade);
                if existing.is_none() {
                    // Drop the stale entry, if any.
                    steps.remove(&drv_path);
                }

                match existing {
                    Some(prev) => {
                        step = prev;
                        is_new = false;
                    }
                    None => {
                        step = Step::new(drv_path.clone());
                        is_new = true;
                    }
                }

                {
                    let mut st = step.lock_state();

                    ensure!(
                        st.created != is_new,
                        "step {} observed in an impossible creation state",
                        drv_path
                    );

                    if let Some(build) = &referring_build {
                        st.builds.push(Arc::downgrade(build));
                    }
                    if let Some(rdep) = &referring_step {
                        st.rdeps.push(Arc::downgrade(rdep));
                    }
                }

                steps.insert(drv_path.clone(), Arc::downgrade(&step));
            }

            // An existing step already carries its whole subgraph.
            if !is_new {
                return Ok(Some(step));
            }

            debug!("considering derivation '{}'", drv_path);

            /* The step may be visible in the index before this point, but
               that is harmless: with created == false nothing will schedule
               it. */
            let drv = self.store.read_derivation(&drv_path).await?;

            let mut all_outputs_valid = true;
            for output in &drv.outputs {
                if !self.store.is_valid_path(&output.path).await? {
                    all_outputs_valid = false;
                    break;
                }
            }

            let info = StepInfo {
                required_system_features: drv.required_system_features(),
                prefer_local_build: drv.prefer_local_build(&self.local_platforms),
                drv,
            };
            let input_drvs = info.drv.input_drvs.clone();
            let _ = step.info.set(info);

            if all_outputs_valid {
                // Nothing to build. The index entry decays with the last
                // strong reference.
                scan.finished_drvs.insert(drv_path);
                return Ok(None);
            }

            debug!("creating build step '{}'", drv_path);
            scan.new_steps.push(step.clone());

            for dep_path in input_drvs {
                let dep = self
                    .create_step(dep_path, None, Some(step.clone()), &mut *scan)
                    .await?;
                if let Some(dep) = dep {
                    step.lock_state().deps.push(dep);
                }
            }

            {
                let mut st = step.lock_state();
                ensure!(!st.created, "step {} wired twice", step.drv_path);
                st.created = true;
                if st.deps.is_empty() {
                    scan.new_runnable.push(step.clone());
                }
            }

            Ok(Some(step))
        })
    }
}
