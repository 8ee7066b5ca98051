use crate::config::QueueConfig;
use crate::machines::Machine;
use crate::models::BuildId;
use crate::queries::QueueDb;
use crate::store::BuildStore;
use anyhow::Result;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

pub mod build;
pub mod scan;
pub mod step;

pub use build::Build;
pub use step::{Step, StepInfo};

const CHANNELS: [&str; 4] = [
    "builds_added",
    "builds_restarted",
    "builds_cancelled",
    "builds_deleted",
];

/// Shared state of the queue monitor: the build and step indices, the
/// machine registry, and the sink feeding the worker pool.
///
/// Lock order: `steps` may be taken first and a step's own state lock under
/// it; `builds` is a leaf. No lock is ever held across an await.
pub struct State {
    pub(crate) db: Arc<dyn QueueDb>,
    pub(crate) store: Arc<dyn BuildStore>,
    pub(crate) machines: RwLock<Vec<Machine>>,
    pub(crate) local_platforms: Vec<String>,
    pub(crate) build_one: Option<BuildId>,
    retry_interval: Duration,

    /// Live builds by id. Owns the build objects; a build leaves when its
    /// terminal row is written or the reaper evicts it.
    builds: Mutex<HashMap<BuildId, Arc<Build>>>,
    /// Steps by derivation path. Weak: strong ownership flows through
    /// `Build::toplevel` and `Step::deps` only, so finished subgraphs decay
    /// on their own. Stale entries are dropped on the next lookup.
    steps: Mutex<HashMap<String, Weak<Step>>>,

    runnable_tx: UnboundedSender<Arc<Step>>,

    pub nr_queue_wakeups: AtomicU64,
    pub nr_builds_read: AtomicU64,
    pub nr_builds_done: AtomicU64,
}

impl State {
    pub fn new(
        db: Arc<dyn QueueDb>,
        store: Arc<dyn BuildStore>,
        machines: Vec<Machine>,
        queue_cfg: &QueueConfig,
        runnable_tx: UnboundedSender<Arc<Step>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            store,
            machines: RwLock::new(machines),
            local_platforms: queue_cfg.local_platforms.clone(),
            build_one: queue_cfg.build_one,
            retry_interval: Duration::from_secs(queue_cfg.retry_interval_secs),
            builds: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            runnable_tx,
            nr_queue_wakeups: AtomicU64::new(0),
            nr_builds_read: AtomicU64::new(0),
            nr_builds_done: AtomicU64::new(0),
        })
    }

    /// Runs the queue monitor forever. Failures inside the monitor loop are
    /// logged and the whole setup is retried after a pause; the pause is
    /// sized for transient database outages.
    pub async fn run(self: Arc<Self>, pool: PgPool) {
        // Survives monitor restarts: a transient failure must not rewind
        // the scan high-water mark. Only a restart notification does.
        let mut last_build_id: BuildId = 0;

        loop {
            if let Err(e) = self.monitor_loop(&pool, &mut last_build_id).await {
                error!("queue monitor: {:#}", e);
                sleep(self.retry_interval).await;
            }
        }
    }

    async fn monitor_loop(&self, pool: &PgPool, last_build_id: &mut BuildId) -> Result<()> {
        let mut listener = PgListener::connect_with(pool).await?;
        listener.listen_all(CHANNELS).await?;

        info!("🛎️ queue monitor listening on {:?}", CHANNELS);

        loop {
            self.get_queued_builds(last_build_id).await?;

            // Sleep until the database notifies us of an event.
            let flags = Notifications::wait(&mut listener).await?;
            self.nr_queue_wakeups.fetch_add(1, Ordering::Relaxed);

            if flags.added {
                debug!("got notification: new builds added to the queue");
            }
            if flags.restarted {
                debug!("got notification: builds restarted");
                *last_build_id = 0; // check all builds
            }
            if flags.cancelled || flags.deleted {
                debug!("got notification: builds cancelled");
                self.remove_cancelled_builds().await?;
            }
        }
    }

    /// Evicts in-memory builds that are no longer unfinished in the
    /// database. Steps already running on the workers are not interrupted.
    pub async fn remove_cancelled_builds(&self) -> Result<()> {
        let current_ids = self.db.unfinished_build_ids().await?;

        let mut builds = self.lock_builds();
        builds.retain(|id, _| {
            if current_ids.contains(id) {
                true
            } else {
                info!("discarding cancelled build {}", id);
                false
            }
        });

        Ok(())
    }

    /// Hands one newly runnable step to the worker pool. Each step passes
    /// through here exactly once.
    pub(crate) fn make_runnable(&self, step: Arc<Step>) {
        debug!("step '{}' is now runnable", step.drv_path);
        if self.runnable_tx.send(step).is_err() {
            warn!("worker pool is gone; dropping runnable step");
        }
    }

    /// Replaces the machine registry, e.g. after a machine (de)registers.
    /// Already-settled Unsupported builds are only revisited via a restart
    /// notification.
    pub fn set_machines(&self, machines: Vec<Machine>) {
        *self
            .machines
            .write()
            .expect("machine registry lock poisoned") = machines;
    }

    pub(crate) fn lock_builds(&self) -> MutexGuard<'_, HashMap<BuildId, Arc<Build>>> {
        self.builds.lock().expect("builds index lock poisoned")
    }

    pub(crate) fn lock_steps(&self) -> MutexGuard<'_, HashMap<String, Weak<Step>>> {
        self.steps.lock().expect("steps index lock poisoned")
    }

    pub fn build(&self, id: BuildId) -> Option<Arc<Build>> {
        self.lock_builds().get(&id).cloned()
    }

    pub fn num_builds(&self) -> usize {
        self.lock_builds().len()
    }

    /// The live step for a derivation path, if any build still needs it.
    pub fn step(&self, drv_path: &str) -> Option<Arc<Step>> {
        self.lock_steps().get(drv_path).and_then(Weak::upgrade)
    }

    pub fn num_live_steps(&self) -> usize {
        self.lock_steps()
            .values()
            .filter(|weak| weak.upgrade().is_some())
            .count()
    }
}

#[derive(Debug, Default)]
struct Notifications {
    added: bool,
    restarted: bool,
    cancelled: bool,
    deleted: bool,
}

impl Notifications {
    /// Blocks for the next notification, then collects whatever else has
    /// already arrived so a single wakeup honors every flag. Only buffered
    /// notifications are inspected; there is no second wait.
    async fn wait(listener: &mut PgListener) -> Result<Self> {
        let mut flags = Self::default();

        let first = listener.recv().await?;
        flags.set(first.channel());

        while let Some(notification) = listener.try_recv().await? {
            flags.set(notification.channel());
        }

        Ok(flags)
    }

    fn set(&mut self, channel: &str) {
        match channel {
            "builds_added" => self.added = true,
            "builds_restarted" => self.restarted = true,
            "builds_cancelled" => self.cancelled = true,
            "builds_deleted" => self.deleted = true,
            other => warn!("notification on unexpected channel {}", other),
        }
    }
}
