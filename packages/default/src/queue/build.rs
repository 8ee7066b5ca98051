use super::step::Step;
use crate::models::{BuildId, BuildRow};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// One queued build held in memory while its step graph is live. Owned by
/// the `builds` index; everything else refers to it weakly.
pub struct Build {
    pub id: BuildId,
    pub drv_path: String,
    pub full_job_name: String,
    /// Seconds without output before a worker gives up. Opaque here.
    pub max_silent_time: i32,
    /// Overall build timeout in seconds. Opaque here.
    pub build_timeout: i32,
    finished_in_db: AtomicBool,
    toplevel: Mutex<Option<Arc<Step>>>,
}

impl Build {
    pub fn from_row(row: &BuildRow) -> Arc<Self> {
        Arc::new(Self {
            id: row.id,
            drv_path: row.drvpath.clone(),
            full_job_name: row.full_job_name(),
            max_silent_time: row.maxsilent,
            build_timeout: row.timeout,
            finished_in_db: AtomicBool::new(false),
            toplevel: Mutex::new(None),
        })
    }

    /// Whether the terminal row for this build has been written. Monotonic.
    pub fn finished_in_db(&self) -> bool {
        self.finished_in_db.load(Ordering::Acquire)
    }

    pub fn set_finished_in_db(&self) {
        self.finished_in_db.store(true, Ordering::Release);
    }

    pub fn toplevel(&self) -> Option<Arc<Step>> {
        self.toplevel
            .lock()
            .expect("build toplevel lock poisoned")
            .clone()
    }

    pub(crate) fn set_toplevel(&self, step: Arc<Step>) {
        *self
            .toplevel
            .lock()
            .expect("build toplevel lock poisoned") = Some(step);
    }
}
