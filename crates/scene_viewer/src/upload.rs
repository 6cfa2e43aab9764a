//! Single-consumer handoff queue for deferred GPU work. Loader workers push
//! closures; the render thread drains them FIFO at the top of each frame.
//! The render thread never blocks here outside of shutdown.

use crate::renderer::MeshRenderer;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub type UploadTask = Box<dyn FnOnce(&mut dyn MeshRenderer) + Send + 'static>;

#[derive(Default)]
pub struct UploadQueue {
    tasks: Mutex<VecDeque<UploadTask>>,
    cv: Condvar,
}

impl UploadQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: UploadTask) {
        self.tasks.lock().push_back(task);
        self.cv.notify_one();
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking FIFO drain; runs every currently queued task. Tasks are
    /// moved out first so producers never wait on GPU work. Returns the
    /// number executed.
    pub fn drain(&self, renderer: &mut dyn MeshRenderer) -> usize {
        let mut batch: VecDeque<UploadTask> = std::mem::take(&mut *self.tasks.lock());
        let n = batch.len();
        for task in batch.drain(..) {
            task(renderer);
        }
        n
    }

    /// Shutdown drain: keep executing tasks until the queue stays empty for
    /// `idle_grace` (stragglers from still-exiting workers get a window to
    /// arrive), or until `deadline` elapses. Returns how many tasks were
    /// left behind.
    pub fn drain_for(
        &self,
        renderer: &mut dyn MeshRenderer,
        deadline: Duration,
        idle_grace: Duration,
    ) -> usize {
        let start = Instant::now();
        loop {
            self.drain(renderer);

            let mut tasks = self.tasks.lock();
            if start.elapsed() >= deadline {
                return tasks.len();
            }
            if tasks.is_empty() {
                let timed_out = self.cv.wait_for(&mut tasks, idle_grace).timed_out();
                if timed_out && tasks.is_empty() {
                    return 0;
                }
            }
        }
    }
}
