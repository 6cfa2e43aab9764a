//! Admission control. A dedicated thread promotes UNLOADED scenes into the
//! loader under a concurrency cap, honors user prioritization, and owns the
//! unload path.

use super::loader::SceneLoader;
use super::store::SceneStore;
use super::types::{SceneDescriptor, SceneState};
use crate::renderer::MeshRenderer;
use crate::upload::UploadQueue;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission cap: how many scenes may be LOADING (plus already LOADED)
    /// before the scheduler stops promoting new ones.
    pub max_loading: usize,
    /// Period of the admission pass.
    pub admission_period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_loading: 5,
            admission_period: Duration::from_millis(200),
        }
    }
}

pub struct SceneScheduler {
    store: Arc<SceneStore>,
    loader: Arc<SceneLoader>,
    uploads: Arc<UploadQueue>,
    staging_dir: PathBuf,
    config: SchedulerConfig,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SceneScheduler {
    pub fn new(
        store: Arc<SceneStore>,
        loader: Arc<SceneLoader>,
        uploads: Arc<UploadQueue>,
        staging_dir: PathBuf,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            loader,
            uploads,
            staging_dir,
            config,
            running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Idempotent register; the descriptor persists for the process
    /// lifetime.
    pub fn register(&self, scene_id: &str) -> Arc<SceneDescriptor> {
        let desc = self.store.get_or_create(scene_id);
        tracing::debug!(scene_id, "Scene registered");
        desc
    }

    /// Spawn the admission thread. Repeated calls are no-ops. The thread
    /// captures clones of the shared pieces rather than the scheduler
    /// itself, so `stop` can always join it.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let store = self.store.clone();
        let loader = self.loader.clone();
        let config = self.config.clone();
        let running = self.running.clone();

        let handle = std::thread::Builder::new()
            .name("scene-scheduler".into())
            .spawn(move || {
                tracing::info!(
                    max_loading = config.max_loading,
                    "Scheduler admission loop started"
                );
                while running.load(Ordering::Acquire) {
                    admit_pass(&store, &loader, config.max_loading);
                    std::thread::sleep(config.admission_period);
                }
                tracing::info!("Scheduler admission loop stopped");
            })
            .expect("failed to spawn scheduler thread");
        *self.thread.lock() = Some(handle);
    }

    /// Run one admission pass now, outside the periodic loop.
    pub fn admit_pass(&self) {
        admit_pass(&self.store, &self.loader, self.config.max_loading);
    }

    /// Move the scene to the head of the admission order. Does not preempt a
    /// load already in flight.
    pub fn prioritize(&self, scene_id: &str) {
        self.store.move_to_front(scene_id);
        tracing::debug!(scene_id, "Scene prioritized");
    }

    /// Logical unload: flip the state, trip the cancel token so the worker
    /// abandons any in-flight stream, and defer GPU handle release to the
    /// render thread through the upload queue.
    pub fn unload(&self, scene_id: &str) {
        let Some(desc) = self.store.get(scene_id) else {
            return;
        };

        desc.state.store(SceneState::Unloaded);
        desc.cancel.cancel();
        desc.bump_generation();

        let staging = self.staging_dir.join(scene_id);
        let weak = Arc::downgrade(&desc);
        self.uploads.push(Box::new(move |renderer| {
            let Some(desc) = weak.upgrade() else { return };
            let mut shared = desc.lock();
            if desc.state.load() != SceneState::Unloaded {
                // Re-enqueued before we ran; the new attempt owns the slots
                // and adoption already swept the old handles.
                return;
            }
            for handle in shared.mesh_handles.drain(..) {
                renderer.destroy_mesh(handle);
            }
            shared.clear();
            drop(shared);
            let _ = std::fs::remove_dir_all(&staging);
        }));

        tracing::info!(scene_id, "Scene unload requested");
    }

    /// Stop and join the admission thread. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SceneScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Walk the store in current order and promote UNLOADED scenes until the cap
/// is reached. QUEUED counts against the cap alongside LOADING and LOADED,
/// otherwise a pass racing the workers' claims could admit past it.
fn admit_pass(store: &SceneStore, loader: &SceneLoader, max_loading: usize) {
    let snapshot = store.snapshot();
    let active = snapshot
        .iter()
        .filter(|d| {
            matches!(
                d.state.load(),
                SceneState::Queued | SceneState::Loading | SceneState::Loaded
            )
        })
        .count();

    let mut to_start = max_loading.saturating_sub(active);
    for desc in &snapshot {
        if to_start == 0 {
            break;
        }
        if desc.state.load() == SceneState::Unloaded && loader.enqueue(desc) {
            to_start -= 1;
        }
    }
}
