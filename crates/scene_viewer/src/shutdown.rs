//! Ordered teardown of the loading pipeline: stop admissions, cancel
//! in-flight loads, drain the upload queue with a bounded wait, join the
//! workers, release every GPU handle. Each step tolerates the previous one
//! having already (partially) happened.

use crate::renderer::MeshRenderer;
use crate::scene::loader::SceneLoader;
use crate::scene::scheduler::SceneScheduler;
use crate::scene::store::SceneStore;
use crate::ui_log::UiLog;
use crate::upload::UploadQueue;
use std::time::Duration;

pub const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
const DRAIN_IDLE_GRACE: Duration = Duration::from_millis(100);

pub fn run(
    scheduler: &SceneScheduler,
    loader: &SceneLoader,
    store: &SceneStore,
    uploads: &UploadQueue,
    renderer: &mut dyn MeshRenderer,
    ui_log: &UiLog,
) {
    // 1. No new admissions.
    scheduler.stop();
    ui_log.append("Shutdown: scheduler stopped");

    // 2. Cancel everything in flight and close the job queue so workers come
    //    home after their current item.
    for desc in store.snapshot() {
        desc.cancel.cancel();
    }
    loader.request_stop();
    ui_log.append("Shutdown: cancelled in-flight loads");

    // 3. Bounded drain: no CPU buffer is orphaned and every installed handle
    //    is known to the store before the GPU context goes away.
    let dropped = uploads.drain_for(renderer, DRAIN_DEADLINE, DRAIN_IDLE_GRACE);
    if dropped > 0 {
        tracing::warn!(dropped, "Upload queue drain timed out; dropping remaining tasks");
        ui_log.append(&format!(
            "Shutdown: upload drain timed out, {dropped} tasks dropped"
        ));
    } else {
        ui_log.append("Shutdown: upload queue drained");
    }

    // 4. Join workers, then sweep any task pushed between the drain deadline
    //    and the final join.
    loader.join();
    uploads.drain(renderer);
    ui_log.append("Shutdown: loader workers joined");

    // 5. Release every GPU handle still held by descriptors.
    let mut released = 0usize;
    for desc in store.snapshot() {
        let mut shared = desc.lock();
        for handle in shared.mesh_handles.drain(..) {
            if !handle.is_null() {
                renderer.destroy_mesh(handle);
                released += 1;
            }
        }
    }
    tracing::info!(released, "Released scene mesh handles");
    ui_log.append(&format!("Shutdown: released {released} mesh handles"));
}
