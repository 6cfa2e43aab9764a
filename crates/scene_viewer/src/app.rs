//! Per-frame glue between the pipeline and the renderer: drains the upload
//! queue, samples the fault probe, emits sparse progress lines, and turns
//! loaded scenes into draw calls.

use crate::fault::FaultProbe;
use crate::renderer::{MeshDraw, MeshRenderer};
use crate::scene::store::SceneStore;
use crate::scene::types::SceneState;
use crate::ui_log::UiLog;
use crate::upload::UploadQueue;
use glam::{Mat4, Vec3};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lateral spacing between scene slots on the ground row.
const SCENE_SPACING: f32 = 2.0;

const MODEL_COLOR: Vec3 = Vec3::new(0.8, 0.8, 0.9);

pub struct FrameContext {
    pub store: Arc<SceneStore>,
    pub uploads: Arc<UploadQueue>,
    pub ui_log: Arc<UiLog>,
    pub fault_probe: Option<FaultProbe>,
    pub fault_report_path: PathBuf,
    progress: ProgressLog,
}

impl FrameContext {
    pub fn new(store: Arc<SceneStore>, uploads: Arc<UploadQueue>, ui_log: Arc<UiLog>) -> Self {
        Self {
            store,
            uploads,
            ui_log,
            fault_probe: None,
            fault_report_path: PathBuf::from("fault_test_results.txt"),
            progress: ProgressLog::new(),
        }
    }

    /// Top-of-frame bookkeeping. Returns the draw list for this frame.
    pub fn begin_frame(&mut self, renderer: &mut dyn MeshRenderer) -> Vec<MeshDraw> {
        self.uploads.drain(renderer);
        self.progress.observe(&self.store, &self.ui_log);

        if let Some(probe) = self.fault_probe.as_mut() {
            if let Some(summary) = probe.tick(&self.store) {
                self.ui_log.append(&format!(
                    "FaultProbe: completed - duration={:.3}s stalls={} recoveries={} max_stall={:.3}s avg_throughput={:.0} B/s",
                    summary.duration.as_secs_f64(),
                    summary.stalls,
                    summary.recoveries,
                    summary.max_stall.as_secs_f64(),
                    summary.avg_throughput_bps
                ));
                match probe.export(&self.fault_report_path) {
                    Ok(()) => self.ui_log.append(&format!(
                        "FaultProbe: exported {}",
                        self.fault_report_path.display()
                    )),
                    Err(e) => tracing::warn!(error = %e, "Failed to export fault report"),
                }
                self.fault_probe = None;
            }
        }

        self.collect_draws()
    }

    /// Every LOADED scene contributes its active model, placed at the
    /// scene's slot on the row. Models whose upload has not executed yet are
    /// skipped; LOADED does not imply the handle is installed.
    fn collect_draws(&self) -> Vec<MeshDraw> {
        let mut draws = Vec::new();
        for (slot, desc) in self.store.snapshot().iter().enumerate() {
            if desc.state.load() != SceneState::Loaded {
                continue;
            }

            let shared = desc.lock();
            if shared.mesh_handles.is_empty() {
                continue;
            }
            let active = desc.active_model_index(shared.mesh_handles.len());
            let handle = shared.mesh_handles[active];
            if handle.is_null() {
                continue;
            }

            let base = Vec3::new(slot as f32 * SCENE_SPACING, 0.5, 0.0);
            let model = Mat4::from_translation(base) * shared.model_transforms[active];
            draws.push(MeshDraw {
                handle,
                model,
                color: MODEL_COLOR,
            });
        }
        draws
    }
}

/// Fixed orbit camera looking down the scene row; camera control proper is
/// outside this pipeline.
pub fn view_proj(aspect: f32, scene_count: usize) -> Mat4 {
    let mid = scene_count.saturating_sub(1) as f32 * SCENE_SPACING * 0.5;
    let eye = Vec3::new(mid, 2.5, 7.0);
    let target = Vec3::new(mid, 0.4, 0.0);
    let view = Mat4::look_at_rh(eye, target, Vec3::Y);
    let proj = Mat4::perspective_rh(60f32.to_radians(), aspect.max(0.01), 0.05, 200.0);
    proj * view
}

/// Sparse cumulative progress logging: a line per whole percent or per
/// second, only while something is actually queued or loading.
struct ProgressLog {
    last_pct: f64,
    last_at: Instant,
}

impl ProgressLog {
    fn new() -> Self {
        Self {
            last_pct: -1.0,
            last_at: Instant::now(),
        }
    }

    fn observe(&mut self, store: &SceneStore, ui_log: &UiLog) {
        let snapshot = store.snapshot();
        let busy = snapshot
            .iter()
            .any(|d| matches!(d.state.load(), SceneState::Queued | SceneState::Loading));
        if !busy {
            return;
        }

        let mut total = 0u64;
        let mut got = 0u64;
        for desc in &snapshot {
            let (t, g) = desc.lock().byte_totals();
            total += t;
            got += g;
        }
        if total == 0 {
            return;
        }

        let pct = got as f64 / total as f64;
        if (pct - self.last_pct).abs() >= 0.01 || self.last_at.elapsed() >= Duration::from_secs(1)
        {
            ui_log.append(&format!(
                "Loading progress: {:.1}% ({got} / {total} bytes)",
                pct * 100.0
            ));
            self.last_pct = pct;
            self.last_at = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::NullRenderer;
    use crate::scene::types::ModelProgress;
    use std::sync::Arc as StdArc;

    #[test]
    fn collect_draws_skips_pending_and_null_handles() {
        let store = Arc::new(SceneStore::new());
        let uploads = Arc::new(UploadQueue::new());
        let dir = tempfile::tempdir().unwrap();
        let ui_log = Arc::new(UiLog::new(dir.path().join("log.txt")));

        // One loaded scene with an installed handle, one still loading.
        let loaded = store.get_or_create("a");
        loaded.lock().adopt(
            vec![StdArc::new(ModelProgress::new("m".into(), "m.obj".into(), 1))],
            Vec::new(),
        );
        loaded.state.store(SceneState::Loaded);

        let pending = store.get_or_create("b");
        pending.lock().adopt(
            vec![StdArc::new(ModelProgress::new("m".into(), "m.obj".into(), 1))],
            Vec::new(),
        );
        pending.state.store(SceneState::Loading);

        let mut frame = FrameContext::new(store, uploads, ui_log);
        let mut renderer = NullRenderer::new();

        // LOADED but handle still null: nothing to draw yet.
        assert!(frame.begin_frame(&mut renderer).is_empty());

        let handle = renderer.upload_mesh(&[0.0; 9], &[0, 1, 2]);
        loaded.lock().mesh_handles[0] = handle;
        let draws = frame.begin_frame(&mut renderer);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].handle, handle);
    }
}
