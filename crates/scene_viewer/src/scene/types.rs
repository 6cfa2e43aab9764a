//! Shared descriptor types for the streaming pipeline.
//!
//! A descriptor is read by the render thread every frame while loader workers
//! mutate it, so the hot fields (state, per-model byte counters) are atomics,
//! and everything that is rewritten wholesale at manifest adoption sits
//! behind a single mutex.

use crate::renderer::MeshHandle;
use glam::{Mat4, Vec3};
use parking_lot::{Mutex, MutexGuard};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use thiserror::Error;

/// Why a single load attempt stopped. Errors are confined to one descriptor's
/// attempt; they never poison the worker pool or the scheduler.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("scene or model not found on the server")]
    NotFound,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("staged file could not be parsed as a mesh: {0}")]
    ParseFailed(String),
    #[error("cancelled by unload or shutdown")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

/// Lifecycle of one registered scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SceneState {
    Unloaded = 0,
    Queued = 1,
    Loading = 2,
    Loaded = 3,
    Error = 4,
}

impl SceneState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SceneState::Unloaded,
            1 => SceneState::Queued,
            2 => SceneState::Loading,
            3 => SceneState::Loaded,
            _ => SceneState::Error,
        }
    }
}

/// Atomic cell holding a `SceneState`.
#[derive(Debug)]
pub struct AtomicSceneState(AtomicU8);

impl AtomicSceneState {
    pub fn new(state: SceneState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> SceneState {
        SceneState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: SceneState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Transition only if the current state is `from`; returns whether it did.
    pub fn transition(&self, from: SceneState, to: SceneState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Cooperative cancellation flag shared between the UI, the scheduler and the
/// streaming client, which polls it between chunk reads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Re-arm before a fresh load attempt.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Per-model byte progress, published lock-free by the streaming worker and
/// polled by the UI every frame.
#[derive(Debug)]
pub struct ModelProgress {
    pub name: String,
    pub rel_path: String,
    pub size_bytes: u64,
    bytes_received: AtomicU64,
    parsed: AtomicBool,
}

impl ModelProgress {
    pub fn new(name: String, rel_path: String, size_bytes: u64) -> Self {
        Self {
            name,
            rel_path,
            size_bytes,
            bytes_received: AtomicU64::new(0),
            parsed: AtomicBool::new(false),
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    /// Monotonic: values below the current counter are ignored, and the
    /// counter never exceeds `size_bytes`.
    pub fn set_bytes_received(&self, got: u64) {
        self.bytes_received
            .fetch_max(got.min(self.size_bytes), Ordering::AcqRel);
    }

    pub fn parsed(&self) -> bool {
        self.parsed.load(Ordering::Acquire)
    }

    pub fn mark_parsed(&self) {
        self.parsed.store(true, Ordering::Release);
    }
}

/// Bounding sphere in post-normalization coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelBounds {
    pub center: Vec3,
    pub radius: f32,
}

impl Default for ModelBounds {
    fn default() -> Self {
        Self {
            center: Vec3::ZERO,
            radius: 0.0,
        }
    }
}

/// Parsed geometry handed from a loader worker to the renderer.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MeshData {
    /// Flat x,y,z triples.
    pub positions: Vec<f32>,
    /// Triangle-list indices into `positions`.
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }
}

/// Manifest-sized state: rewritten as a unit when a manifest is adopted,
/// cleared on unload. The four parallel vectors stay the same length while a
/// scene is LOADING or LOADED.
#[derive(Default)]
pub struct SceneContents {
    pub models: Vec<Arc<ModelProgress>>,
    pub mesh_handles: Vec<MeshHandle>,
    pub model_transforms: Vec<Mat4>,
    pub model_bounds: Vec<ModelBounds>,
    pub thumbnail: Vec<u8>,
}

impl SceneContents {
    /// Replace everything with freshly initialized slots for `models`.
    pub fn adopt(&mut self, models: Vec<Arc<ModelProgress>>, thumbnail: Vec<u8>) {
        let n = models.len();
        self.models = models;
        self.mesh_handles = vec![MeshHandle::NULL; n];
        self.model_transforms = vec![Mat4::IDENTITY; n];
        self.model_bounds = vec![ModelBounds::default(); n];
        self.thumbnail = thumbnail;
    }

    pub fn clear(&mut self) {
        self.models.clear();
        self.mesh_handles.clear();
        self.model_transforms.clear();
        self.model_bounds.clear();
        self.thumbnail.clear();
    }

    /// `(total_bytes, received_bytes)` across all models, for progress
    /// displays.
    pub fn byte_totals(&self) -> (u64, u64) {
        let mut total = 0u64;
        let mut got = 0u64;
        for model in &self.models {
            total += model.size_bytes;
            got += model.bytes_received();
        }
        (total, got)
    }
}

/// The shared record for one registered scene. Created by `Register`, lives
/// for the rest of the process; only its contents are cleared on unload.
pub struct SceneDescriptor {
    pub scene_id: String,
    pub state: AtomicSceneState,
    pub current_model_index: AtomicUsize,
    pub cancel: CancelToken,
    /// Bumped at every manifest adoption and unload so upload tasks enqueued
    /// for a previous attempt can tell they are stale.
    generation: AtomicU64,
    shared: Mutex<SceneContents>,
}

impl SceneDescriptor {
    pub fn new(scene_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            scene_id: scene_id.into(),
            state: AtomicSceneState::new(SceneState::Unloaded),
            current_model_index: AtomicUsize::new(0),
            cancel: CancelToken::new(),
            generation: AtomicU64::new(0),
            shared: Mutex::new(SceneContents::default()),
        })
    }

    /// Lock the manifest-sized contents. Hold briefly: the render thread
    /// takes this lock every frame.
    pub fn lock(&self) -> MutexGuard<'_, SceneContents> {
        self.shared.lock()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// The active model index clamped into `[0, model_count)`; 0 when the
    /// scene has no models.
    pub fn active_model_index(&self, model_count: usize) -> usize {
        if model_count == 0 {
            return 0;
        }
        self.current_model_index
            .load(Ordering::Acquire)
            .min(model_count - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions_are_guarded() {
        let state = AtomicSceneState::new(SceneState::Queued);
        assert!(state.transition(SceneState::Queued, SceneState::Loading));
        // A second claim of the same descriptor must fail.
        assert!(!state.transition(SceneState::Queued, SceneState::Loading));
        assert_eq!(state.load(), SceneState::Loading);

        assert!(!state.transition(SceneState::Loaded, SceneState::Unloaded));
        assert!(state.transition(SceneState::Loading, SceneState::Loaded));
    }

    #[test]
    fn progress_is_monotonic_and_clamped() {
        let progress = ModelProgress::new("m".into(), "m.obj".into(), 100);
        progress.set_bytes_received(40);
        progress.set_bytes_received(10);
        assert_eq!(progress.bytes_received(), 40);
        progress.set_bytes_received(500);
        assert_eq!(progress.bytes_received(), 100);
    }

    #[test]
    fn cancel_token_resets_for_a_new_attempt() {
        let token = CancelToken::new();
        let alias = token.clone();
        token.cancel();
        assert!(alias.is_cancelled());
        alias.reset();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn adoption_keeps_the_parallel_vectors_aligned() {
        let desc = SceneDescriptor::new("s");
        let models = vec![
            Arc::new(ModelProgress::new("a".into(), "a.obj".into(), 10)),
            Arc::new(ModelProgress::new("b".into(), "b.obj".into(), 20)),
        ];
        let mut shared = desc.lock();
        shared.adopt(models, vec![1, 2, 3]);
        assert_eq!(shared.models.len(), 2);
        assert_eq!(shared.mesh_handles.len(), 2);
        assert_eq!(shared.model_transforms.len(), 2);
        assert_eq!(shared.model_bounds.len(), 2);
        assert!(shared.mesh_handles.iter().all(|h| h.is_null()));
        assert_eq!(shared.byte_totals(), (30, 0));
    }

    #[test]
    fn active_model_index_is_clamped() {
        let desc = SceneDescriptor::new("s");
        assert_eq!(desc.active_model_index(0), 0);
        desc.current_model_index.store(7, Ordering::Release);
        assert_eq!(desc.active_model_index(3), 2);
    }
}
