//! Rendering backend seam. Mesh upload and release sit behind a small trait
//! so the loading pipeline runs unchanged against the real wgpu backend or a
//! null backend in tests and headless mode.

pub mod context;
pub mod mesh;

use glam::{Mat4, Vec3};

/// Opaque GPU mesh identifier. Zero means "not yet uploaded or already
/// released".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MeshHandle(pub u64);

impl MeshHandle {
    pub const NULL: MeshHandle = MeshHandle(0);

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// One mesh instance for the current frame.
#[derive(Debug, Clone, Copy)]
pub struct MeshDraw {
    pub handle: MeshHandle,
    pub model: Mat4,
    pub color: Vec3,
}

/// Capability interface upload tasks run against. GPU work is only legal on
/// the render thread, so implementations are not required to be `Sync`.
pub trait MeshRenderer {
    /// Upload CPU buffers and return a non-null handle.
    fn upload_mesh(&mut self, positions: &[f32], indices: &[u32]) -> MeshHandle;

    /// Release the GPU resources behind `handle`. Null handles are ignored.
    fn destroy_mesh(&mut self, handle: MeshHandle);
}

/// Counting no-op backend used by tests and `--headless` runs.
#[derive(Debug, Default)]
pub struct NullRenderer {
    next_id: u64,
    pub uploads: usize,
    pub destroys: usize,
    pub live_meshes: usize,
}

impl NullRenderer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MeshRenderer for NullRenderer {
    fn upload_mesh(&mut self, _positions: &[f32], _indices: &[u32]) -> MeshHandle {
        self.next_id += 1;
        self.uploads += 1;
        self.live_meshes += 1;
        MeshHandle(self.next_id)
    }

    fn destroy_mesh(&mut self, handle: MeshHandle) {
        if handle.is_null() {
            return;
        }
        self.destroys += 1;
        self.live_meshes = self.live_meshes.saturating_sub(1);
    }
}
