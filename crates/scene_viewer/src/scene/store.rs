//! Insertion-ordered registry of scene descriptors, shared by the UI, the
//! scheduler and the loader workers.

use super::types::SceneDescriptor;
use parking_lot::Mutex;
use std::sync::Arc;

/// Structural mutations of the map serialize on the inner lock; a
/// descriptor's own contents are guarded by its own lock.
#[derive(Default)]
pub struct SceneStore {
    scenes: Mutex<Vec<Arc<SceneDescriptor>>>,
}

impl SceneStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent register: returns the existing descriptor untouched, or
    /// appends a fresh UNLOADED one.
    pub fn get_or_create(&self, scene_id: &str) -> Arc<SceneDescriptor> {
        let mut scenes = self.scenes.lock();
        if let Some(found) = scenes.iter().find(|d| d.scene_id == scene_id) {
            return found.clone();
        }
        let desc = SceneDescriptor::new(scene_id);
        scenes.push(desc.clone());
        desc
    }

    pub fn get(&self, scene_id: &str) -> Option<Arc<SceneDescriptor>> {
        self.scenes
            .lock()
            .iter()
            .find(|d| d.scene_id == scene_id)
            .cloned()
    }

    /// Shared references to every descriptor in current order, for iteration
    /// outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<SceneDescriptor>> {
        self.scenes.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.scenes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reposition a scene at the head of the order so the next admission pass
    /// considers it first. Unknown ids are ignored.
    pub fn move_to_front(&self, scene_id: &str) {
        let mut scenes = self.scenes.lock();
        if let Some(pos) = scenes.iter().position(|d| d.scene_id == scene_id) {
            let desc = scenes.remove(pos);
            scenes.insert(0, desc);
        }
    }
}
